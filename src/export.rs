use crate::calc::{self, CurriculumKind, Grade, Mark, StudentSummary, SubjectStats};
use crate::matrix::GradeMatrix;
use crate::store::Subject;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportCell {
    pub subject_id: String,
    pub score: Option<f64>,
    pub percentage: Option<i64>,
    pub grade: Option<Grade>,
    pub remark: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRow {
    pub student_id: String,
    pub display_name: String,
    pub admission_no: String,
    pub cells: Vec<ExportCell>,
    pub summary: Option<StudentSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetStatistics {
    /// Mean percentage over students with at least one score.
    pub class_average_percentage: Option<f64>,
    pub subjects: Vec<SubjectStats>,
    pub grade_distribution: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixExport {
    pub curriculum: CurriculumKind,
    pub subjects: Vec<Subject>,
    pub rows: Vec<ExportRow>,
    pub statistics: SheetStatistics,
}

/// Read-only projection of the sheet in roster order.
pub fn export(matrix: &GradeMatrix) -> MatrixExport {
    let subjects = matrix.subjects();
    let rows: Vec<ExportRow> = matrix
        .students()
        .iter()
        .map(|st| ExportRow {
            student_id: st.id.clone(),
            display_name: st.display_name.clone(),
            admission_no: st.admission_no.clone(),
            cells: subjects
                .iter()
                .map(|sj| {
                    let entry = matrix.entry(&st.id, &sj.id);
                    ExportCell {
                        subject_id: sj.id.clone(),
                        score: entry.and_then(|e| e.score()),
                        percentage: entry.and_then(|e| e.percentage()),
                        grade: entry.and_then(|e| e.grade()),
                        remark: entry.and_then(|e| e.remark()).map(str::to_string),
                    }
                })
                .collect(),
            summary: matrix.summary_for(&st.id).cloned(),
        })
        .collect();

    let mut grade_distribution: BTreeMap<String, usize> = BTreeMap::new();
    let subject_stats: Vec<SubjectStats> = subjects
        .iter()
        .map(|sj| {
            let marks: Vec<Mark> = matrix
                .students()
                .iter()
                .filter_map(|st| matrix.entry(&st.id, &sj.id).and_then(|e| e.mark()).copied())
                .collect();
            let stats = calc::subject_stats(&sj.id, &marks);
            for (grade, n) in &stats.grade_counts {
                *grade_distribution.entry(grade.clone()).or_insert(0) += n;
            }
            stats
        })
        .collect();

    let ranked: Vec<i64> = matrix
        .summaries()
        .iter()
        .filter(|s| s.scored_count > 0)
        .map(|s| s.percentage)
        .collect();
    let class_average_percentage = if ranked.is_empty() {
        None
    } else {
        Some(calc::round_off_1_decimal(
            ranked.iter().sum::<i64>() as f64 / ranked.len() as f64,
        ))
    };

    MatrixExport {
        curriculum: matrix.curriculum(),
        subjects: subjects.to_vec(),
        rows,
        statistics: SheetStatistics {
            class_average_percentage,
            subjects: subject_stats,
            grade_distribution,
        },
    }
}

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn opt_cell<T: ToString>(v: Option<T>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}

/// One line per student: identity, then score and grade per subject, then
/// the summary columns.
pub fn to_csv(export: &MatrixExport) -> String {
    let mut header: Vec<String> = vec![
        "Student ID".to_string(),
        "Name".to_string(),
        "Admission No".to_string(),
    ];
    for sj in &export.subjects {
        header.push(csv_quote(&sj.name));
        header.push(csv_quote(&format!("{} Grade", sj.name)));
    }
    header.extend(
        ["Total", "Scored", "Percentage", "Average", "Rank"]
            .iter()
            .map(|s| s.to_string()),
    );

    let mut lines = vec![header.join(",")];
    for row in &export.rows {
        let mut cols = vec![
            csv_quote(&row.student_id),
            csv_quote(&row.display_name),
            csv_quote(&row.admission_no),
        ];
        for cell in &row.cells {
            cols.push(opt_cell(cell.score));
            cols.push(opt_cell(cell.grade.map(Grade::as_str)));
        }
        match &row.summary {
            Some(s) => {
                cols.push(s.total.to_string());
                cols.push(s.scored_count.to_string());
                cols.push(s.percentage.to_string());
                cols.push(s.average.to_string());
                cols.push(opt_cell(s.rank));
            }
            None => cols.extend(std::iter::repeat(String::new()).take(5)),
        }
        lines.push(cols.join(","));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}
