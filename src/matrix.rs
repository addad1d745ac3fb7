use crate::calc::{self, CurriculumKind, Grade, Mark, PerformanceLevel, RankPolicy, StudentSummary};
use crate::error::{GradeError, Result};
use crate::store::{ScoreRow, SheetContext, Student, Subject};
use crate::submission::SubmissionStatus;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

pub const REMARK_MAX_CHARS: usize = 500;
pub const BULK_EDIT_LIMIT: usize = 5000;
const STRAND_NAME_MAX_CHARS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutOfRangePolicy {
    /// Refuse the edit; the cell keeps its previous value.
    Reject,
    /// Clear the cell and report it.
    Clear,
}

impl OutOfRangePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(Self::Reject),
            "clear" => Some(Self::Clear),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::Clear => "clear",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradingOptions {
    pub rank_policy: RankPolicy,
    pub out_of_range: OutOfRangePolicy,
    /// Coursework share of the IGCSE combined score, in percent.
    pub igcse_coursework_weight: f64,
}

impl Default for GradingOptions {
    fn default() -> Self {
        Self {
            rank_policy: RankPolicy::Position,
            out_of_range: OutOfRangePolicy::Reject,
            igcse_coursework_weight: 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreInput {
    Clear,
    Value(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SetOutcome {
    Stored,
    Cleared,
    ClearedOutOfRange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreEdit {
    pub student_id: String,
    pub subject_id: String,
    pub input: ScoreInput,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreEntry {
    mark: Option<Mark>,
    remark: Option<String>,
    strand_levels: BTreeMap<String, PerformanceLevel>,
    coursework: Option<f64>,
    exam: Option<f64>,
}

impl ScoreEntry {
    pub fn mark(&self) -> Option<&Mark> {
        self.mark.as_ref()
    }

    pub fn score(&self) -> Option<f64> {
        self.mark.map(|m| m.score)
    }

    pub fn percentage(&self) -> Option<i64> {
        self.mark.map(|m| m.percentage)
    }

    pub fn grade(&self) -> Option<Grade> {
        self.mark.map(|m| m.grade)
    }

    pub fn remark(&self) -> Option<&str> {
        self.remark.as_deref()
    }

    pub fn strand_levels(&self) -> &BTreeMap<String, PerformanceLevel> {
        &self.strand_levels
    }

    pub fn components(&self) -> (Option<f64>, Option<f64>) {
        (self.coursework, self.exam)
    }

    pub fn view(&self, student_id: &str, subject_id: &str) -> CellView {
        let (coursework, exam) = self.components();
        CellView {
            student_id: student_id.to_string(),
            subject_id: subject_id.to_string(),
            score: self.score(),
            percentage: self.percentage(),
            grade: self.grade(),
            remark: self.remark().map(str::to_string),
            strand_levels: self.strand_levels().clone(),
            coursework,
            exam,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellView {
    pub student_id: String,
    pub subject_id: String,
    pub score: Option<f64>,
    pub percentage: Option<i64>,
    pub grade: Option<Grade>,
    pub remark: Option<String>,
    pub strand_levels: BTreeMap<String, PerformanceLevel>,
    pub coursework: Option<f64>,
    pub exam: Option<f64>,
}

/// In-memory grading sheet for one class/term/exam selection.
///
/// Entries only exist for cells that were loaded or edited; a cell that was
/// cleared keeps an (empty) entry so the clear is persisted on the next save.
#[derive(Debug, Clone)]
pub struct GradeMatrix {
    curriculum: CurriculumKind,
    options: GradingOptions,
    students: Vec<Student>,
    subjects: Vec<Subject>,
    entries: HashMap<String, HashMap<String, ScoreEntry>>,
    summaries: Vec<StudentSummary>,
    dirty: bool,
}

impl GradeMatrix {
    pub fn new(
        curriculum: CurriculumKind,
        options: GradingOptions,
        students: Vec<Student>,
        subjects: Vec<Subject>,
    ) -> Self {
        let mut m = Self {
            curriculum,
            options,
            students,
            subjects,
            entries: HashMap::new(),
            summaries: Vec::new(),
            dirty: false,
        };
        m.recompute_summaries();
        m
    }

    pub fn curriculum(&self) -> CurriculumKind {
        self.curriculum
    }

    pub fn options(&self) -> &GradingOptions {
        &self.options
    }

    pub fn students(&self) -> &[Student] {
        &self.students
    }

    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    pub fn summaries(&self) -> &[StudentSummary] {
        &self.summaries
    }

    pub fn summary_for(&self, student_id: &str) -> Option<&StudentSummary> {
        self.summaries.iter().find(|s| s.student_id == student_id)
    }

    pub fn entry(&self, student_id: &str, subject_id: &str) -> Option<&ScoreEntry> {
        self.entries.get(student_id)?.get(subject_id)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_saved(&mut self) {
        self.dirty = false;
    }

    pub fn has_scores(&self) -> bool {
        self.entries
            .values()
            .flat_map(|row| row.values())
            .any(|e| e.mark.is_some())
    }

    pub fn set_score(
        &mut self,
        student_id: &str,
        subject_id: &str,
        input: ScoreInput,
    ) -> Result<SetOutcome> {
        let outcome = self.apply_score(student_id, subject_id, input)?;
        self.recompute_summaries();
        Ok(outcome)
    }

    /// Applies every edit independently and recomputes once at the end.
    /// A payload over [`BULK_EDIT_LIMIT`] is refused as a whole.
    pub fn bulk_set_scores(&mut self, edits: &[ScoreEdit]) -> Result<Vec<Result<SetOutcome>>> {
        if edits.len() > BULK_EDIT_LIMIT {
            return Err(GradeError::validation(format!(
                "at most {} edits per call",
                BULK_EDIT_LIMIT
            )));
        }
        let results: Vec<Result<SetOutcome>> = edits
            .iter()
            .map(|e| self.apply_score(&e.student_id, &e.subject_id, e.input))
            .collect();
        if results.iter().any(|r| r.is_ok()) {
            self.recompute_summaries();
        }
        Ok(results)
    }

    fn apply_score(
        &mut self,
        student_id: &str,
        subject_id: &str,
        input: ScoreInput,
    ) -> Result<SetOutcome> {
        self.ensure_cell(student_id, subject_id)?;
        let (mark, outcome) = match input {
            ScoreInput::Clear => (None, SetOutcome::Cleared),
            ScoreInput::Value(v) if calc::in_score_range(v) => {
                (Some(self.curriculum.mark(v)), SetOutcome::Stored)
            }
            ScoreInput::Value(v) => match self.options.out_of_range {
                OutOfRangePolicy::Reject => {
                    return Err(GradeError::validation(format!(
                        "score {} is outside 0..=100",
                        v
                    )))
                }
                OutOfRangePolicy::Clear => (None, SetOutcome::ClearedOutOfRange),
            },
        };
        let entry = self.entry_mut(student_id, subject_id);
        entry.mark = mark;
        // A directly entered score supersedes IGCSE components.
        entry.coursework = None;
        entry.exam = None;
        self.dirty = true;
        Ok(outcome)
    }

    /// IGCSE only: combined = coursework * w + exam * (1 - w).
    pub fn set_components(
        &mut self,
        student_id: &str,
        subject_id: &str,
        coursework: Option<f64>,
        exam: Option<f64>,
    ) -> Result<SetOutcome> {
        self.ensure_cell(student_id, subject_id)?;
        if self.curriculum != CurriculumKind::Igcse {
            return Err(GradeError::validation(
                "coursework/exam components apply to igcse sheets only",
            ));
        }

        let mut outcome = SetOutcome::Stored;
        let mut parts = [coursework, exam];
        for (name, slot) in ["coursework", "exam"].iter().zip(parts.iter_mut()) {
            let Some(v) = *slot else {
                continue;
            };
            if calc::in_score_range(v) {
                continue;
            }
            match self.options.out_of_range {
                OutOfRangePolicy::Reject => {
                    return Err(GradeError::validation(format!(
                        "{} score {} is outside 0..=100",
                        name, v
                    )))
                }
                OutOfRangePolicy::Clear => {
                    *slot = None;
                    outcome = SetOutcome::ClearedOutOfRange;
                }
            }
        }
        let [coursework, exam] = parts;

        let w = self.options.igcse_coursework_weight;
        let mark = match (coursework, exam) {
            (Some(c), Some(e)) => Some(self.curriculum.mark((c * w + e * (100.0 - w)) / 100.0)),
            _ => None,
        };
        if mark.is_none() && outcome == SetOutcome::Stored {
            outcome = SetOutcome::Cleared;
        }

        let entry = self.entry_mut(student_id, subject_id);
        entry.coursework = coursework;
        entry.exam = exam;
        entry.mark = mark;
        self.dirty = true;
        self.recompute_summaries();
        Ok(outcome)
    }

    pub fn set_remark(
        &mut self,
        student_id: &str,
        subject_id: &str,
        remark: Option<&str>,
    ) -> Result<()> {
        self.ensure_cell(student_id, subject_id)?;
        let remark = remark.map(str::trim).filter(|r| !r.is_empty());
        if let Some(r) = remark {
            if r.chars().count() > REMARK_MAX_CHARS {
                return Err(GradeError::validation(format!(
                    "remark must be at most {} characters",
                    REMARK_MAX_CHARS
                )));
            }
        }
        self.entry_mut(student_id, subject_id).remark = remark.map(str::to_string);
        self.dirty = true;
        Ok(())
    }

    /// CBC only. `None` removes the strand.
    pub fn set_strand_level(
        &mut self,
        student_id: &str,
        subject_id: &str,
        strand: &str,
        level: Option<PerformanceLevel>,
    ) -> Result<()> {
        self.ensure_cell(student_id, subject_id)?;
        if self.curriculum != CurriculumKind::Cbc {
            return Err(GradeError::validation(
                "strand levels apply to cbc sheets only",
            ));
        }
        let strand = strand.trim();
        if strand.is_empty() || strand.chars().count() > STRAND_NAME_MAX_CHARS {
            return Err(GradeError::validation(format!(
                "strand name must be 1..={} characters",
                STRAND_NAME_MAX_CHARS
            )));
        }
        let entry = self.entry_mut(student_id, subject_id);
        match level {
            Some(l) => {
                entry.strand_levels.insert(strand.to_string(), l);
            }
            None => {
                entry.strand_levels.remove(strand);
            }
        }
        self.dirty = true;
        Ok(())
    }

    pub fn recompute_summaries(&mut self) {
        let summaries = {
            let cohort: Vec<(&str, Vec<f64>)> = self
                .students
                .iter()
                .map(|st| {
                    let row = self.entries.get(&st.id);
                    let scores = self
                        .subjects
                        .iter()
                        .filter_map(|sj| row.and_then(|r| r.get(&sj.id)).and_then(|e| e.score()))
                        .collect();
                    (st.id.as_str(), scores)
                })
                .collect();
            calc::summarize(cohort, self.options.rank_policy)
        };
        self.summaries = summaries;
    }

    /// Replaces the roster. Entries for students or subjects no longer
    /// listed are dropped from memory. Returns how many entries were dropped.
    pub fn apply_roster(&mut self, students: Vec<Student>, subjects: Vec<Subject>) -> usize {
        self.students = students;
        self.subjects = subjects;
        let before: usize = self.entries.values().map(|r| r.len()).sum();

        let students = &self.students;
        let subjects = &self.subjects;
        self.entries
            .retain(|student_id, _| students.iter().any(|s| &s.id == student_id));
        for row in self.entries.values_mut() {
            row.retain(|subject_id, _| subjects.iter().any(|s| &s.id == subject_id));
        }
        self.entries.retain(|_, row| !row.is_empty());

        let after: usize = self.entries.values().map(|r| r.len()).sum();
        self.recompute_summaries();
        before - after
    }

    /// Pre-populates from persisted rows. Rows outside the roster are
    /// ignored and derived fields are recomputed with this sheet's
    /// curriculum. Loading does not make the sheet dirty.
    pub fn load_rows(&mut self, rows: &[ScoreRow]) -> usize {
        let mut loaded = 0usize;
        for row in rows {
            if !self.is_on_roster(&row.student_id, &row.subject_id) {
                debug!(
                    student_id = %row.student_id,
                    subject_id = %row.subject_id,
                    "skipping stored row outside the roster"
                );
                continue;
            }
            let mark = match row.score {
                Some(v) if calc::in_score_range(v) => Some(self.curriculum.mark(v)),
                Some(v) => {
                    warn!(
                        student_id = %row.student_id,
                        subject_id = %row.subject_id,
                        score = v,
                        "stored score outside 0..=100; loading as empty"
                    );
                    None
                }
                None => None,
            };
            let curriculum = self.curriculum;
            let entry = self.entry_mut(&row.student_id, &row.subject_id);
            entry.mark = mark;
            entry.remark = row.remarks.clone().filter(|r| !r.trim().is_empty());
            entry.strand_levels = row.strand_levels.clone();
            if curriculum == CurriculumKind::Igcse {
                entry.coursework = row.coursework_score;
                entry.exam = row.exam_score;
            }
            loaded += 1;
        }
        self.recompute_summaries();
        loaded
    }

    /// One row per entry, in roster order. Cleared cells become rows with
    /// null score fields so the clear overwrites what was stored.
    pub fn to_rows(
        &self,
        ctx: &SheetContext,
        status: SubmissionStatus,
        submitted_at: Option<&str>,
    ) -> Vec<ScoreRow> {
        let submitted_by = match status {
            SubmissionStatus::Draft => None,
            _ => Some(ctx.actor_id.clone()),
        };
        let mut rows = Vec::new();
        for st in &self.students {
            for sj in &self.subjects {
                let Some(entry) = self.entry(&st.id, &sj.id) else {
                    continue;
                };
                let (coursework_score, exam_score) = entry.components();
                rows.push(ScoreRow {
                    school_id: ctx.key.school_id.clone(),
                    student_id: st.id.clone(),
                    subject_id: sj.id.clone(),
                    class_id: ctx.key.class_id.clone(),
                    term: ctx.key.term.clone(),
                    exam_type: ctx.key.exam_type.clone(),
                    academic_year: ctx.key.academic_year.clone(),
                    curriculum: self.curriculum,
                    score: entry.score(),
                    percentage: entry.percentage(),
                    letter_grade: entry.grade().and_then(Grade::letter).map(str::to_string),
                    performance_level: entry.grade().and_then(Grade::level).map(str::to_string),
                    strand_levels: entry.strand_levels().clone(),
                    coursework_score,
                    exam_score,
                    remarks: entry.remark().map(str::to_string),
                    status,
                    submitted_by: submitted_by.clone(),
                    submitted_at: submitted_at.map(str::to_string),
                });
            }
        }
        rows
    }

    pub fn cells(&self) -> Vec<CellView> {
        let mut out = Vec::new();
        for st in &self.students {
            for sj in &self.subjects {
                if let Some(entry) = self.entry(&st.id, &sj.id) {
                    out.push(entry.view(&st.id, &sj.id));
                }
            }
        }
        out
    }

    fn is_on_roster(&self, student_id: &str, subject_id: &str) -> bool {
        self.students.iter().any(|s| s.id == student_id)
            && self.subjects.iter().any(|s| s.id == subject_id)
    }

    fn ensure_cell(&self, student_id: &str, subject_id: &str) -> Result<()> {
        if !self.students.iter().any(|s| s.id == student_id) {
            return Err(GradeError::not_found(format!(
                "student {} is not on this sheet",
                student_id
            )));
        }
        if !self.subjects.iter().any(|s| s.id == subject_id) {
            return Err(GradeError::not_found(format!(
                "subject {} is not on this sheet",
                subject_id
            )));
        }
        Ok(())
    }

    fn entry_mut(&mut self, student_id: &str, subject_id: &str) -> &mut ScoreEntry {
        self.entries
            .entry(student_id.to_string())
            .or_default()
            .entry(subject_id.to_string())
            .or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::LetterGrade;
    use crate::store::SheetKey;

    fn student(id: &str) -> Student {
        Student {
            id: id.to_string(),
            display_name: id.to_uppercase(),
            admission_no: format!("ADM-{}", id),
            roll_no: None,
        }
    }

    fn subject(id: &str) -> Subject {
        Subject {
            id: id.to_string(),
            name: id.to_string(),
            code: None,
            teacher_id: None,
        }
    }

    fn sheet(curriculum: CurriculumKind, options: GradingOptions) -> GradeMatrix {
        GradeMatrix::new(
            curriculum,
            options,
            vec![student("a"), student("b"), student("c")],
            vec![subject("math"), subject("eng")],
        )
    }

    fn ctx() -> SheetContext {
        SheetContext {
            key: SheetKey {
                school_id: "s1".into(),
                class_id: "c1".into(),
                term: "T1".into(),
                exam_type: "midterm".into(),
                academic_year: "2026".into(),
            },
            actor_id: "teacher-1".into(),
        }
    }

    fn assert_derived_consistent(m: &GradeMatrix) {
        for st in m.students() {
            for sj in m.subjects() {
                if let Some(e) = m.entry(&st.id, &sj.id) {
                    let present = [
                        e.score().is_some(),
                        e.percentage().is_some(),
                        e.grade().is_some(),
                    ];
                    assert!(
                        present.iter().all(|p| *p) || present.iter().all(|p| !*p),
                        "partial derived state for {}/{}",
                        st.id,
                        sj.id
                    );
                }
            }
        }
    }

    #[test]
    fn reference_sheet_totals_grades_and_ranks() {
        let mut m = sheet(CurriculumKind::Standard, GradingOptions::default());
        m.set_score("a", "math", ScoreInput::Value(90.0)).expect("a math");
        m.set_score("b", "math", ScoreInput::Value(75.0)).expect("b math");
        m.set_score("c", "math", ScoreInput::Clear).expect("c math");
        m.set_score("a", "eng", ScoreInput::Value(85.0)).expect("a eng");
        m.set_score("b", "eng", ScoreInput::Value(75.0)).expect("b eng");
        m.set_score("c", "eng", ScoreInput::Value(60.0)).expect("c eng");

        let a = m.summary_for("a").expect("a");
        assert_eq!((a.percentage, a.rank), (88, Some(1)));
        let b = m.summary_for("b").expect("b");
        assert_eq!((b.percentage, b.rank), (75, Some(2)));
        let c = m.summary_for("c").expect("c");
        assert_eq!((c.percentage, c.scored_count, c.rank), (60, 1, Some(3)));

        let grade = |s: &str, j: &str| m.entry(s, j).and_then(|e| e.grade());
        assert_eq!(grade("a", "math"), Some(Grade::Letter(LetterGrade::APlus)));
        assert_eq!(grade("a", "eng"), Some(Grade::Letter(LetterGrade::A)));
        assert_eq!(grade("b", "math"), Some(Grade::Letter(LetterGrade::BPlus)));
        assert_eq!(grade("b", "eng"), Some(Grade::Letter(LetterGrade::BPlus)));
        assert_eq!(grade("c", "math"), None);
        assert_eq!(grade("c", "eng"), Some(Grade::Letter(LetterGrade::B)));
        assert_derived_consistent(&m);
    }

    #[test]
    fn out_of_range_is_rejected_and_cell_kept() {
        let mut m = sheet(CurriculumKind::Standard, GradingOptions::default());
        m.set_score("a", "math", ScoreInput::Value(40.0)).expect("seed");
        let err = m
            .set_score("a", "math", ScoreInput::Value(150.0))
            .expect_err("150 must be rejected");
        assert!(matches!(err, GradeError::Validation(_)));
        let e = m.entry("a", "math").expect("entry");
        assert_eq!(e.score(), Some(40.0));
        assert_eq!(e.grade(), Some(Grade::Letter(LetterGrade::C)));

        let err = m
            .set_score("b", "math", ScoreInput::Value(f64::NAN))
            .expect_err("NaN must be rejected");
        assert!(matches!(err, GradeError::Validation(_)));
        assert!(m.entry("b", "math").is_none());
    }

    #[test]
    fn out_of_range_clears_under_clear_policy() {
        let options = GradingOptions {
            out_of_range: OutOfRangePolicy::Clear,
            ..GradingOptions::default()
        };
        let mut m = sheet(CurriculumKind::Standard, options);
        m.set_score("a", "math", ScoreInput::Value(40.0)).expect("seed");
        let outcome = m
            .set_score("a", "math", ScoreInput::Value(150.0))
            .expect("clear policy");
        assert_eq!(outcome, SetOutcome::ClearedOutOfRange);
        let e = m.entry("a", "math").expect("entry");
        assert_eq!((e.score(), e.percentage(), e.grade()), (None, None, None));
        assert_eq!(m.summary_for("a").and_then(|s| s.rank), None);
    }

    #[test]
    fn unknown_cells_are_not_found() {
        let mut m = sheet(CurriculumKind::Standard, GradingOptions::default());
        let err = m
            .set_score("zed", "math", ScoreInput::Value(10.0))
            .expect_err("unknown student");
        assert!(matches!(err, GradeError::NotFound(_)));
        let err = m
            .set_remark("a", "art", Some("nice"))
            .expect_err("unknown subject");
        assert!(matches!(err, GradeError::NotFound(_)));
        assert!(!m.is_dirty());
    }

    #[test]
    fn derived_fields_stay_atomic_across_edit_sequences() {
        let mut m = sheet(CurriculumKind::Cbc, GradingOptions::default());
        let inputs = [
            ScoreInput::Value(12.0),
            ScoreInput::Clear,
            ScoreInput::Value(99.5),
            ScoreInput::Value(-1.0),
            ScoreInput::Value(60.0),
            ScoreInput::Clear,
        ];
        for (i, input) in inputs.iter().enumerate() {
            let sj = if i % 2 == 0 { "math" } else { "eng" };
            let _ = m.set_score("a", sj, *input);
            assert_derived_consistent(&m);
        }
    }

    #[test]
    fn equal_percentages_rank_by_roster_order() {
        let mut m = sheet(CurriculumKind::Standard, GradingOptions::default());
        m.set_score("b", "math", ScoreInput::Value(75.0)).expect("b");
        m.set_score("a", "math", ScoreInput::Value(75.0)).expect("a");
        assert_eq!(m.summary_for("a").and_then(|s| s.rank), Some(1));
        assert_eq!(m.summary_for("b").and_then(|s| s.rank), Some(2));
        assert_eq!(m.summary_for("c").and_then(|s| s.rank), None);

        let before = m.summaries().to_vec();
        m.recompute_summaries();
        assert_eq!(m.summaries(), before.as_slice());
    }

    #[test]
    fn cbc_levels_and_strands() {
        let mut m = sheet(CurriculumKind::Cbc, GradingOptions::default());
        m.set_score("a", "eng", ScoreInput::Value(65.0)).expect("score");
        m.set_strand_level("a", "eng", " Reading ", Some(PerformanceLevel::Exemplary))
            .expect("strand");
        let e = m.entry("a", "eng").expect("entry");
        assert_eq!(e.grade(), Some(Grade::Level(PerformanceLevel::Proficient)));
        assert_eq!(
            e.strand_levels().get("Reading"),
            Some(&PerformanceLevel::Exemplary)
        );
        let view = e.view("a", "eng");
        assert_eq!(view.strand_levels, e.strand_levels().clone());
        let row = m
            .to_rows(&ctx(), SubmissionStatus::Draft, None)
            .into_iter()
            .find(|r| r.student_id == "a" && r.subject_id == "eng")
            .expect("row");
        assert_eq!(
            row.strand_levels.get("Reading"),
            Some(&PerformanceLevel::Exemplary)
        );

        m.set_strand_level("a", "eng", "Reading", None).expect("remove");
        assert!(m.entry("a", "eng").expect("entry").strand_levels().is_empty());

        let mut std_sheet = sheet(CurriculumKind::Standard, GradingOptions::default());
        assert!(matches!(
            std_sheet.set_strand_level("a", "eng", "Reading", Some(PerformanceLevel::Emerging)),
            Err(GradeError::Validation(_))
        ));
    }

    #[test]
    fn igcse_components_combine_with_weight() {
        let mut m = sheet(CurriculumKind::Igcse, GradingOptions::default());
        let outcome = m
            .set_components("a", "math", Some(80.0), Some(90.0))
            .expect("components");
        assert_eq!(outcome, SetOutcome::Stored);
        let e = m.entry("a", "math").expect("entry");
        assert_eq!(e.score(), Some(87.0));
        assert_eq!(e.grade().map(Grade::as_str), Some("A"));

        let outcome = m
            .set_components("a", "math", Some(80.0), None)
            .expect("partial");
        assert_eq!(outcome, SetOutcome::Cleared);
        let e = m.entry("a", "math").expect("entry");
        assert_eq!(e.score(), None);
        assert_eq!(e.components(), (Some(80.0), None));

        m.set_score("a", "math", ScoreInput::Value(55.0)).expect("direct");
        assert_eq!(m.entry("a", "math").expect("entry").components(), (None, None));

        let mut std_sheet = sheet(CurriculumKind::Standard, GradingOptions::default());
        assert!(std_sheet
            .set_components("a", "math", Some(1.0), Some(1.0))
            .is_err());
    }

    #[test]
    fn remarks_are_trimmed_and_bounded() {
        let mut m = sheet(CurriculumKind::Standard, GradingOptions::default());
        m.set_remark("a", "math", Some("  keep going  ")).expect("remark");
        assert_eq!(m.entry("a", "math").and_then(|e| e.remark()), Some("keep going"));
        m.set_remark("a", "math", Some("   ")).expect("blank clears");
        assert_eq!(m.entry("a", "math").and_then(|e| e.remark()), None);
        let long = "x".repeat(REMARK_MAX_CHARS + 1);
        assert!(m.set_remark("a", "math", Some(&long)).is_err());
        assert!(m.is_dirty());
    }

    #[test]
    fn roster_refresh_drops_stale_entries() {
        let mut m = sheet(CurriculumKind::Standard, GradingOptions::default());
        m.set_score("a", "math", ScoreInput::Value(50.0)).expect("a");
        m.set_score("c", "eng", ScoreInput::Value(70.0)).expect("c");
        let dropped = m.apply_roster(vec![student("a"), student("b")], vec![subject("math")]);
        assert_eq!(dropped, 1);
        assert!(m.entry("c", "eng").is_none());
        assert_eq!(m.summaries().len(), 2);
        assert_eq!(m.cells().len(), 1);
    }

    #[test]
    fn load_rows_ignores_foreign_rows_and_stays_clean() {
        let mut source = sheet(CurriculumKind::Standard, GradingOptions::default());
        source.set_score("a", "math", ScoreInput::Value(91.0)).expect("a");
        source.set_remark("b", "eng", Some("absent")).expect("b");
        let mut rows = source.to_rows(&ctx(), SubmissionStatus::Draft, None);
        let mut stray = rows[0].clone();
        stray.student_id = "gone".into();
        rows.push(stray);

        let mut m = sheet(CurriculumKind::Standard, GradingOptions::default());
        let loaded = m.load_rows(&rows);
        assert_eq!(loaded, 2);
        assert!(!m.is_dirty());
        assert_eq!(m.entry("a", "math").and_then(|e| e.percentage()), Some(91));
        assert_eq!(m.entry("b", "eng").and_then(|e| e.remark()), Some("absent"));
        assert_eq!(m.summary_for("a").and_then(|s| s.rank), Some(1));
    }

    #[test]
    fn to_rows_keeps_cleared_cells_and_stamps_submitter() {
        let mut m = sheet(CurriculumKind::Standard, GradingOptions::default());
        m.set_score("a", "math", ScoreInput::Value(64.0)).expect("a");
        m.set_score("b", "math", ScoreInput::Value(30.0)).expect("b");
        m.set_score("b", "math", ScoreInput::Clear).expect("clear");

        let drafts = m.to_rows(&ctx(), SubmissionStatus::Draft, None);
        assert_eq!(drafts.len(), 2);
        assert!(drafts.iter().all(|r| r.submitted_by.is_none()));
        let cleared = drafts.iter().find(|r| r.student_id == "b").expect("b row");
        assert_eq!(
            (cleared.score, cleared.percentage, cleared.letter_grade.as_deref()),
            (None, None, None)
        );

        let submitted = m.to_rows(
            &ctx(),
            SubmissionStatus::Submitted,
            Some("2026-10-19T08:00:00+00:00"),
        );
        assert!(submitted
            .iter()
            .all(|r| r.submitted_by.as_deref() == Some("teacher-1")));
        let a = submitted.iter().find(|r| r.student_id == "a").expect("a row");
        assert_eq!(a.letter_grade.as_deref(), Some("B"));
        assert_eq!(a.performance_level, None);
    }

    #[test]
    fn bulk_edits_report_per_edit_results() {
        let mut m = sheet(CurriculumKind::Standard, GradingOptions::default());
        let edits = vec![
            ScoreEdit {
                student_id: "a".into(),
                subject_id: "math".into(),
                input: ScoreInput::Value(70.0),
            },
            ScoreEdit {
                student_id: "a".into(),
                subject_id: "eng".into(),
                input: ScoreInput::Value(101.0),
            },
            ScoreEdit {
                student_id: "nobody".into(),
                subject_id: "eng".into(),
                input: ScoreInput::Value(10.0),
            },
        ];
        let results = m.bulk_set_scores(&edits).expect("within limit");
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(GradeError::Validation(_))));
        assert!(matches!(results[2], Err(GradeError::NotFound(_))));
        assert_eq!(m.summary_for("a").map(|s| s.percentage), Some(70));

        let too_many = vec![edits[0].clone(); BULK_EDIT_LIMIT + 1];
        let mut fresh = sheet(CurriculumKind::Standard, GradingOptions::default());
        assert!(matches!(
            fresh.bulk_set_scores(&too_many),
            Err(GradeError::Validation(_))
        ));
        assert!(fresh.entry("a", "math").is_none());
        assert!(!fresh.is_dirty());
    }
}
