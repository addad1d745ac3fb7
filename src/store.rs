use crate::calc::{CurriculumKind, PerformanceLevel};
use crate::error::StoreError;
use crate::submission::SubmissionStatus;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub display_name: String,
    pub admission_no: String,
    pub roll_no: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    pub name: String,
    pub code: Option<String>,
    pub teacher_id: Option<String>,
}

/// Identifies one grading sheet. Together with student and subject it forms
/// the natural key of a persisted grade row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetKey {
    pub school_id: String,
    pub class_id: String,
    pub term: String,
    pub exam_type: String,
    pub academic_year: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetContext {
    #[serde(flatten)]
    pub key: SheetKey,
    pub actor_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRow {
    pub school_id: String,
    pub student_id: String,
    pub subject_id: String,
    pub class_id: String,
    pub term: String,
    pub exam_type: String,
    pub academic_year: String,
    pub curriculum: CurriculumKind,
    pub score: Option<f64>,
    pub percentage: Option<i64>,
    pub letter_grade: Option<String>,
    pub performance_level: Option<String>,
    pub strand_levels: BTreeMap<String, PerformanceLevel>,
    pub coursework_score: Option<f64>,
    pub exam_score: Option<f64>,
    pub remarks: Option<String>,
    pub status: SubmissionStatus,
    pub submitted_by: Option<String>,
    pub submitted_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRecord {
    pub id: String,
    #[serde(flatten)]
    pub key: SheetKey,
    pub actor_id: String,
    pub subject_ids: Vec<String>,
    pub status: SubmissionStatus,
    pub row_count: usize,
    pub submitted_at: Option<String>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<String>,
    pub review_note: Option<String>,
}

/// Source of the ordered student and subject lists for a sheet.
/// Empty vectors mean "nothing there", never an error.
pub trait RosterProvider {
    fn students(&self, school_id: &str, class_id: &str) -> Result<Vec<Student>, StoreError>;

    fn subjects(
        &self,
        school_id: &str,
        class_id: &str,
        teacher_id: Option<&str>,
    ) -> Result<Vec<Subject>, StoreError>;
}

/// Grade persistence. Upserts replace whole rows on the natural key.
pub trait GradeStore {
    fn upsert(&self, rows: &[ScoreRow]) -> Result<usize, StoreError>;

    fn fetch(&self, key: &SheetKey) -> Result<Vec<ScoreRow>, StoreError>;

    fn upsert_submission(&self, record: &SubmissionRecord) -> Result<(), StoreError>;

    fn fetch_submission(
        &self,
        key: &SheetKey,
        actor_id: &str,
    ) -> Result<Option<SubmissionRecord>, StoreError>;

    /// Writes the record's review fields and moves its submitted rows to the
    /// record's status. Returns the number of rows moved.
    fn record_review(&self, record: &SubmissionRecord) -> Result<usize, StoreError>;

    fn save_batch(&self, rows: &[ScoreRow], record: &SubmissionRecord) -> Result<usize, StoreError> {
        let written = self.upsert(rows)?;
        self.upsert_submission(record)?;
        Ok(written)
    }
}

pub struct SqliteStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn submissions_for(&self, key: &SheetKey) -> Result<Vec<SubmissionRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, school_id, class_id, term, exam_type, academic_year, actor_id,
                    subject_ids, status, row_count, submitted_at, reviewed_by, reviewed_at, review_note
             FROM grade_submissions
             WHERE school_id = ? AND class_id = ? AND term = ? AND exam_type = ? AND academic_year = ?
             ORDER BY actor_id",
        )?;
        let raw = stmt
            .query_map(
                params![
                    key.school_id,
                    key.class_id,
                    key.term,
                    key.exam_type,
                    key.academic_year
                ],
                raw_submission,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawSubmission::into_record).collect()
    }

    /// Writes archived rows and submission records in one transaction.
    pub fn import_batch(
        &self,
        rows: &[ScoreRow],
        records: &[SubmissionRecord],
    ) -> Result<(usize, usize), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let written = Self::upsert_rows_on(&tx, rows)?;
        for record in records {
            Self::upsert_submission_on(&tx, record)?;
        }
        tx.commit()?;
        Ok((written, records.len()))
    }

    fn upsert_rows_on(conn: &Connection, rows: &[ScoreRow]) -> Result<usize, StoreError> {
        let mut stmt = conn.prepare(
            "INSERT INTO grade_rows(
               id, school_id, student_id, subject_id, class_id, term, exam_type, academic_year,
               curriculum, score, percentage, letter_grade, performance_level, strand_levels,
               coursework_score, exam_score, remarks, status, submitted_by, submitted_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
             ON CONFLICT(school_id, student_id, subject_id, class_id, term, exam_type, academic_year)
             DO UPDATE SET
               curriculum = excluded.curriculum,
               score = excluded.score,
               percentage = excluded.percentage,
               letter_grade = excluded.letter_grade,
               performance_level = excluded.performance_level,
               strand_levels = excluded.strand_levels,
               coursework_score = excluded.coursework_score,
               exam_score = excluded.exam_score,
               remarks = excluded.remarks,
               status = excluded.status,
               submitted_by = excluded.submitted_by,
               submitted_at = excluded.submitted_at",
        )?;
        let mut written = 0usize;
        for row in rows {
            let strands = if row.strand_levels.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&row.strand_levels)?)
            };
            written += stmt.execute(params![
                Uuid::new_v4().to_string(),
                row.school_id,
                row.student_id,
                row.subject_id,
                row.class_id,
                row.term,
                row.exam_type,
                row.academic_year,
                row.curriculum.as_str(),
                row.score,
                row.percentage,
                row.letter_grade,
                row.performance_level,
                strands,
                row.coursework_score,
                row.exam_score,
                row.remarks,
                row.status.as_str(),
                row.submitted_by,
                row.submitted_at,
            ])?;
        }
        Ok(written)
    }

    fn upsert_submission_on(conn: &Connection, record: &SubmissionRecord) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO grade_submissions(
               id, school_id, class_id, term, exam_type, academic_year, actor_id,
               subject_ids, status, row_count, submitted_at, reviewed_by, reviewed_at, review_note)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(school_id, class_id, term, exam_type, academic_year, actor_id)
             DO UPDATE SET
               subject_ids = excluded.subject_ids,
               status = excluded.status,
               row_count = excluded.row_count,
               submitted_at = excluded.submitted_at,
               reviewed_by = excluded.reviewed_by,
               reviewed_at = excluded.reviewed_at,
               review_note = excluded.review_note",
            params![
                record.id,
                record.key.school_id,
                record.key.class_id,
                record.key.term,
                record.key.exam_type,
                record.key.academic_year,
                record.actor_id,
                serde_json::to_string(&record.subject_ids)?,
                record.status.as_str(),
                record.row_count as i64,
                record.submitted_at,
                record.reviewed_by,
                record.reviewed_at,
                record.review_note,
            ],
        )?;
        Ok(())
    }
}

impl RosterProvider for SqliteStore<'_> {
    fn students(&self, school_id: &str, class_id: &str) -> Result<Vec<Student>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.display_name, s.admission_no, s.roll_no
             FROM students s
             JOIN classes c ON c.id = s.class_id
             WHERE c.school_id = ? AND s.class_id = ? AND s.active = 1
             ORDER BY s.sort_order, s.display_name",
        )?;
        let students = stmt
            .query_map((school_id, class_id), |r| {
                Ok(Student {
                    id: r.get(0)?,
                    display_name: r.get(1)?,
                    admission_no: r.get(2)?,
                    roll_no: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(students)
    }

    fn subjects(
        &self,
        school_id: &str,
        class_id: &str,
        teacher_id: Option<&str>,
    ) -> Result<Vec<Subject>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT sj.id, sj.name, sj.code, sj.teacher_id
             FROM subjects sj
             JOIN classes c ON c.id = sj.class_id
             WHERE c.school_id = ?1 AND sj.class_id = ?2
               AND (?3 IS NULL OR sj.teacher_id = ?3)
             ORDER BY sj.sort_order, sj.name",
        )?;
        let subjects = stmt
            .query_map(params![school_id, class_id, teacher_id], |r| {
                Ok(Subject {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    code: r.get(2)?,
                    teacher_id: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(subjects)
    }
}

impl GradeStore for SqliteStore<'_> {
    fn upsert(&self, rows: &[ScoreRow]) -> Result<usize, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let written = Self::upsert_rows_on(&tx, rows)?;
        tx.commit()?;
        Ok(written)
    }

    fn fetch(&self, key: &SheetKey) -> Result<Vec<ScoreRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT school_id, student_id, subject_id, class_id, term, exam_type, academic_year,
                    curriculum, score, percentage, letter_grade, performance_level, strand_levels,
                    coursework_score, exam_score, remarks, status, submitted_by, submitted_at
             FROM grade_rows
             WHERE school_id = ? AND class_id = ? AND term = ? AND exam_type = ? AND academic_year = ?
             ORDER BY student_id, subject_id",
        )?;
        let raw = stmt
            .query_map(
                params![
                    key.school_id,
                    key.class_id,
                    key.term,
                    key.exam_type,
                    key.academic_year
                ],
                raw_score_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawScoreRow::into_row).collect()
    }

    fn upsert_submission(&self, record: &SubmissionRecord) -> Result<(), StoreError> {
        Self::upsert_submission_on(self.conn, record)
    }

    fn fetch_submission(
        &self,
        key: &SheetKey,
        actor_id: &str,
    ) -> Result<Option<SubmissionRecord>, StoreError> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, school_id, class_id, term, exam_type, academic_year, actor_id,
                        subject_ids, status, row_count, submitted_at, reviewed_by, reviewed_at, review_note
                 FROM grade_submissions
                 WHERE school_id = ? AND class_id = ? AND term = ? AND exam_type = ?
                   AND academic_year = ? AND actor_id = ?",
                params![
                    key.school_id,
                    key.class_id,
                    key.term,
                    key.exam_type,
                    key.academic_year,
                    actor_id
                ],
                raw_submission,
            )
            .optional()?;
        raw.map(RawSubmission::into_record).transpose()
    }

    fn record_review(&self, record: &SubmissionRecord) -> Result<usize, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE grade_submissions
             SET status = ?, reviewed_by = ?, reviewed_at = ?, review_note = ?
             WHERE id = ?",
            params![
                record.status.as_str(),
                record.reviewed_by,
                record.reviewed_at,
                record.review_note,
                record.id
            ],
        )?;
        let moved = tx.execute(
            "UPDATE grade_rows
             SET status = ?1
             WHERE school_id = ?2 AND class_id = ?3 AND term = ?4 AND exam_type = ?5
               AND academic_year = ?6 AND submitted_by = ?7 AND status = 'submitted'",
            params![
                record.status.as_str(),
                record.key.school_id,
                record.key.class_id,
                record.key.term,
                record.key.exam_type,
                record.key.academic_year,
                record.actor_id
            ],
        )?;
        tx.commit()?;
        Ok(moved)
    }

    /// Rows and record share one transaction: either both land or neither.
    fn save_batch(&self, rows: &[ScoreRow], record: &SubmissionRecord) -> Result<usize, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let written = Self::upsert_rows_on(&tx, rows)?;
        Self::upsert_submission_on(&tx, record)?;
        tx.commit()?;
        Ok(written)
    }
}

struct RawScoreRow {
    school_id: String,
    student_id: String,
    subject_id: String,
    class_id: String,
    term: String,
    exam_type: String,
    academic_year: String,
    curriculum: String,
    score: Option<f64>,
    percentage: Option<i64>,
    letter_grade: Option<String>,
    performance_level: Option<String>,
    strand_levels: Option<String>,
    coursework_score: Option<f64>,
    exam_score: Option<f64>,
    remarks: Option<String>,
    status: String,
    submitted_by: Option<String>,
    submitted_at: Option<String>,
}

fn raw_score_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<RawScoreRow> {
    Ok(RawScoreRow {
        school_id: r.get(0)?,
        student_id: r.get(1)?,
        subject_id: r.get(2)?,
        class_id: r.get(3)?,
        term: r.get(4)?,
        exam_type: r.get(5)?,
        academic_year: r.get(6)?,
        curriculum: r.get(7)?,
        score: r.get(8)?,
        percentage: r.get(9)?,
        letter_grade: r.get(10)?,
        performance_level: r.get(11)?,
        strand_levels: r.get(12)?,
        coursework_score: r.get(13)?,
        exam_score: r.get(14)?,
        remarks: r.get(15)?,
        status: r.get(16)?,
        submitted_by: r.get(17)?,
        submitted_at: r.get(18)?,
    })
}

impl RawScoreRow {
    fn into_row(self) -> Result<ScoreRow, StoreError> {
        let curriculum = CurriculumKind::parse(&self.curriculum)
            .ok_or_else(|| StoreError::Corrupt(format!("curriculum {:?}", self.curriculum)))?;
        let status = SubmissionStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("status {:?}", self.status)))?;
        let strand_levels = match self.strand_levels.as_deref() {
            None | Some("") => BTreeMap::new(),
            Some(text) => serde_json::from_str(text)?,
        };
        Ok(ScoreRow {
            school_id: self.school_id,
            student_id: self.student_id,
            subject_id: self.subject_id,
            class_id: self.class_id,
            term: self.term,
            exam_type: self.exam_type,
            academic_year: self.academic_year,
            curriculum,
            score: self.score,
            percentage: self.percentage,
            letter_grade: self.letter_grade,
            performance_level: self.performance_level,
            strand_levels,
            coursework_score: self.coursework_score,
            exam_score: self.exam_score,
            remarks: self.remarks,
            status,
            submitted_by: self.submitted_by,
            submitted_at: self.submitted_at,
        })
    }
}

struct RawSubmission {
    id: String,
    key: SheetKey,
    actor_id: String,
    subject_ids: String,
    status: String,
    row_count: i64,
    submitted_at: Option<String>,
    reviewed_by: Option<String>,
    reviewed_at: Option<String>,
    review_note: Option<String>,
}

fn raw_submission(r: &rusqlite::Row<'_>) -> rusqlite::Result<RawSubmission> {
    Ok(RawSubmission {
        id: r.get(0)?,
        key: SheetKey {
            school_id: r.get(1)?,
            class_id: r.get(2)?,
            term: r.get(3)?,
            exam_type: r.get(4)?,
            academic_year: r.get(5)?,
        },
        actor_id: r.get(6)?,
        subject_ids: r.get(7)?,
        status: r.get(8)?,
        row_count: r.get(9)?,
        submitted_at: r.get(10)?,
        reviewed_by: r.get(11)?,
        reviewed_at: r.get(12)?,
        review_note: r.get(13)?,
    })
}

impl RawSubmission {
    fn into_record(self) -> Result<SubmissionRecord, StoreError> {
        let status = SubmissionStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("status {:?}", self.status)))?;
        Ok(SubmissionRecord {
            id: self.id,
            key: self.key,
            actor_id: self.actor_id,
            subject_ids: serde_json::from_str(&self.subject_ids)?,
            status,
            row_count: self.row_count.max(0) as usize,
            submitted_at: self.submitted_at,
            reviewed_by: self.reviewed_by,
            reviewed_at: self.reviewed_at,
            review_note: self.review_note,
        })
    }
}
