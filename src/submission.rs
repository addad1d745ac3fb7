use crate::error::{GradeError, Result};
use crate::matrix::GradeMatrix;
use crate::store::{GradeStore, SheetContext, SheetKey, SubmissionRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

const REVIEW_NOTE_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Draft,
    Submitted,
    Approved,
    Rejected,
}

impl SubmissionStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "submitted" => Some(Self::Submitted),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    Reject,
}

impl ReviewDecision {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Some(Self::Approve),
            "reject" | "rejected" => Some(Self::Reject),
            _ => None,
        }
    }

    fn status(self) -> SubmissionStatus {
        match self {
            Self::Approve => SubmissionStatus::Approved,
            Self::Reject => SubmissionStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub submission_id: String,
    pub status: SubmissionStatus,
    pub rows_written: usize,
    pub submitted_at: Option<String>,
}

pub fn validate_context(ctx: &SheetContext) -> Result<()> {
    let fields = [
        ("schoolId", &ctx.key.school_id),
        ("classId", &ctx.key.class_id),
        ("term", &ctx.key.term),
        ("examType", &ctx.key.exam_type),
        ("academicYear", &ctx.key.academic_year),
        ("actorId", &ctx.actor_id),
    ];
    for (name, value) in fields {
        if value.trim().is_empty() {
            return Err(GradeError::validation(format!("{} is required", name)));
        }
    }
    Ok(())
}

/// Persists every entry as a draft row. Drafts carry no submitter stamp.
pub fn save_draft(
    matrix: &mut GradeMatrix,
    ctx: &SheetContext,
    store: &dyn GradeStore,
) -> Result<SaveOutcome> {
    validate_context(ctx)?;
    persist(matrix, ctx, store, SubmissionStatus::Draft, None)
}

/// Persists the sheet as submitted. Refused before any store access when no
/// cell holds a score.
pub fn submit_for_approval(
    matrix: &mut GradeMatrix,
    ctx: &SheetContext,
    store: &dyn GradeStore,
    now: DateTime<Utc>,
) -> Result<SaveOutcome> {
    validate_context(ctx)?;
    if !matrix.has_scores() {
        return Err(GradeError::validation("nothing to submit"));
    }
    persist(
        matrix,
        ctx,
        store,
        SubmissionStatus::Submitted,
        Some(now.to_rfc3339()),
    )
}

fn persist(
    matrix: &mut GradeMatrix,
    ctx: &SheetContext,
    store: &dyn GradeStore,
    status: SubmissionStatus,
    submitted_at: Option<String>,
) -> Result<SaveOutcome> {
    let existing = store.fetch_submission(&ctx.key, &ctx.actor_id)?;
    // Approval is final; only the approver moves a batch out of `submitted`.
    if existing
        .as_ref()
        .is_some_and(|r| r.status == SubmissionStatus::Approved)
    {
        return Err(GradeError::validation("submission already approved"));
    }
    let rows = matrix.to_rows(ctx, status, submitted_at.as_deref());
    let record = SubmissionRecord {
        id: existing
            .map(|r| r.id)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        key: ctx.key.clone(),
        actor_id: ctx.actor_id.clone(),
        subject_ids: matrix.subjects().iter().map(|s| s.id.clone()).collect(),
        status,
        row_count: rows.len(),
        submitted_at: submitted_at.clone(),
        reviewed_by: None,
        reviewed_at: None,
        review_note: None,
    };
    let rows_written = store.save_batch(&rows, &record)?;
    matrix.mark_saved();
    info!(
        submission_id = %record.id,
        status = status.as_str(),
        rows = rows_written,
        class_id = %ctx.key.class_id,
        "grade sheet saved"
    );
    Ok(SaveOutcome {
        submission_id: record.id,
        status,
        rows_written,
        submitted_at,
    })
}

/// Approver transition. Only a submitted batch can be approved or rejected.
pub fn review(
    store: &dyn GradeStore,
    key: &SheetKey,
    actor_id: &str,
    reviewer_id: &str,
    decision: ReviewDecision,
    note: Option<&str>,
    now: DateTime<Utc>,
) -> Result<SubmissionRecord> {
    if reviewer_id.trim().is_empty() {
        return Err(GradeError::validation("reviewerId is required"));
    }
    let note = note.map(str::trim).filter(|n| !n.is_empty());
    if note.is_some_and(|n| n.chars().count() > REVIEW_NOTE_MAX_CHARS) {
        return Err(GradeError::validation(format!(
            "note must be at most {} characters",
            REVIEW_NOTE_MAX_CHARS
        )));
    }

    let mut record = store
        .fetch_submission(key, actor_id)?
        .ok_or_else(|| GradeError::not_found(format!("no submission from {}", actor_id)))?;
    if record.status != SubmissionStatus::Submitted {
        return Err(GradeError::validation(format!(
            "cannot review a {} submission",
            record.status.as_str()
        )));
    }

    record.status = decision.status();
    record.reviewed_by = Some(reviewer_id.trim().to_string());
    record.reviewed_at = Some(now.to_rfc3339());
    record.review_note = note.map(str::to_string);
    let moved = store.record_review(&record)?;
    info!(
        submission_id = %record.id,
        status = record.status.as_str(),
        rows = moved,
        "submission reviewed"
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::CurriculumKind;
    use crate::db;
    use crate::error::StoreError;
    use crate::matrix::{GradingOptions, ScoreInput};
    use crate::store::{ScoreRow, SqliteStore, Student, Subject};
    use chrono::TimeZone;
    use rusqlite::Connection;
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct CountingStore {
        calls: Cell<usize>,
        fail: bool,
        rows: RefCell<Vec<ScoreRow>>,
        records: RefCell<Vec<SubmissionRecord>>,
    }

    impl CountingStore {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn tick(&self) -> std::result::Result<(), StoreError> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return Err(StoreError::Db(rusqlite::Error::InvalidQuery));
            }
            Ok(())
        }
    }

    impl GradeStore for CountingStore {
        fn upsert(&self, rows: &[ScoreRow]) -> std::result::Result<usize, StoreError> {
            self.tick()?;
            let mut stored = self.rows.borrow_mut();
            for row in rows {
                stored.retain(|r| {
                    !(r.student_id == row.student_id && r.subject_id == row.subject_id)
                });
                stored.push(row.clone());
            }
            Ok(rows.len())
        }

        fn fetch(&self, _key: &SheetKey) -> std::result::Result<Vec<ScoreRow>, StoreError> {
            self.tick()?;
            Ok(self.rows.borrow().clone())
        }

        fn upsert_submission(
            &self,
            record: &SubmissionRecord,
        ) -> std::result::Result<(), StoreError> {
            self.tick()?;
            let mut records = self.records.borrow_mut();
            records.retain(|r| r.actor_id != record.actor_id);
            records.push(record.clone());
            Ok(())
        }

        fn fetch_submission(
            &self,
            _key: &SheetKey,
            actor_id: &str,
        ) -> std::result::Result<Option<SubmissionRecord>, StoreError> {
            self.tick()?;
            Ok(self
                .records
                .borrow()
                .iter()
                .find(|r| r.actor_id == actor_id)
                .cloned())
        }

        fn record_review(
            &self,
            record: &SubmissionRecord,
        ) -> std::result::Result<usize, StoreError> {
            self.upsert_submission(record)?;
            let mut moved = 0;
            for row in self.rows.borrow_mut().iter_mut() {
                if row.status == SubmissionStatus::Submitted
                    && row.submitted_by.as_deref() == Some(record.actor_id.as_str())
                {
                    row.status = record.status;
                    moved += 1;
                }
            }
            Ok(moved)
        }
    }

    fn ctx(actor: &str) -> SheetContext {
        SheetContext {
            key: SheetKey {
                school_id: "s1".into(),
                class_id: "c1".into(),
                term: "T1".into(),
                exam_type: "final".into(),
                academic_year: "2026".into(),
            },
            actor_id: actor.into(),
        }
    }

    fn matrix() -> GradeMatrix {
        let students = ["st-1", "st-2"]
            .iter()
            .map(|id| Student {
                id: id.to_string(),
                display_name: id.to_string(),
                admission_no: id.to_string(),
                roll_no: None,
            })
            .collect();
        let subjects = vec![Subject {
            id: "math".into(),
            name: "Math".into(),
            code: None,
            teacher_id: None,
        }];
        GradeMatrix::new(
            CurriculumKind::Standard,
            GradingOptions::default(),
            students,
            subjects,
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn submit_without_scores_touches_no_store() {
        let store = CountingStore::default();
        let mut m = matrix();
        m.set_remark("st-1", "math", Some("absent")).expect("remark");
        let err = submit_for_approval(&mut m, &ctx("t1"), &store, now())
            .expect_err("nothing to submit");
        assert!(matches!(err, GradeError::Validation(_)));
        assert_eq!(store.calls.get(), 0);
        assert!(m.is_dirty());
    }

    #[test]
    fn blank_context_field_is_rejected_before_io() {
        let store = CountingStore::default();
        let mut m = matrix();
        let mut c = ctx("t1");
        c.key.term = "  ".into();
        assert!(matches!(
            save_draft(&mut m, &c, &store),
            Err(GradeError::Validation(_))
        ));
        assert_eq!(store.calls.get(), 0);
    }

    #[test]
    fn draft_then_submit_reuses_the_record() {
        let store = CountingStore::default();
        let mut m = matrix();
        m.set_score("st-1", "math", ScoreInput::Value(71.0)).expect("score");

        let draft = save_draft(&mut m, &ctx("t1"), &store).expect("draft");
        assert_eq!(draft.status, SubmissionStatus::Draft);
        assert_eq!(draft.rows_written, 1);
        assert!(!m.is_dirty());
        assert!(store.rows.borrow()[0].submitted_by.is_none());

        let submitted = submit_for_approval(&mut m, &ctx("t1"), &store, now()).expect("submit");
        assert_eq!(submitted.submission_id, draft.submission_id);
        assert_eq!(
            submitted.submitted_at.as_deref(),
            Some("2026-10-19T08:30:00+00:00")
        );
        let rows = store.rows.borrow();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, SubmissionStatus::Submitted);
        assert_eq!(rows[0].submitted_by.as_deref(), Some("t1"));
        assert_eq!(store.records.borrow()[0].subject_ids, vec!["math".to_string()]);
    }

    #[test]
    fn persistence_failure_keeps_matrix_dirty() {
        let store = CountingStore::failing();
        let mut m = matrix();
        m.set_score("st-2", "math", ScoreInput::Value(40.0)).expect("score");
        let err = save_draft(&mut m, &ctx("t1"), &store).expect_err("store down");
        assert!(matches!(err, GradeError::Persistence(_)));
        assert_eq!(err.code(), "persistence_error");
        assert!(m.is_dirty());
    }

    #[test]
    fn review_only_from_submitted() {
        let store = CountingStore::default();
        let mut m = matrix();
        m.set_score("st-1", "math", ScoreInput::Value(88.0)).expect("score");
        save_draft(&mut m, &ctx("t1"), &store).expect("draft");

        let key = ctx("t1").key;
        let err = review(&store, &key, "t1", "hod", ReviewDecision::Approve, None, now())
            .expect_err("draft cannot be approved");
        assert!(matches!(err, GradeError::Validation(_)));

        submit_for_approval(&mut m, &ctx("t1"), &store, now()).expect("submit");
        let rejected = review(
            &store,
            &key,
            "t1",
            "hod",
            ReviewDecision::Reject,
            Some("  recheck math  "),
            now(),
        )
        .expect("reject");
        assert_eq!(rejected.status, SubmissionStatus::Rejected);
        assert_eq!(rejected.review_note.as_deref(), Some("recheck math"));
        assert_eq!(store.rows.borrow()[0].status, SubmissionStatus::Rejected);

        let again = review(&store, &key, "t1", "hod", ReviewDecision::Approve, None, now());
        assert!(matches!(again, Err(GradeError::Validation(_))));

        let resubmitted = submit_for_approval(&mut m, &ctx("t1"), &store, now()).expect("resubmit");
        assert_eq!(resubmitted.status, SubmissionStatus::Submitted);
        let approved = review(&store, &key, "t1", "hod", ReviewDecision::Approve, None, now())
            .expect("approve");
        assert_eq!(approved.status, SubmissionStatus::Approved);
        assert_eq!(approved.review_note, None);

        let missing = review(&store, &key, "nobody", "hod", ReviewDecision::Approve, None, now());
        assert!(matches!(missing, Err(GradeError::NotFound(_))));
    }

    #[test]
    fn approved_batch_cannot_be_saved_over() {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        let store = SqliteStore::new(&conn);
        let key = ctx("t1").key;

        let mut m = matrix();
        m.set_score("st-1", "math", ScoreInput::Value(77.0)).expect("score");
        submit_for_approval(&mut m, &ctx("t1"), &store, now()).expect("submit");
        review(&store, &key, "t1", "hod", ReviewDecision::Approve, Some("ok"), now())
            .expect("approve");

        m.set_score("st-1", "math", ScoreInput::Value(12.0)).expect("edit");
        let draft = save_draft(&mut m, &ctx("t1"), &store).expect_err("approved is final");
        assert!(matches!(draft, GradeError::Validation(_)));
        let resubmit = submit_for_approval(&mut m, &ctx("t1"), &store, now())
            .expect_err("approved is final");
        assert!(matches!(resubmit, GradeError::Validation(_)));
        assert!(m.is_dirty());

        let record = store
            .fetch_submission(&key, "t1")
            .expect("fetch")
            .expect("record");
        assert_eq!(record.status, SubmissionStatus::Approved);
        assert_eq!(record.reviewed_by.as_deref(), Some("hod"));
        assert_eq!(record.review_note.as_deref(), Some("ok"));
        let rows = store.fetch(&key).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, SubmissionStatus::Approved);
        assert_eq!(rows[0].score, Some(77.0));
    }

    #[test]
    fn repeated_drafts_upsert_without_touching_other_rows() {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        let store = SqliteStore::new(&conn);

        let mut other = matrix();
        other.set_score("st-2", "math", ScoreInput::Value(64.0)).expect("score");
        // Another teacher's submitted row under the same sheet key.
        let mut foreign = other.to_rows(&ctx("t9"), SubmissionStatus::Submitted, Some("earlier"));
        foreign[0].subject_id = "eng".into();
        store.upsert(&foreign).expect("seed");

        let mut m = matrix();
        m.set_score("st-1", "math", ScoreInput::Value(55.0)).expect("score");
        save_draft(&mut m, &ctx("t1"), &store).expect("first");
        save_draft(&mut m, &ctx("t1"), &store).expect("second");

        let rows = store.fetch(&ctx("t1").key).expect("fetch");
        assert_eq!(rows.len(), 2);
        let eng = rows.iter().find(|r| r.subject_id == "eng").expect("foreign row");
        assert_eq!(eng.submitted_by.as_deref(), Some("t9"));
        assert_eq!(eng.submitted_at.as_deref(), Some("earlier"));
        assert_eq!(store.submissions_for(&ctx("t1").key).expect("records").len(), 1);
    }
}
