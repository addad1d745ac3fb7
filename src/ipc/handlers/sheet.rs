use crate::calc::{CurriculumKind, PerformanceLevel};
use crate::error::GradeError;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    cell_address, get_required_str, get_str, optional_component, require_db,
    require_db_and_sheet, require_sheet, require_sheet_mut, score_input, settings_err,
    sheet_context,
};
use crate::ipc::types::{AppState, OpenSheet, Request};
use crate::matrix::{GradeMatrix, ScoreEdit, SetOutcome, BULK_EDIT_LIMIT};
use crate::settings;
use crate::store::{GradeStore, RosterProvider, SheetContext, SqliteStore, Student, Subject};
use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use tracing::{info, warn};

pub fn sheet_view(open: &OpenSheet) -> Value {
    let m = &open.matrix;
    json!({
        "context": open.ctx,
        "teacherId": open.teacher_id,
        "curriculum": m.curriculum(),
        "rankPolicy": m.options().rank_policy.as_str(),
        "outOfRangePolicy": m.options().out_of_range.as_str(),
        "students": m.students(),
        "subjects": m.subjects(),
        "cells": m.cells(),
        "summaries": m.summaries(),
        "dirty": m.is_dirty()
    })
}

fn cell_json(m: &GradeMatrix, student_id: &str, subject_id: &str) -> Value {
    m.entry(student_id, subject_id)
        .map(|e| json!(e.view(student_id, subject_id)))
        .unwrap_or(Value::Null)
}

fn edit_result(
    m: &GradeMatrix,
    student_id: &str,
    subject_id: &str,
    outcome: Option<SetOutcome>,
) -> Value {
    json!({
        "outcome": outcome,
        "cell": cell_json(m, student_id, subject_id),
        "summaries": m.summaries(),
        "dirty": m.is_dirty()
    })
}

/// Active students and the (optionally teacher-filtered) subjects. A sheet
/// with nobody or nothing to grade cannot be opened.
fn load_roster(
    store: &SqliteStore<'_>,
    ctx: &SheetContext,
    teacher_id: Option<&str>,
) -> Result<(Vec<Student>, Vec<Subject>), HandlerErr> {
    let students = store.students(&ctx.key.school_id, &ctx.key.class_id)?;
    if students.is_empty() {
        return Err(GradeError::not_found("no active students in this class").into());
    }
    let subjects = store.subjects(&ctx.key.school_id, &ctx.key.class_id, teacher_id)?;
    if subjects.is_empty() {
        return Err(GradeError::not_found(match teacher_id {
            Some(_) => "no subjects assigned to this teacher in this class",
            None => "no subjects in this class",
        })
        .into());
    }
    Ok((students, subjects))
}

fn sheet_open(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let grading = settings::grading(conn).map_err(settings_err)?;

    let mut params = req.params.clone();
    if get_str(&params, "academicYear").is_none() && !grading.default_academic_year.is_empty() {
        if let Some(obj) = params.as_object_mut() {
            obj.insert(
                "academicYear".into(),
                Value::String(grading.default_academic_year.clone()),
            );
        }
    }
    let ctx = sheet_context(&params)?;
    let teacher_id = get_str(&params, "teacherId");

    let curriculum: Option<String> = conn
        .query_row(
            "SELECT curriculum FROM classes WHERE id = ? AND school_id = ?",
            (&ctx.key.class_id, &ctx.key.school_id),
            |r| r.get(0),
        )
        .optional()?;
    let Some(curriculum) = curriculum else {
        return Err(GradeError::not_found("class not found").into());
    };
    let curriculum = CurriculumKind::parse(&curriculum).ok_or_else(|| {
        HandlerErr::new("db_query_failed", format!("unknown curriculum {:?}", curriculum))
    })?;

    let store = SqliteStore::new(conn);
    let (students, subjects) = load_roster(&store, &ctx, teacher_id.as_deref())?;
    let mut matrix = GradeMatrix::new(curriculum, grading.options, students, subjects);
    let loaded = matrix.load_rows(&store.fetch(&ctx.key)?);

    if let Some(prev) = state.sheet.as_ref() {
        if prev.matrix.is_dirty() {
            warn!(class_id = %prev.ctx.key.class_id, "replacing a sheet with unsaved changes");
        }
    }
    info!(
        class_id = %ctx.key.class_id,
        term = %ctx.key.term,
        exam_type = %ctx.key.exam_type,
        curriculum = curriculum.as_str(),
        loaded,
        "sheet opened"
    );
    let open = state.sheet.insert(OpenSheet {
        ctx,
        teacher_id,
        matrix,
    });
    Ok(json!({ "loadedRows": loaded, "sheet": sheet_view(open) }))
}

fn sheet_get(state: &mut AppState, _req: &Request) -> Result<Value, HandlerErr> {
    Ok(sheet_view(require_sheet(state)?))
}

fn sheet_set_score(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let (student_id, subject_id) = cell_address(&req.params)?;
    let input = score_input(req.params.get("value"))?;
    let open = require_sheet_mut(state)?;
    let outcome = open.matrix.set_score(&student_id, &subject_id, input)?;
    Ok(edit_result(&open.matrix, &student_id, &subject_id, Some(outcome)))
}

fn sheet_bulk_set_scores(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let open = require_sheet_mut(state)?;
    let Some(edits_arr) = req.params.get("edits").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing edits[]"));
    };

    if edits_arr.len() > BULK_EDIT_LIMIT {
        let rejected = edits_arr.len();
        return Ok(json!({
            "updated": 0,
            "rejected": rejected,
            "limitExceeded": true,
            "errors": [{
                "index": -1,
                "code": "too_many_edits",
                "message": format!(
                    "bulk payload exceeds max edits: {} > {}",
                    rejected, BULK_EDIT_LIMIT
                )
            }]
        }));
    }

    let mut errors: Vec<Value> = Vec::new();
    let mut edits: Vec<ScoreEdit> = Vec::with_capacity(edits_arr.len());
    let mut indices: Vec<usize> = Vec::with_capacity(edits_arr.len());
    for (i, edit) in edits_arr.iter().enumerate() {
        let parsed = cell_address(edit)
            .and_then(|(student_id, subject_id)| {
                Ok(ScoreEdit {
                    student_id,
                    subject_id,
                    input: score_input(edit.get("value"))?,
                })
            });
        match parsed {
            Ok(e) => {
                edits.push(e);
                indices.push(i);
            }
            Err(e) => errors.push(json!({
                "index": i,
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    let results = open.matrix.bulk_set_scores(&edits)?;
    let mut updated = 0usize;
    for (i, result) in indices.into_iter().zip(results) {
        match result {
            Ok(_) => updated += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "code": e.code(),
                "message": e.to_string(),
            })),
        }
    }
    errors.sort_by_key(|e| e.get("index").and_then(|v| v.as_i64()).unwrap_or(-1));

    let mut result = json!({
        "updated": updated,
        "summaries": open.matrix.summaries(),
        "dirty": open.matrix.is_dirty()
    });
    if !errors.is_empty() {
        if let Some(obj) = result.as_object_mut() {
            obj.insert("rejected".into(), json!(errors.len()));
            obj.insert("errors".into(), json!(errors));
        }
    }
    Ok(result)
}

fn sheet_set_components(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let (student_id, subject_id) = cell_address(&req.params)?;
    let coursework = optional_component(&req.params, "coursework")?;
    let exam = optional_component(&req.params, "exam")?;
    let open = require_sheet_mut(state)?;
    let outcome = open
        .matrix
        .set_components(&student_id, &subject_id, coursework, exam)?;
    Ok(edit_result(&open.matrix, &student_id, &subject_id, Some(outcome)))
}

fn sheet_set_remark(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let (student_id, subject_id) = cell_address(&req.params)?;
    let remark = match req.params.get("remark") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.as_str()),
        Some(_) => return Err(HandlerErr::bad_params("remark must be a string or null")),
    };
    let open = require_sheet_mut(state)?;
    open.matrix.set_remark(&student_id, &subject_id, remark)?;
    Ok(edit_result(&open.matrix, &student_id, &subject_id, None))
}

fn sheet_set_strand_level(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let (student_id, subject_id) = cell_address(&req.params)?;
    let strand = get_required_str(&req.params, "strand")?;
    let level = match req.params.get("level") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            v.as_str()
                .and_then(PerformanceLevel::parse)
                .ok_or_else(|| {
                    HandlerErr::bad_params(
                        "level must be one of: Emerging, Approaching, Proficient, Exemplary",
                    )
                })?,
        ),
    };
    let open = require_sheet_mut(state)?;
    open.matrix
        .set_strand_level(&student_id, &subject_id, &strand, level)?;
    Ok(edit_result(&open.matrix, &student_id, &subject_id, None))
}

fn sheet_refresh_roster(state: &mut AppState, _req: &Request) -> Result<Value, HandlerErr> {
    let (conn, open) = require_db_and_sheet(state)?;
    let store = SqliteStore::new(conn);
    let (students, subjects) = load_roster(&store, &open.ctx, open.teacher_id.as_deref())?;
    let dropped = open.matrix.apply_roster(students, subjects);
    if dropped > 0 {
        info!(dropped, "roster refresh dropped stale entries");
    }
    Ok(json!({ "droppedEntries": dropped, "sheet": sheet_view(open) }))
}

/// Re-applies the roster of `class_id` to the open sheet after a student or
/// subject changed. `None` when no sheet of that class is open.
///
/// Unlike `sheet.refreshRoster` an emptied roster is applied as is; the
/// sheet simply has nothing left to save.
pub fn sync_open_sheet(state: &mut AppState, class_id: &str) -> Result<Option<usize>, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Ok(None);
    };
    let Some(open) = state
        .sheet
        .as_mut()
        .filter(|s| s.ctx.key.class_id == class_id)
    else {
        return Ok(None);
    };
    let store = SqliteStore::new(conn);
    let key = &open.ctx.key;
    let students = store.students(&key.school_id, &key.class_id)?;
    let subjects = store.subjects(&key.school_id, &key.class_id, open.teacher_id.as_deref())?;
    let dropped = open.matrix.apply_roster(students, subjects);
    info!(class_id, dropped, "open sheet roster synced");
    Ok(Some(dropped))
}

fn sheet_close(state: &mut AppState, _req: &Request) -> Result<Value, HandlerErr> {
    let closed = state.sheet.take();
    let discarded = closed.as_ref().is_some_and(|s| s.matrix.is_dirty());
    if discarded {
        warn!("sheet closed with unsaved changes");
    }
    Ok(json!({ "closed": closed.is_some(), "discardedChanges": discarded }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "sheet.open" => sheet_open(state, req),
        "sheet.get" => sheet_get(state, req),
        "sheet.setScore" => sheet_set_score(state, req),
        "sheet.bulkSetScores" => sheet_bulk_set_scores(state, req),
        "sheet.setComponents" => sheet_set_components(state, req),
        "sheet.setRemark" => sheet_set_remark(state, req),
        "sheet.setStrandLevel" => sheet_set_strand_level(state, req),
        "sheet.refreshRoster" => sheet_refresh_roster(state, req),
        "sheet.close" => sheet_close(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
