use crate::ipc::error::HandlerErr;
use crate::ipc::types::{AppState, OpenSheet};
use crate::matrix::ScoreInput;
use crate::store::{SheetContext, SheetKey};
use rusqlite::Connection;
use serde_json::Value;

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state.db.as_ref().ok_or_else(HandlerErr::no_workspace)
}

pub fn require_sheet(state: &AppState) -> Result<&OpenSheet, HandlerErr> {
    state.sheet.as_ref().ok_or_else(HandlerErr::no_sheet)
}

pub fn require_sheet_mut(state: &mut AppState) -> Result<&mut OpenSheet, HandlerErr> {
    state.sheet.as_mut().ok_or_else(HandlerErr::no_sheet)
}

pub fn require_db_and_sheet(
    state: &mut AppState,
) -> Result<(&Connection, &mut OpenSheet), HandlerErr> {
    let conn = state.db.as_ref().ok_or_else(HandlerErr::no_workspace)?;
    let open = state.sheet.as_mut().ok_or_else(HandlerErr::no_sheet)?;
    Ok((conn, open))
}

pub fn settings_err(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

/// Trimmed, non-empty string parameter.
pub fn get_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    get_str(params, key).ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn sheet_key(params: &Value) -> Result<SheetKey, HandlerErr> {
    Ok(SheetKey {
        school_id: get_required_str(params, "schoolId")?,
        class_id: get_required_str(params, "classId")?,
        term: get_required_str(params, "term")?,
        exam_type: get_required_str(params, "examType")?,
        academic_year: get_required_str(params, "academicYear")?,
    })
}

pub fn sheet_context(params: &Value) -> Result<SheetContext, HandlerErr> {
    Ok(SheetContext {
        key: sheet_key(params)?,
        actor_id: get_required_str(params, "actorId")?,
    })
}

/// `null`, a missing value or a blank string clear the cell; numbers and
/// numeric strings set it.
pub fn score_input(v: Option<&Value>) -> Result<ScoreInput, HandlerErr> {
    match v {
        None | Some(Value::Null) => Ok(ScoreInput::Clear),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(ScoreInput::Value)
            .ok_or_else(|| HandlerErr::bad_params("value is not a finite number")),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(ScoreInput::Clear),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(ScoreInput::Value)
            .map_err(|_| HandlerErr::bad_params(format!("value {:?} is not a number", s))),
        Some(other) => Err(HandlerErr::bad_params(format!(
            "value must be a number or null, got {}",
            other
        ))),
    }
}

pub fn optional_component(params: &Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match score_input(params.get(key))? {
        ScoreInput::Clear => Ok(None),
        ScoreInput::Value(v) => Ok(Some(v)),
    }
}

pub fn cell_address(params: &Value) -> Result<(String, String), HandlerErr> {
    Ok((
        get_required_str(params, "studentId")?,
        get_required_str(params, "subjectId")?,
    ))
}
