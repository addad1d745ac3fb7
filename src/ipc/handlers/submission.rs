use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{get_required_str, get_str, require_db, require_db_and_sheet, sheet_key};
use crate::ipc::types::{AppState, Request};
use crate::settings;
use crate::store::{GradeStore, SqliteStore};
use crate::submission::{self, ReviewDecision, SaveOutcome, SubmissionStatus};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

/// Saves the open sheet and, when enabled, queues a positions refresh.
fn save(state: &mut AppState, status: SubmissionStatus) -> Result<Value, HandlerErr> {
    let (conn, open) = require_db_and_sheet(state)?;
    let store = SqliteStore::new(conn);
    let outcome: SaveOutcome = match status {
        SubmissionStatus::Submitted => {
            submission::submit_for_approval(&mut open.matrix, &open.ctx, &store, Utc::now())?
        }
        _ => submission::save_draft(&mut open.matrix, &open.ctx, &store)?,
    };
    let key = open.ctx.key.clone();

    let auto = match settings::positions(conn) {
        Ok(p) => p.auto_recalculate,
        Err(e) => {
            warn!(error = %e, "could not read positions settings");
            false
        }
    };
    let worker = state.positions.as_ref().filter(|_| auto);
    let queued = worker.is_some();
    if let Some(worker) = worker {
        worker.schedule(key);
    }

    let mut result = json!(outcome);
    if let Some(obj) = result.as_object_mut() {
        obj.insert("positionsQueued".into(), json!(queued));
    }
    Ok(result)
}

fn sheet_save_draft(state: &mut AppState, _req: &Request) -> Result<Value, HandlerErr> {
    save(state, SubmissionStatus::Draft)
}

fn sheet_submit(state: &mut AppState, _req: &Request) -> Result<Value, HandlerErr> {
    save(state, SubmissionStatus::Submitted)
}

fn submission_get(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let key = sheet_key(&req.params)?;
    let store = SqliteStore::new(conn);
    match get_str(&req.params, "actorId") {
        Some(actor_id) => {
            let record = store.fetch_submission(&key, &actor_id)?;
            Ok(json!({ "submission": record }))
        }
        None => Ok(json!({ "submissions": store.submissions_for(&key)? })),
    }
}

fn submission_review(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let key = sheet_key(&req.params)?;
    let actor_id = get_required_str(&req.params, "actorId")?;
    let reviewer_id = get_required_str(&req.params, "reviewerId")?;
    let decision = get_required_str(&req.params, "decision")?;
    let decision = ReviewDecision::parse(&decision)
        .ok_or_else(|| HandlerErr::bad_params("decision must be approve or reject"))?;
    let note = req.params.get("note").and_then(|v| v.as_str());

    let store = SqliteStore::new(conn);
    let record = submission::review(
        &store,
        &key,
        &actor_id,
        &reviewer_id,
        decision,
        note,
        Utc::now(),
    )?;
    Ok(json!({ "submission": record }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "sheet.saveDraft" => sheet_save_draft(state, req),
        "sheet.submit" => sheet_submit(state, req),
        "submission.get" => submission_get(state, req),
        "submission.review" => submission_review(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
