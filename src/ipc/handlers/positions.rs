use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{require_db, settings_err, sheet_key};
use crate::ipc::types::{AppState, Request};
use crate::positions;
use crate::settings;
use chrono::Utc;
use serde_json::{json, Value};

fn positions_get(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let key = sheet_key(&req.params)?;
    Ok(json!({ "positions": positions::load(conn, &key)? }))
}

fn positions_recalculate(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let key = sheet_key(&req.params)?;
    let policy = settings::grading(conn)
        .map_err(settings_err)?
        .options
        .rank_policy;
    let positions = positions::recalculate(conn, &key, policy, Utc::now())?;
    Ok(json!({ "positions": positions, "rankPolicy": policy.as_str() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "positions.get" => positions_get(state, req),
        "positions.recalculate" => positions_recalculate(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
