use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::positions::PositionsWorker;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "sheetOpen": state.sheet.is_some()
        }),
    )
}

/// Opens `path` as the active workspace, replacing any open one.
fn open_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<()> {
    state.close_workspace();
    let conn = db::open_db(path)?;
    // Positions are best effort; a workspace without a worker still opens.
    state.positions = match PositionsWorker::spawn(path) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = %e, "positions worker unavailable");
            None
        }
    };
    state.db = Some(conn);
    state.workspace = Some(path.to_path_buf());
    info!(workspace = %path.to_string_lossy(), "workspace opened");
    Ok(())
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match open_workspace(state, &path) {
        Ok(()) => ok(&req.id, json!({ "workspacePath": path.to_string_lossy() })),
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
