use crate::archive;
use crate::error::GradeError;
use crate::export::{self, ExportFormat};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{get_required_str, get_str, require_db, require_sheet, sheet_key};
use crate::ipc::types::{AppState, Request};
use crate::settings;
use crate::store::SqliteStore;
use chrono::Utc;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

fn write_text_file(path: &str, contents: &str) -> Result<(), HandlerErr> {
    let out = PathBuf::from(path);
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            HandlerErr::new("export_failed", e.to_string()).with_details(json!({ "path": path }))
        })?;
    }
    std::fs::write(&out, contents).map_err(|e| {
        HandlerErr::new("export_failed", e.to_string()).with_details(json!({ "path": path }))
    })?;
    Ok(())
}

fn sheet_export(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let open = require_sheet(state)?;
    let format = match get_str(&req.params, "format") {
        Some(raw) => ExportFormat::parse(&raw)
            .ok_or_else(|| HandlerErr::bad_params("format must be json or csv"))?,
        None => ExportFormat::Json,
    };
    let projection = export::export(&open.matrix);
    match format {
        ExportFormat::Json => Ok(json!({ "format": "json", "export": projection })),
        ExportFormat::Csv => {
            let out_path = get_required_str(&req.params, "outPath")?;
            write_text_file(&out_path, &export::to_csv(&projection))?;
            Ok(json!({
                "format": "csv",
                "path": out_path,
                "rowCount": projection.rows.len()
            }))
        }
    }
}

fn archive_export_sheet(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let key = sheet_key(&req.params)?;
    let out_path = get_required_str(&req.params, "outPath")?;
    let store = SqliteStore::new(conn);
    if store.submissions_for(&key)?.is_empty() {
        return Err(GradeError::not_found("nothing has been saved for this sheet").into());
    }

    let summary = archive::export_sheet_archive(&store, &key, Path::new(&out_path), Utc::now())
        .map_err(|e| HandlerErr::archive(e, &out_path))?;
    info!(
        path = %out_path,
        class_id = %key.class_id,
        rows = summary.row_count,
        "sheet archive exported"
    );
    let mut result = json!(summary);
    if let Some(obj) = result.as_object_mut() {
        obj.insert("path".into(), json!(out_path));
    }
    Ok(result)
}

fn archive_import_sheet(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let in_path = get_required_str(&req.params, "inPath")?;
    let archive = archive::read_sheet_archive(Path::new(&in_path))
        .map_err(|e| HandlerErr::archive(e, &in_path))?;
    if state.sheet.as_ref().is_some_and(|s| s.ctx.key == archive.key) {
        return Err(GradeError::validation("close the sheet before importing over it").into());
    }

    let summary = archive::import_sheet_archive(conn, &archive)?;
    info!(
        path = %in_path,
        class_id = %archive.key.class_id,
        rows = summary.rows_imported,
        off_roster = summary.off_roster_rows,
        "sheet archive imported"
    );

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
        worker.schedule(archive.key.clone());
    }

    let mut result = json!(summary);
    if let Some(obj) = result.as_object_mut() {
        obj.insert("sheet".into(), json!(archive.key));
        obj.insert("exportedAt".into(), json!(archive.exported_at));
        obj.insert("positionsQueued".into(), json!(queued));
    }
    Ok(result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "sheet.export" => sheet_export(state, req),
        "archive.exportSheet" => archive_export_sheet(state, req),
        "archive.importSheet" => archive_import_sheet(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
