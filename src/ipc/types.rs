use std::path::PathBuf;

use crate::matrix::GradeMatrix;
use crate::positions::PositionsWorker;
use crate::store::SheetContext;
use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The grading sheet currently being edited.
pub struct OpenSheet {
    pub ctx: SheetContext,
    pub teacher_id: Option<String>,
    pub matrix: GradeMatrix,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub sheet: Option<OpenSheet>,
    pub positions: Option<PositionsWorker>,
}

impl AppState {
    /// Drops the open sheet, flushes the positions worker, then closes the
    /// database handle.
    pub fn close_workspace(&mut self) {
        self.sheet = None;
        self.positions = None;
        self.db = None;
        self.workspace = None;
    }
}
