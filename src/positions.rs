use crate::calc::{self, RankPolicy};
use crate::db;
use crate::error::StoreError;
use crate::settings;
use crate::store::{GradeStore, RosterProvider, SheetKey, SqliteStore};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassPosition {
    pub student_id: String,
    pub total: f64,
    pub scored_count: usize,
    pub percentage: i64,
    pub average: i64,
    pub position: Option<usize>,
    pub computed_at: String,
}

/// Recomputes class positions from persisted rows and the current roster,
/// replacing whatever was stored for `key`.
pub fn recalculate(
    conn: &Connection,
    key: &SheetKey,
    policy: RankPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<ClassPosition>, StoreError> {
    let store = SqliteStore::new(conn);
    let students = store.students(&key.school_id, &key.class_id)?;
    let subjects = store.subjects(&key.school_id, &key.class_id, None)?;
    let rows = store.fetch(key)?;

    let mut scores: HashMap<&str, Vec<f64>> = HashMap::new();
    for row in &rows {
        let Some(score) = row.score else {
            continue;
        };
        if !calc::in_score_range(score) || !subjects.iter().any(|s| s.id == row.subject_id) {
            continue;
        }
        scores.entry(row.student_id.as_str()).or_default().push(score);
    }

    let cohort = students.iter().map(|st| {
        (
            st.id.as_str(),
            scores.remove(st.id.as_str()).unwrap_or_default(),
        )
    });
    let computed_at = now.to_rfc3339();
    let positions: Vec<ClassPosition> = calc::summarize(cohort, policy)
        .into_iter()
        .map(|s| ClassPosition {
            student_id: s.student_id,
            total: s.total,
            scored_count: s.scored_count,
            percentage: s.percentage,
            average: s.average,
            position: s.rank,
            computed_at: computed_at.clone(),
        })
        .collect();

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM class_positions
         WHERE school_id = ? AND class_id = ? AND term = ? AND exam_type = ? AND academic_year = ?",
        params![
            key.school_id,
            key.class_id,
            key.term,
            key.exam_type,
            key.academic_year
        ],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO class_positions(
               school_id, class_id, term, exam_type, academic_year, student_id,
               total, scored_count, percentage, average, position, computed_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for p in &positions {
            stmt.execute(params![
                key.school_id,
                key.class_id,
                key.term,
                key.exam_type,
                key.academic_year,
                p.student_id,
                p.total,
                p.scored_count as i64,
                p.percentage,
                p.average,
                p.position.map(|n| n as i64),
                p.computed_at,
            ])?;
        }
    }
    tx.commit()?;
    Ok(positions)
}

pub fn load(conn: &Connection, key: &SheetKey) -> Result<Vec<ClassPosition>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT student_id, total, scored_count, percentage, average, position, computed_at
         FROM class_positions
         WHERE school_id = ? AND class_id = ? AND term = ? AND exam_type = ? AND academic_year = ?
         ORDER BY position IS NULL, position, student_id",
    )?;
    let positions = stmt
        .query_map(
            params![
                key.school_id,
                key.class_id,
                key.term,
                key.exam_type,
                key.academic_year
            ],
            |r| {
                let scored_count: i64 = r.get(2)?;
                let position: Option<i64> = r.get(5)?;
                Ok(ClassPosition {
                    student_id: r.get(0)?,
                    total: r.get(1)?,
                    scored_count: scored_count.max(0) as usize,
                    percentage: r.get(3)?,
                    average: r.get(4)?,
                    position: position.map(|n| n.max(0) as usize),
                    computed_at: r.get(6)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(positions)
}

/// Background recalculation on its own connection. Keys scheduled within
/// the debounce window are coalesced; dropping the worker flushes what is
/// queued and joins the thread.
pub struct PositionsWorker {
    tx: Option<Sender<SheetKey>>,
    handle: Option<JoinHandle<()>>,
}

impl PositionsWorker {
    pub fn spawn(workspace: &Path) -> anyhow::Result<Self> {
        let conn = db::open_connection(workspace)?;
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("positions".to_string())
            .spawn(move || run(conn, rx))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn schedule(&self, key: SheetKey) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        if tx.send(key).is_err() {
            warn!("positions worker has stopped; recalculation skipped");
        }
    }
}

impl Drop for PositionsWorker {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("positions worker panicked");
            }
        }
    }
}

fn run(conn: Connection, rx: Receiver<SheetKey>) {
    while let Ok(first) = rx.recv() {
        let debounce = match settings::positions(&conn) {
            Ok(p) => p.debounce_ms,
            Err(e) => {
                warn!(error = %e, "could not read positions settings");
                2000
            }
        };
        let mut pending = vec![first];
        let mut closed = false;
        let deadline = Instant::now() + Duration::from_millis(debounce);
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match rx.recv_timeout(deadline - now) {
                Ok(key) => {
                    if !pending.contains(&key) {
                        pending.push(key);
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    closed = true;
                    break;
                }
            }
        }

        let policy = match settings::grading(&conn) {
            Ok(g) => g.options.rank_policy,
            Err(e) => {
                warn!(error = %e, "could not read grading settings");
                RankPolicy::Position
            }
        };
        for key in pending {
            match recalculate(&conn, &key, policy, Utc::now()) {
                Ok(positions) => debug!(
                    class_id = %key.class_id,
                    term = %key.term,
                    students = positions.len(),
                    "class positions updated"
                ),
                Err(e) => warn!(
                    class_id = %key.class_id,
                    term = %key.term,
                    error = %e,
                    "class position recalculation failed"
                ),
            }
        }
        if closed {
            break;
        }
    }
}
