use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_FILE_NAME: &str = "gradesheet.sqlite3";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn db_path(workspace: &Path) -> PathBuf {
    workspace.join(DB_FILE_NAME)
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace.to_string_lossy()
        )
    })?;
    let conn = open_connection(workspace)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Opens a second handle on an already initialised workspace database.
pub fn open_connection(workspace: &Path) -> anyhow::Result<Connection> {
    let path = db_path(workspace);
    let conn = Connection::open(&path)
        .with_context(|| format!("failed to open database {}", path.to_string_lossy()))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL
        )",
        [],
    )?;
    // Workspaces created before per-class curricula lack the column.
    ensure_classes_curriculum(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_school ON classes(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            admission_no TEXT NOT NULL,
            roll_no TEXT,
            sort_order INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            code TEXT,
            teacher_id TEXT,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_class_sort ON subjects(class_id, sort_order)",
        [],
    )?;

    // Grade rows deliberately carry no foreign keys: rows for students or
    // subjects that left the roster are kept.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_rows(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            term TEXT NOT NULL,
            exam_type TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            curriculum TEXT NOT NULL,
            score REAL,
            percentage INTEGER,
            letter_grade TEXT,
            performance_level TEXT,
            strand_levels TEXT,
            coursework_score REAL,
            exam_score REAL,
            remarks TEXT,
            status TEXT NOT NULL,
            submitted_by TEXT,
            submitted_at TEXT,
            UNIQUE(school_id, student_id, subject_id, class_id, term, exam_type, academic_year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_rows_sheet
         ON grade_rows(school_id, class_id, term, exam_type, academic_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_submissions(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            term TEXT NOT NULL,
            exam_type TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            subject_ids TEXT NOT NULL,
            status TEXT NOT NULL,
            row_count INTEGER NOT NULL,
            submitted_at TEXT,
            reviewed_by TEXT,
            reviewed_at TEXT,
            review_note TEXT,
            UNIQUE(school_id, class_id, term, exam_type, academic_year, actor_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_positions(
            school_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            term TEXT NOT NULL,
            exam_type TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            student_id TEXT NOT NULL,
            total REAL NOT NULL,
            scored_count INTEGER NOT NULL,
            percentage INTEGER NOT NULL,
            average INTEGER NOT NULL,
            position INTEGER,
            computed_at TEXT NOT NULL,
            PRIMARY KEY(school_id, class_id, term, exam_type, academic_year, student_id)
        )",
        [],
    )?;

    Ok(())
}

fn ensure_classes_curriculum(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "classes", "curriculum")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE classes ADD COLUMN curriculum TEXT NOT NULL DEFAULT 'standard'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let text: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match text {
        Some(t) => Ok(Some(
            serde_json::from_str(&t).with_context(|| format!("setting {} is not valid JSON", key))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_init_is_repeatable() {
        let conn = Connection::open_in_memory().expect("open");
        init_schema(&conn).expect("first init");
        init_schema(&conn).expect("second init");
        assert!(table_has_column(&conn, "classes", "curriculum").expect("pragma"));
        assert!(table_has_column(&conn, "grade_rows", "strand_levels").expect("pragma"));
    }

    #[test]
    fn old_classes_table_gains_curriculum_column() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute(
            "CREATE TABLE classes(id TEXT PRIMARY KEY, school_id TEXT NOT NULL, name TEXT NOT NULL)",
            [],
        )
        .expect("legacy table");
        conn.execute(
            "INSERT INTO classes(id, school_id, name) VALUES('c', 's', 'Old')",
            [],
        )
        .expect("legacy row");
        init_schema(&conn).expect("init");
        let curriculum: String = conn
            .query_row("SELECT curriculum FROM classes WHERE id = 'c'", [], |r| {
                r.get(0)
            })
            .expect("curriculum");
        assert_eq!(curriculum, "standard");
    }

    #[test]
    fn settings_roundtrip() {
        let conn = Connection::open_in_memory().expect("open");
        init_schema(&conn).expect("init");
        assert!(settings_get_json(&conn, "setup.grading").expect("get").is_none());
        settings_set_json(&conn, "setup.grading", &json!({ "rankPolicy": "competition" }))
            .expect("set");
        settings_set_json(&conn, "setup.grading", &json!({ "rankPolicy": "position" }))
            .expect("overwrite");
        assert_eq!(
            settings_get_json(&conn, "setup.grading").expect("get"),
            Some(json!({ "rankPolicy": "position" }))
        );
    }
}
