use crate::calc::CurriculumKind;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::sheet::sync_open_sheet;
use crate::ipc::helpers::{get_required_str, get_str, require_db, settings_err};
use crate::ipc::types::{AppState, Request};
use crate::settings;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn ensure_class(conn: &Connection, class_id: &str) -> Result<(), HandlerErr> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| r.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "class not found"));
    }
    Ok(())
}

fn next_sort_order(conn: &Connection, table: &str, class_id: &str) -> Result<i64, HandlerErr> {
    let sql = format!(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM {} WHERE class_id = ?",
        table
    );
    Ok(conn.query_row(&sql, [class_id], |r| r.get(0))?)
}

/// Removes one roster row and closes the gap in `sort_order`. Grade rows are
/// left in place.
fn delete_and_resequence(
    conn: &Connection,
    table: &str,
    id: &str,
    class_id: &str,
) -> Result<(), HandlerErr> {
    let sort_order: Option<i64> = conn
        .query_row(
            &format!("SELECT sort_order FROM {} WHERE id = ? AND class_id = ?", table),
            (id, class_id),
            |r| r.get(0),
        )
        .optional()?;
    let Some(sort_order) = sort_order else {
        return Err(HandlerErr::new("not_found", format!("{} row not found", table)));
    };

    let tx = conn.unchecked_transaction()?;
    tx.execute(&format!("DELETE FROM {} WHERE id = ?", table), [id])?;
    tx.execute(
        &format!(
            "UPDATE {} SET sort_order = sort_order - 1 WHERE class_id = ? AND sort_order > ?",
            table
        ),
        params![class_id, sort_order],
    )?;
    tx.commit()?;
    Ok(())
}

/// An open sheet of the class drops the removed row's entries at once, so a
/// later save cannot write them back.
fn deleted(synced: Option<usize>) -> Result<Value, HandlerErr> {
    Ok(json!({
        "ok": true,
        "sheetSynced": synced.is_some(),
        "droppedEntries": synced.unwrap_or(0)
    }))
}

fn classes_create(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let school_id = get_required_str(&req.params, "schoolId")?;
    let name = get_required_str(&req.params, "name")?;
    let curriculum = match get_str(&req.params, "curriculum") {
        Some(raw) => CurriculumKind::parse(&raw).ok_or_else(|| {
            HandlerErr::bad_params("curriculum must be one of: standard, cbc, igcse")
        })?,
        None => {
            settings::grading(conn)
                .map_err(settings_err)?
                .default_curriculum
        }
    };

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, school_id, name, curriculum) VALUES(?, ?, ?, ?)",
        (&class_id, &school_id, &name, curriculum.as_str()),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "classes" }))
    })?;

    Ok(json!({
        "classId": class_id,
        "name": name,
        "curriculum": curriculum.as_str()
    }))
}

fn classes_list(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "classes": [] }));
    };
    let school_id = get_str(&req.params, "schoolId");

    let mut stmt = conn.prepare(
        "SELECT
           c.id,
           c.school_id,
           c.name,
           c.curriculum,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id AND s.active = 1),
           (SELECT COUNT(*) FROM subjects sj WHERE sj.class_id = c.id)
         FROM classes c
         WHERE ?1 IS NULL OR c.school_id = ?1
         ORDER BY c.name",
    )?;
    let classes = stmt
        .query_map([school_id.as_deref()], |row| {
            let id: String = row.get(0)?;
            let school_id: String = row.get(1)?;
            let name: String = row.get(2)?;
            let curriculum: String = row.get(3)?;
            let student_count: i64 = row.get(4)?;
            let subject_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "schoolId": school_id,
                "name": name,
                "curriculum": curriculum,
                "studentCount": student_count,
                "subjectCount": subject_count
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classes": classes }))
}

fn students_create(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;
    let display_name = get_required_str(&req.params, "displayName")?;
    let admission_no = get_required_str(&req.params, "admissionNo")?;
    let roll_no = get_str(&req.params, "rollNo");
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    ensure_class(conn, &class_id)?;

    let sort_order = next_sort_order(conn, "students", &class_id)?;
    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, display_name, admission_no, roll_no, sort_order, active)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        params![
            student_id,
            class_id,
            display_name,
            admission_no,
            roll_no,
            sort_order,
            active as i64
        ],
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "students" }))
    })?;
    let synced = sync_open_sheet(state, &class_id)?;
    Ok(json!({
        "studentId": student_id,
        "sortOrder": sort_order,
        "sheetSynced": synced.is_some()
    }))
}

fn students_list(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;
    let mut stmt = conn.prepare(
        "SELECT id, display_name, admission_no, roll_no, sort_order, active
         FROM students WHERE class_id = ? ORDER BY sort_order, display_name",
    )?;
    let students = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let display_name: String = r.get(1)?;
            let admission_no: String = r.get(2)?;
            let roll_no: Option<String> = r.get(3)?;
            let sort_order: i64 = r.get(4)?;
            let active: i64 = r.get(5)?;
            Ok(json!({
                "id": id,
                "displayName": display_name,
                "admissionNo": admission_no,
                "rollNo": roll_no,
                "sortOrder": sort_order,
                "active": active != 0
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

fn students_delete(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;
    let student_id = get_required_str(&req.params, "studentId")?;
    delete_and_resequence(conn, "students", &student_id, &class_id)?;
    deleted(sync_open_sheet(state, &class_id)?)
}

fn subjects_create(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;
    let name = get_required_str(&req.params, "name")?;
    let code = get_str(&req.params, "code");
    let teacher_id = get_str(&req.params, "teacherId");
    ensure_class(conn, &class_id)?;

    let sort_order = next_sort_order(conn, "subjects", &class_id)?;
    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, class_id, name, code, teacher_id, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        params![subject_id, class_id, name, code, teacher_id, sort_order],
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "subjects" }))
    })?;
    let synced = sync_open_sheet(state, &class_id)?;
    Ok(json!({
        "subjectId": subject_id,
        "sortOrder": sort_order,
        "sheetSynced": synced.is_some()
    }))
}

fn subjects_list(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;
    let teacher_id = get_str(&req.params, "teacherId");
    let mut stmt = conn.prepare(
        "SELECT id, name, code, teacher_id, sort_order
         FROM subjects
         WHERE class_id = ?1 AND (?2 IS NULL OR teacher_id = ?2)
         ORDER BY sort_order, name",
    )?;
    let subjects = stmt
        .query_map(params![class_id, teacher_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let code: Option<String> = r.get(2)?;
            let teacher_id: Option<String> = r.get(3)?;
            let sort_order: i64 = r.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "code": code,
                "teacherId": teacher_id,
                "sortOrder": sort_order
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_delete(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;
    let subject_id = get_required_str(&req.params, "subjectId")?;
    delete_and_resequence(conn, "subjects", &subject_id, &class_id)?;
    deleted(sync_open_sheet(state, &class_id)?)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "classes.create" => classes_create(state, req),
        "classes.list" => classes_list(state, req),
        "students.create" => students_create(state, req),
        "students.list" => students_list(state, req),
        "students.delete" => students_delete(state, req),
        "subjects.create" => subjects_create(state, req),
        "subjects.list" => subjects_list(state, req),
        "subjects.delete" => subjects_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
