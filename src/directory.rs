//! Classes, students, sessions and memberships: the read side the engine
//! consults, plus the minimal writes needed to populate a workspace.

use crate::error::{EngineError, EngineResult};
use crate::model::{Session, Status};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

fn now_text() -> String {
    Utc::now().to_rfc3339()
}

pub fn class_exists(conn: &Connection, class_id: &str) -> EngineResult<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

/// Students with an ACTIVE membership in the class, oldest membership first.
pub fn get_active_roster(conn: &Connection, class_id: &str) -> EngineResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT student_id FROM student_classes
         WHERE class_id = ? AND status = 'ACTIVE'
         ORDER BY created_at, student_id",
    )?;
    let ids = stmt
        .query_map([class_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn get_session(conn: &Connection, session_id: &str) -> EngineResult<Option<Session>> {
    let sql = format!("SELECT {} FROM sessions WHERE id = ?", Session::COLUMNS);
    Ok(conn
        .query_row(&sql, [session_id], Session::from_row)
        .optional()?)
}

/// The session, provided it is ACTIVE and its validity window covers `date`.
pub fn get_valid_session(
    conn: &Connection,
    session_id: &str,
    date: NaiveDate,
) -> EngineResult<Session> {
    match get_session(conn, session_id)? {
        Some(s) if s.covers(date) => Ok(s),
        Some(_) => Err(EngineError::NotFound(format!(
            "session {} is not valid on {}",
            session_id, date
        ))),
        None => Err(EngineError::NotFound(format!("session {} not found", session_id))),
    }
}

pub fn is_active_member(conn: &Connection, student_id: &str, class_id: &str) -> EngineResult<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM student_classes
             WHERE student_id = ? AND class_id = ? AND status = 'ACTIVE'",
            (student_id, class_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

pub fn student_debt(conn: &Connection, student_id: &str) -> EngineResult<i64> {
    conn.query_row("SELECT debt FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()?
    .ok_or_else(|| EngineError::NotFound(format!("student {} not found", student_id)))
}

pub fn create_class(conn: &Connection, name: &str) -> EngineResult<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, name, created_at) VALUES(?, ?, ?)",
        (&id, name, now_text()),
    )?;
    Ok(id)
}

pub fn create_student(conn: &Connection, name: &str, debt: i64) -> EngineResult<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, name, debt, created_at) VALUES(?, ?, ?, ?)",
        (&id, name, debt, now_text()),
    )?;
    Ok(id)
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub class_id: String,
    pub weekday: String,
    pub start_time: String,
    pub end_time: String,
    pub amount: i64,
    pub valid_from: NaiveDate,
    pub valid_to: Option<NaiveDate>,
}

pub fn create_session(conn: &Connection, new: &NewSession) -> EngineResult<Session> {
    if !class_exists(conn, &new.class_id)? {
        return Err(EngineError::NotFound(format!("class {} not found", new.class_id)));
    }
    if new.amount < 0 {
        return Err(EngineError::BadRequest("amount must not be negative".to_string()));
    }
    if let Some(to) = new.valid_to {
        if to < new.valid_from {
            return Err(EngineError::BadRequest(
                "validTo must not precede validFrom".to_string(),
            ));
        }
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sessions(id, class_id, weekday, start_time, end_time, amount, valid_from, valid_to, status)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'ACTIVE')",
        params![
            &id,
            &new.class_id,
            &new.weekday,
            &new.start_time,
            &new.end_time,
            new.amount,
            new.valid_from,
            new.valid_to
        ],
    )?;
    get_session(conn, &id)?
        .ok_or_else(|| EngineError::NotFound(format!("session {} not found", id)))
}

/// Ends a session: CLOSED status and, when given, a final validity date.
pub fn close_session(
    conn: &Connection,
    session_id: &str,
    valid_to: Option<NaiveDate>,
) -> EngineResult<Session> {
    let changed = conn.execute(
        "UPDATE sessions SET status = 'CLOSED', valid_to = COALESCE(?, valid_to) WHERE id = ?",
        params![valid_to, session_id],
    )?;
    if changed == 0 {
        return Err(EngineError::NotFound(format!("session {} not found", session_id)));
    }
    get_session(conn, session_id)?
        .ok_or_else(|| EngineError::NotFound(format!("session {} not found", session_id)))
}

pub fn set_membership(
    conn: &Connection,
    student_id: &str,
    class_id: &str,
    status: Status,
) -> EngineResult<()> {
    if !class_exists(conn, class_id)? {
        return Err(EngineError::NotFound(format!("class {} not found", class_id)));
    }
    student_debt(conn, student_id)?;
    conn.execute(
        "INSERT INTO student_classes(student_id, class_id, status, created_at)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(student_id, class_id) DO UPDATE SET
           status = excluded.status",
        (student_id, class_id, status.as_str(), now_text()),
    )?;
    Ok(())
}
