//! Attendance rows and the monthly payment ledger.
//!
//! Payment totals are only ever moved by single UPDATE/UPSERT statements of
//! the form `x = x + ?`, never by reading a total and writing it back, so
//! concurrent job workers and toggles on the same row cannot lose updates.

use crate::error::{EngineError, EngineResult};
use crate::model::{Attendance, LedgerMonth, Payment, PaymentStatus};
use chrono::{NaiveDate, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

fn now_text() -> String {
    Utc::now().to_rfc3339()
}

/// Signed change applied to one payment row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentDelta {
    pub sessions: i64,
    pub attend: i64,
    pub month_amount: i64,
    pub payment: i64,
}

impl PaymentDelta {
    /// One more attended session of the given fee.
    pub fn attended(fee: i64) -> Self {
        PaymentDelta {
            sessions: 1,
            attend: 1,
            month_amount: fee,
            payment: fee,
        }
    }

    pub fn reversed(self) -> Self {
        PaymentDelta {
            sessions: -self.sessions,
            attend: -self.attend,
            month_amount: -self.month_amount,
            payment: -self.payment,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewAttendance<'a> {
    pub student_id: &'a str,
    pub session_id: &'a str,
    pub learning_date: NaiveDate,
    pub note: &'a str,
    pub created_by: &'a str,
}

/// Inserts a present-student row. A second row for the same
/// (student, session, date) is refused by the unique index.
pub fn insert_attendance(conn: &Connection, new: &NewAttendance<'_>) -> EngineResult<Attendance> {
    let id = Uuid::new_v4().to_string();
    let now = now_text();
    let inserted = conn.execute(
        "INSERT INTO attendances(id, student_id, session_id, learning_date, is_attend, note, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, 1, ?, ?, ?, ?)",
        params![
            &id,
            new.student_id,
            new.session_id,
            new.learning_date,
            new.note,
            new.created_by,
            &now,
            &now
        ],
    );
    match inserted.map_err(EngineError::from) {
        Ok(_) => {}
        Err(e) if e.is_unique_violation() => {
            return Err(EngineError::Conflict(format!(
                "attendance already recorded for student {} in session {} on {}",
                new.student_id, new.session_id, new.learning_date
            )))
        }
        Err(e) => return Err(e),
    }
    get_attendance(conn, &id)?
        .ok_or_else(|| EngineError::NotFound(format!("attendance {} not found", id)))
}

pub fn link_attendance_payment(
    conn: &Connection,
    attendance_id: &str,
    payment_id: &str,
) -> EngineResult<()> {
    conn.execute(
        "UPDATE attendances SET payment_id = ? WHERE id = ?",
        (payment_id, attendance_id),
    )?;
    Ok(())
}

pub fn get_attendance(conn: &Connection, attendance_id: &str) -> EngineResult<Option<Attendance>> {
    let sql = format!("SELECT {} FROM attendances WHERE id = ?", Attendance::COLUMNS);
    Ok(conn
        .query_row(&sql, [attendance_id], Attendance::from_row)
        .optional()?)
}

/// Matches an attendance on every identifying field, not just its id.
pub fn find_matching_attendance(
    conn: &Connection,
    attendance_id: &str,
    student_id: &str,
    session_id: &str,
    learning_date: NaiveDate,
) -> EngineResult<Option<Attendance>> {
    let sql = format!(
        "SELECT {} FROM attendances
         WHERE id = ? AND student_id = ? AND session_id = ? AND learning_date = ?",
        Attendance::COLUMNS
    );
    Ok(conn
        .query_row(
            &sql,
            params![attendance_id, student_id, session_id, learning_date],
            Attendance::from_row,
        )
        .optional()?)
}

pub fn set_attendance_state(
    conn: &Connection,
    attendance_id: &str,
    is_attend: bool,
    note: &str,
    updated_by: &str,
) -> EngineResult<Attendance> {
    conn.execute(
        "UPDATE attendances SET is_attend = ?, note = ?, updated_by = ?, updated_at = ? WHERE id = ?",
        params![is_attend as i64, note, updated_by, now_text(), attendance_id],
    )?;
    get_attendance(conn, attendance_id)?
        .ok_or_else(|| EngineError::NotFound(format!("attendance {} not found", attendance_id)))
}

/// Creates the month's payment for one attended session (carrying `debt` into
/// the total) or, if it already exists, adds the session to it. One statement.
pub fn upsert_payment_increment(
    conn: &Connection,
    student_id: &str,
    month: LedgerMonth,
    fee: i64,
    debt: i64,
) -> EngineResult<Payment> {
    let sql = format!(
        "INSERT INTO payments(id, student_id, year, month, total_sessions, total_attend,
                              total_month_amount, total_payment, status, created_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, 1, 1, ?5, ?5 + ?6, 'SAVED', ?7, ?7)
         ON CONFLICT(student_id, year, month) DO UPDATE SET
           total_sessions = total_sessions + 1,
           total_attend = total_attend + 1,
           total_month_amount = total_month_amount + excluded.total_month_amount,
           total_payment = total_payment + excluded.total_month_amount,
           updated_at = excluded.updated_at
         RETURNING {}",
        Payment::COLUMNS
    );
    Ok(conn.query_row(
        &sql,
        params![
            Uuid::new_v4().to_string(),
            student_id,
            month.year,
            month.month,
            fee,
            debt,
            now_text()
        ],
        Payment::from_row,
    )?)
}

pub fn apply_payment_delta(
    conn: &Connection,
    payment_id: &str,
    delta: PaymentDelta,
) -> EngineResult<Payment> {
    let sql = format!(
        "UPDATE payments SET
           total_sessions = total_sessions + ?2,
           total_attend = total_attend + ?3,
           total_month_amount = total_month_amount + ?4,
           total_payment = total_payment + ?5,
           updated_at = ?6
         WHERE id = ?1
         RETURNING {}",
        Payment::COLUMNS
    );
    conn.query_row(
        &sql,
        params![
            payment_id,
            delta.sessions,
            delta.attend,
            delta.month_amount,
            delta.payment,
            now_text()
        ],
        Payment::from_row,
    )
    .optional()?
    .ok_or_else(|| EngineError::NotFound(format!("payment {} not found", payment_id)))
}

pub fn get_payment(conn: &Connection, payment_id: &str) -> EngineResult<Option<Payment>> {
    let sql = format!("SELECT {} FROM payments WHERE id = ?", Payment::COLUMNS);
    Ok(conn.query_row(&sql, [payment_id], Payment::from_row).optional()?)
}

pub fn get_payment_for_month(
    conn: &Connection,
    student_id: &str,
    month: LedgerMonth,
) -> EngineResult<Option<Payment>> {
    let sql = format!(
        "SELECT {} FROM payments WHERE student_id = ? AND year = ? AND month = ?",
        Payment::COLUMNS
    );
    Ok(conn
        .query_row(
            &sql,
            params![student_id, month.year, month.month],
            Payment::from_row,
        )
        .optional()?)
}

/// SENT stamps the bill as delivered; PAID records the amount received and
/// carries what is left over into the student's debt.
pub fn update_payment_status(
    conn: &Connection,
    payment_id: &str,
    status: PaymentStatus,
    paid_amount: Option<i64>,
    note: Option<&str>,
) -> EngineResult<Payment> {
    let payment = get_payment(conn, payment_id)?
        .ok_or_else(|| EngineError::NotFound(format!("payment {} not found", payment_id)))?;
    let now = now_text();
    match status {
        PaymentStatus::Saved => {
            return Err(EngineError::BadRequest(
                "status must be SENT or PAID".to_string(),
            ))
        }
        PaymentStatus::Sent => {
            conn.execute(
                "UPDATE payments SET status = 'SENT', sent_at = ?, note = COALESCE(?, note), updated_at = ?
                 WHERE id = ?",
                params![&now, note, &now, payment_id],
            )?;
        }
        PaymentStatus::Paid => {
            let Some(paid) = paid_amount else {
                return Err(EngineError::BadRequest(
                    "paidAmount is required for PAID".to_string(),
                ));
            };
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE students SET debt = ? - ? WHERE id = ?",
                params![payment.total_payment, paid, &payment.student_id],
            )?;
            tx.execute(
                "UPDATE payments SET status = 'PAID', paid_amount = ?, note = COALESCE(?, note), updated_at = ?
                 WHERE id = ?",
                params![paid, note, &now, payment_id],
            )?;
            tx.commit()?;
        }
    }
    get_payment(conn, payment_id)?
        .ok_or_else(|| EngineError::NotFound(format!("payment {} not found", payment_id)))
}

#[derive(Debug, Clone, Default)]
pub struct AttendanceFilter {
    pub class_id: Option<String>,
    pub payment_id: Option<String>,
    pub is_attend: Option<bool>,
    pub learning_date: Option<NaiveDate>,
    pub month: Option<LedgerMonth>,
    pub page: u32,
    pub row_per_page: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceStatistic {
    pub total: i64,
    pub attended: i64,
    pub absent: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendancePage {
    pub statistic: AttendanceStatistic,
    pub page: u32,
    pub row_per_page: u32,
    pub data: Vec<Attendance>,
}

fn effective_row_per_page(row_per_page: u32) -> u32 {
    if row_per_page == 0 {
        10
    } else {
        row_per_page
    }
}

/// Row offset of a 1-based page, or `None` when it does not fit an SQLite
/// integer.
pub fn page_offset(page: u32, row_per_page: u32) -> Option<i64> {
    let skipped = u64::from(page.max(1) - 1);
    let offset = skipped.checked_mul(u64::from(effective_row_per_page(row_per_page)))?;
    i64::try_from(offset).ok()
}

pub fn find_attendances(conn: &Connection, filter: &AttendanceFilter) -> EngineResult<AttendancePage> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<Value> = Vec::new();
    if let Some(class_id) = &filter.class_id {
        clauses.push("a.session_id IN (SELECT id FROM sessions WHERE class_id = ?)");
        args.push(Value::Text(class_id.clone()));
    }
    if let Some(payment_id) = &filter.payment_id {
        clauses.push("a.payment_id = ?");
        args.push(Value::Text(payment_id.clone()));
    }
    if let Some(date) = filter.learning_date {
        clauses.push("a.learning_date = ?");
        args.push(Value::Text(date.to_string()));
    } else if let Some(month) = filter.month {
        clauses.push("a.learning_date LIKE ?");
        args.push(Value::Text(format!("{:04}-{:02}-%", month.year, month.month)));
    }
    let base_where = if clauses.is_empty() {
        "1 = 1".to_string()
    } else {
        clauses.join(" AND ")
    };

    let (total, attended): (i64, i64) = conn.query_row(
        &format!(
            "SELECT COUNT(*), COALESCE(SUM(a.is_attend), 0) FROM attendances a WHERE {}",
            base_where
        ),
        params_from_iter(args.iter()),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;

    let mut list_where = base_where;
    let mut list_args = args;
    if let Some(is_attend) = filter.is_attend {
        list_where.push_str(" AND a.is_attend = ?");
        list_args.push(Value::Integer(is_attend as i64));
    }
    let page = filter.page.max(1);
    let row_per_page = effective_row_per_page(filter.row_per_page);
    let offset = page_offset(page, row_per_page).ok_or_else(|| {
        EngineError::BadRequest(format!(
            "page {page} with rowPerPage {row_per_page} is out of range"
        ))
    })?;
    list_args.push(Value::Integer(i64::from(row_per_page)));
    list_args.push(Value::Integer(offset));

    let columns = Attendance::COLUMNS
        .split(", ")
        .map(|c| format!("a.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM attendances a WHERE {}
         ORDER BY a.learning_date DESC, a.created_at DESC
         LIMIT ? OFFSET ?",
        columns, list_where
    ))?;
    let data = stmt
        .query_map(params_from_iter(list_args.iter()), Attendance::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AttendancePage {
        statistic: AttendanceStatistic {
            total,
            attended,
            absent: total - attended,
        },
        page,
        row_per_page,
        data,
    })
}
