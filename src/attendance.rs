//! Attendance decisions and the ledger effects that follow from them.
//!
//! A row is written only for a student marked present; an absent student
//! leaves no trace. After creation a row may be toggled, in which case it
//! stays and `is_attend` records the current state, with the owning payment
//! moved by the session fee in the matching direction.

use crate::directory;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{self, NewAttendance, PaymentDelta};
use crate::model::{Attendance, LedgerMonth, Payment};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAttendanceRequest {
    pub student_id: String,
    pub session_id: String,
    pub learning_date: NaiveDate,
    pub is_attend: bool,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum CreateOutcome {
    Created {
        attendance: Attendance,
        payment: Payment,
    },
    NotAttending,
}

/// Records one student's attendance: the row, the month's payment and the
/// link between them commit together or not at all.
pub fn create_attendance(
    conn: &Connection,
    req: &CreateAttendanceRequest,
    user_id: &str,
) -> EngineResult<CreateOutcome> {
    if !req.is_attend {
        return Ok(CreateOutcome::NotAttending);
    }

    let session = directory::get_valid_session(conn, &req.session_id, req.learning_date)?;
    if !directory::is_active_member(conn, &req.student_id, &session.class_id)? {
        return Err(EngineError::InvalidMembership(format!(
            "student {} does not belong to class {}",
            req.student_id, session.class_id
        )));
    }

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let created = ledger::insert_attendance(
        &tx,
        &NewAttendance {
            student_id: &req.student_id,
            session_id: &req.session_id,
            learning_date: req.learning_date,
            note: &req.note,
            created_by: user_id,
        },
    )?;
    let debt = directory::student_debt(&tx, &req.student_id)?;
    let payment = ledger::upsert_payment_increment(
        &tx,
        &req.student_id,
        LedgerMonth::of(req.learning_date),
        session.amount,
        debt,
    )?;
    ledger::link_attendance_payment(&tx, &created.id, &payment.id)?;
    let attendance = ledger::get_attendance(&tx, &created.id)?
        .ok_or_else(|| EngineError::NotFound(format!("attendance {} not found", created.id)))?;
    tx.commit()?;

    debug!(
        attendance_id = %attendance.id,
        payment_id = %payment.id,
        total_payment = payment.total_payment,
        "attendance created"
    );
    Ok(CreateOutcome::Created {
        attendance,
        payment,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum UpdateOutcome {
    Unchanged,
    NoteUpdated {
        attendance: Attendance,
    },
    Toggled {
        attendance: Attendance,
        payment: Payment,
    },
}

fn created_in_month(attendance: &Attendance, today: NaiveDate) -> bool {
    DateTime::parse_from_rfc3339(&attendance.created_at)
        .map(|t| {
            let d = t.with_timezone(&Utc).date_naive();
            d.year() == today.year() && d.month() == today.month()
        })
        .unwrap_or(false)
}

fn ensure_editable_period(attendance: &Attendance, today: NaiveDate) -> EngineResult<()> {
    if created_in_month(attendance, today) {
        Ok(())
    } else {
        Err(EngineError::InvalidPeriod(format!(
            "attendance {} was recorded in a previous month",
            attendance.id
        )))
    }
}

fn owning_payment_id(conn: &Connection, attendance: &Attendance) -> EngineResult<String> {
    if let Some(id) = &attendance.payment_id {
        return Ok(id.clone());
    }
    ledger::get_payment_for_month(
        conn,
        &attendance.student_id,
        LedgerMonth::of(attendance.learning_date),
    )?
    .map(|p| p.id)
    .ok_or_else(|| {
        EngineError::NotFound(format!("payment for attendance {} not found", attendance.id))
    })
}

/// Flips `is_attend` and moves the owning payment by the session fee.
/// Caller owns the transaction and has already checked the period rule.
fn apply_toggle(
    conn: &Connection,
    attendance: &Attendance,
    is_attend: bool,
    note: &str,
    user_id: &str,
) -> EngineResult<(Attendance, Payment)> {
    let session = directory::get_session(conn, &attendance.session_id)?.ok_or_else(|| {
        EngineError::NotFound(format!("session {} not found", attendance.session_id))
    })?;
    let payment_id = owning_payment_id(conn, attendance)?;
    let delta = if is_attend {
        PaymentDelta::attended(session.amount)
    } else {
        PaymentDelta::attended(session.amount).reversed()
    };
    let payment = ledger::apply_payment_delta(conn, &payment_id, delta)?;
    let updated = ledger::set_attendance_state(conn, &attendance.id, is_attend, note, user_id)?;
    if updated.payment_id.is_none() {
        ledger::link_attendance_payment(conn, &updated.id, &payment.id)?;
    }
    Ok((updated, payment))
}

/// Reads, compares and writes under one write lock, so concurrent toggles of
/// the same row apply the fee at most once.
pub fn update_attendance(
    conn: &Connection,
    attendance_id: &str,
    is_attend: bool,
    note: Option<&str>,
    user_id: &str,
    today: NaiveDate,
) -> EngineResult<UpdateOutcome> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let attendance = ledger::get_attendance(&tx, attendance_id)?
        .ok_or_else(|| EngineError::NotFound(format!("attendance {} not found", attendance_id)))?;
    let note = note.unwrap_or(&attendance.note).to_string();

    if is_attend == attendance.is_attend {
        if note == attendance.note {
            return Ok(UpdateOutcome::Unchanged);
        }
        let updated = ledger::set_attendance_state(&tx, attendance_id, is_attend, &note, user_id)?;
        tx.commit()?;
        return Ok(UpdateOutcome::NoteUpdated {
            attendance: updated,
        });
    }

    ensure_editable_period(&attendance, today)?;

    let (updated, payment) = apply_toggle(&tx, &attendance, is_attend, &note, user_id)?;
    tx.commit()?;
    debug!(
        attendance_id = %updated.id,
        is_attend,
        total_payment = payment.total_payment,
        "attendance toggled"
    );
    Ok(UpdateOutcome::Toggled {
        attendance: updated,
        payment,
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpdateItem {
    pub student_id: String,
    pub session_id: String,
    pub attendance_id: String,
    pub is_attend: bool,
    #[serde(default)]
    pub note: String,
}

/// Applies every item or none. All items are validated before the first write,
/// inside the same transaction as the writes.
pub fn update_batch_attendance(
    conn: &Connection,
    class_id: &str,
    learning_date: NaiveDate,
    items: &[BatchUpdateItem],
    user_id: &str,
    today: NaiveDate,
) -> EngineResult<Vec<Attendance>> {
    if items.is_empty() {
        return Err(EngineError::BadRequest("attendances must not be empty".to_string()));
    }
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    if !directory::class_exists(&tx, class_id)? {
        return Err(EngineError::BadRequest(format!("class {} not found", class_id)));
    }

    let mut seen = HashSet::new();
    let mut validated: Vec<(&BatchUpdateItem, Attendance)> = Vec::with_capacity(items.len());
    for item in items {
        if !seen.insert(item.attendance_id.as_str()) {
            return Err(EngineError::BadRequest(format!(
                "attendance {} listed more than once",
                item.attendance_id
            )));
        }
        let session = directory::get_session(&tx, &item.session_id)?;
        match session {
            Some(s) if s.class_id == class_id && s.covers(learning_date) => {}
            _ => {
                return Err(EngineError::BadRequest(format!(
                    "session {} does not belong to class {} on {}",
                    item.session_id, class_id, learning_date
                )))
            }
        }
        if learning_date > today && !directory::is_active_member(&tx, &item.student_id, class_id)? {
            return Err(EngineError::BadRequest(format!(
                "student {} does not belong to class {}",
                item.student_id, class_id
            )));
        }
        let existing = ledger::find_matching_attendance(
            &tx,
            &item.attendance_id,
            &item.student_id,
            &item.session_id,
            learning_date,
        )?
        .ok_or_else(|| {
            EngineError::BadRequest(format!(
                "attendance record not found for student {} in session {}",
                item.student_id, item.session_id
            ))
        })?;
        if existing.is_attend != item.is_attend {
            ensure_editable_period(&existing, today)?;
        }
        validated.push((item, existing));
    }

    let mut out = Vec::with_capacity(validated.len());
    for (item, existing) in validated {
        let updated = if existing.is_attend != item.is_attend {
            apply_toggle(&tx, &existing, item.is_attend, &item.note, user_id)?.0
        } else if existing.note != item.note {
            ledger::set_attendance_state(&tx, &existing.id, item.is_attend, &item.note, user_id)?
        } else {
            existing
        };
        out.push(updated);
    }
    tx.commit()?;
    Ok(out)
}
