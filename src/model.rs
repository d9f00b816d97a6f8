use chrono::{Datelike, NaiveDate};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Active,
    Inactive,
    Closed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Active => "ACTIVE",
            Status::Inactive => "INACTIVE",
            Status::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Status::Active),
            "INACTIVE" => Some(Status::Inactive),
            "CLOSED" => Some(Status::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Saved,
    Sent,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Saved => "SAVED",
            PaymentStatus::Sent => "SENT",
            PaymentStatus::Paid => "PAID",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SAVED" => Some(PaymentStatus::Saved),
            "SENT" => Some(PaymentStatus::Sent),
            "PAID" => Some(PaymentStatus::Paid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub class_id: String,
    pub weekday: String,
    pub start_time: String,
    pub end_time: String,
    pub amount: i64,
    pub valid_from: NaiveDate,
    pub valid_to: Option<NaiveDate>,
    pub status: Status,
}

impl Session {
    pub const COLUMNS: &'static str =
        "id, class_id, weekday, start_time, end_time, amount, valid_from, valid_to, status";

    pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = r.get(8)?;
        Ok(Session {
            id: r.get(0)?,
            class_id: r.get(1)?,
            weekday: r.get(2)?,
            start_time: r.get(3)?,
            end_time: r.get(4)?,
            amount: r.get(5)?,
            valid_from: r.get(6)?,
            valid_to: r.get(7)?,
            status: Status::parse(&status).unwrap_or(Status::Closed),
        })
    }

    /// A session can take attendance on `date` only while ACTIVE and inside
    /// its validity window (both ends inclusive, open-ended when `valid_to` is unset).
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.status == Status::Active
            && self.valid_from <= date
            && self.valid_to.map_or(true, |to| date <= to)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attendance {
    pub id: String,
    pub student_id: String,
    pub session_id: String,
    pub learning_date: NaiveDate,
    pub is_attend: bool,
    pub note: String,
    pub payment_id: Option<String>,
    pub created_by: String,
    pub updated_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Attendance {
    pub const COLUMNS: &'static str = "id, student_id, session_id, learning_date, is_attend, note, \
         payment_id, created_by, updated_by, created_at, updated_at";

    pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Attendance {
            id: r.get(0)?,
            student_id: r.get(1)?,
            session_id: r.get(2)?,
            learning_date: r.get(3)?,
            is_attend: r.get::<_, i64>(4)? != 0,
            note: r.get(5)?,
            payment_id: r.get(6)?,
            created_by: r.get(7)?,
            updated_by: r.get(8)?,
            created_at: r.get(9)?,
            updated_at: r.get(10)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub student_id: String,
    pub year: i32,
    pub month: u32,
    pub total_sessions: i64,
    pub total_attend: i64,
    pub total_month_amount: i64,
    pub total_payment: i64,
    pub status: PaymentStatus,
    pub paid_amount: Option<i64>,
    pub note: Option<String>,
    pub sent_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Payment {
    pub const COLUMNS: &'static str = "id, student_id, year, month, total_sessions, total_attend, \
         total_month_amount, total_payment, status, paid_amount, note, sent_at, created_at, updated_at";

    pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = r.get(8)?;
        Ok(Payment {
            id: r.get(0)?,
            student_id: r.get(1)?,
            year: r.get(2)?,
            month: r.get(3)?,
            total_sessions: r.get(4)?,
            total_attend: r.get(5)?,
            total_month_amount: r.get(6)?,
            total_payment: r.get(7)?,
            status: PaymentStatus::parse(&status).unwrap_or(PaymentStatus::Saved),
            paid_amount: r.get(9)?,
            note: r.get(10)?,
            sent_at: r.get(11)?,
            created_at: r.get(12)?,
            updated_at: r.get(13)?,
        })
    }
}

/// Calendar month a ledger row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMonth {
    pub year: i32,
    pub month: u32,
}

impl LedgerMonth {
    pub fn of(date: NaiveDate) -> Self {
        LedgerMonth {
            year: date.year(),
            month: date.month(),
        }
    }
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let t = raw.trim();
    // Accept full timestamps from clients; only the calendar date matters.
    let date_part = t.get(..10).unwrap_or(t);
    NaiveDate::parse_from_str(date_part, DATE_FORMAT).ok()
}
