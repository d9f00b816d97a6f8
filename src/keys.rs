//! Deterministic identifiers for batches and jobs.
//!
//! A batch is identified by (class, session, learning date) and a job by
//! (student, session, learning date). Dates are rendered as DDMMYYYY so the
//! ids stay readable in logs and in the lock/counter store.

use chrono::{Datelike, NaiveDate};

pub const LOCK_PREFIX: &str = "attendance-batch-lock:";
pub const COUNTER_PREFIX: &str = "attendance-batch-counter:";
pub const COMPLETED_PREFIX: &str = "batch-completed:";

fn compact_date(date: NaiveDate) -> String {
    format!("{:02}{:02}{:04}", date.day(), date.month(), date.year())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey(String);

impl BatchKey {
    pub fn new(class_id: &str, session_id: &str, learning_date: NaiveDate) -> Self {
        BatchKey(format!(
            "class-{}-session-{}-date-{}",
            class_id,
            session_id,
            compact_date(learning_date)
        ))
    }

    /// Rebuilds a key from the id handed back to clients.
    pub fn from_id(id: &str) -> Self {
        BatchKey(id.to_string())
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    pub fn lock_key(&self) -> String {
        format!("{}{}", LOCK_PREFIX, self.0)
    }

    pub fn counter_key(&self) -> String {
        format!("{}{}", COUNTER_PREFIX, self.0)
    }

    pub fn completed_key(&self) -> String {
        format!("{}{}", COMPLETED_PREFIX, self.0)
    }
}

impl std::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn job_key(student_id: &str, session_id: &str, learning_date: NaiveDate) -> String {
    format!(
        "student-{}-session-{}-date-{}",
        student_id,
        session_id,
        compact_date(learning_date)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_deterministic() {
        let date = NaiveDate::from_ymd_opt(2025, 12, 21).expect("date");
        let batch = BatchKey::new("123", "456", date);
        assert_eq!(batch.id(), "class-123-session-456-date-21122025");
        assert_eq!(
            batch.lock_key(),
            "attendance-batch-lock:class-123-session-456-date-21122025"
        );
        assert_eq!(
            batch.counter_key(),
            "attendance-batch-counter:class-123-session-456-date-21122025"
        );
        assert_eq!(BatchKey::new("123", "456", date), batch);
        assert_eq!(
            job_key("7", "456", date),
            "student-7-session-456-date-21122025"
        );
    }
}
