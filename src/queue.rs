//! Durable job queue keyed by job id.
//!
//! A job id is deduplicated only while its job is queued or active; finished
//! rows stay for inspection until the same id is submitted again. Claiming is
//! a single UPDATE ... RETURNING, which SQLite serializes, so two workers can
//! never hold the same job.

use crate::error::EngineResult;
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAttendanceJob {
    pub student_id: String,
    pub session_id: String,
    pub class_id: String,
    pub learning_date: NaiveDate,
    pub is_attend: bool,
    #[serde(default)]
    pub note: String,
    pub created_by: String,
    pub batch_id: String,
}

/// Work a queued job carries, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum JobRequest {
    CreateAttendance(CreateAttendanceJob),
}

impl JobRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            JobRequest::CreateAttendance(_) => "createAttendance",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job_key: String,
    pub batch_key: String,
    pub attempts: u32,
    pub payload: String,
}

impl ClaimedJob {
    pub fn request(&self) -> EngineResult<JobRequest> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub queued: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
    pub job_key: String,
    pub attempts: u32,
    pub error: Option<String>,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnqueueOutcome {
    pub added: usize,
    pub skipped: usize,
}

/// Adds every job whose key is not already queued or active, in one
/// transaction. A finished (completed or failed) job under the same key is
/// reset and queued again.
pub fn enqueue_bulk(
    conn: &Connection,
    batch_key: &str,
    jobs: &[(String, JobRequest)],
) -> EngineResult<EnqueueOutcome> {
    let tx = rusqlite::Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let now = now_millis();
    let mut outcome = EnqueueOutcome::default();
    {
        let mut stmt = tx.prepare(
            "INSERT INTO job_queue(job_key, batch_key, kind, payload, status, attempts, available_at, created_at, updated_at)
             VALUES(?1, ?2, ?3, ?4, 'queued', 0, ?5, ?5, ?5)
             ON CONFLICT(job_key) DO UPDATE SET
               batch_key = excluded.batch_key,
               kind = excluded.kind,
               payload = excluded.payload,
               status = 'queued',
               attempts = 0,
               available_at = excluded.available_at,
               last_error = NULL,
               result = NULL,
               updated_at = excluded.updated_at
             WHERE job_queue.status IN ('completed', 'failed')",
        )?;
        for (job_key, request) in jobs {
            let payload = serde_json::to_string(request)?;
            let changed = stmt.execute(params![job_key, batch_key, request.kind(), payload, now])?;
            if changed == 0 {
                outcome.skipped += 1;
            } else {
                outcome.added += 1;
            }
        }
    }
    tx.commit()?;
    Ok(outcome)
}

/// Takes the oldest due job and marks it active.
pub fn claim_next(conn: &Connection) -> EngineResult<Option<ClaimedJob>> {
    let now = now_millis();
    let row: Option<(String, String, u32, String)> = conn
        .query_row(
            "UPDATE job_queue SET status = 'active', attempts = attempts + 1, updated_at = ?1
             WHERE job_key = (
                 SELECT job_key FROM job_queue
                 WHERE status = 'queued' AND available_at <= ?1
                 ORDER BY available_at, created_at
                 LIMIT 1
             )
             RETURNING job_key, batch_key, attempts, payload",
            [now],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    Ok(row.map(|(job_key, batch_key, attempts, payload)| ClaimedJob {
        job_key,
        batch_key,
        attempts,
        payload,
    }))
}

pub fn mark_completed(conn: &Connection, job_key: &str, result: &serde_json::Value) -> EngineResult<()> {
    conn.execute(
        "UPDATE job_queue SET status = 'completed', result = ?2, last_error = NULL, updated_at = ?3
         WHERE job_key = ?1",
        params![job_key, result.to_string(), now_millis()],
    )?;
    Ok(())
}

pub fn mark_failed(conn: &Connection, job_key: &str, error: &str) -> EngineResult<()> {
    conn.execute(
        "UPDATE job_queue SET status = 'failed', last_error = ?2, updated_at = ?3 WHERE job_key = ?1",
        params![job_key, error, now_millis()],
    )?;
    Ok(())
}

/// Puts a job back in line after `delay`.
pub fn reschedule(conn: &Connection, job_key: &str, error: &str, delay: Duration) -> EngineResult<()> {
    let now = now_millis();
    conn.execute(
        "UPDATE job_queue SET status = 'queued', last_error = ?2, available_at = ?3, updated_at = ?4
         WHERE job_key = ?1",
        params![job_key, error, now.saturating_add(millis(delay)), now],
    )?;
    Ok(())
}

/// Returns jobs left active by a worker that went away to the queue.
pub fn requeue_stalled(conn: &Connection, stall_timeout: Duration) -> EngineResult<usize> {
    let now = now_millis();
    let cutoff = now.saturating_sub(millis(stall_timeout));
    Ok(conn.execute(
        "UPDATE job_queue SET status = 'queued', available_at = ?2, updated_at = ?2
         WHERE status = 'active' AND updated_at < ?1",
        params![cutoff, now],
    )?)
}

pub fn job_counts(conn: &Connection, batch_key: &str) -> EngineResult<JobCounts> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM job_queue WHERE batch_key = ? GROUP BY status")?;
    let rows = stmt
        .query_map([batch_key], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut counts = JobCounts::default();
    for (status, n) in rows {
        match status.as_str() {
            "queued" => counts.queued = n,
            "active" => counts.active = n,
            "completed" => counts.completed = n,
            "failed" => counts.failed = n,
            _ => {}
        }
    }
    Ok(counts)
}

pub fn failed_jobs(conn: &Connection, batch_key: &str) -> EngineResult<Vec<FailedJob>> {
    let mut stmt = conn.prepare(
        "SELECT job_key, attempts, last_error FROM job_queue
         WHERE batch_key = ? AND status = 'failed'
         ORDER BY job_key",
    )?;
    let jobs = stmt
        .query_map([batch_key], |r| {
            Ok(FailedJob {
                job_key: r.get(0)?,
                attempts: r.get(1)?,
                error: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(jobs)
}
