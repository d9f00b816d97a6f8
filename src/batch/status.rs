use crate::batch::tracker::{self, CompletionMarker};
use crate::error::EngineResult;
use crate::keys::BatchKey;
use crate::queue::{self, FailedJob, JobCounts};
use crate::store::LockCounterStore;
use rusqlite::Connection;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatus {
    pub batch_id: String,
    pub held: bool,
    pub remaining: i64,
    pub completed: bool,
    pub completion: Option<CompletionMarker>,
    pub jobs: JobCounts,
    pub failures: Vec<FailedJob>,
}

/// Read-only snapshot for client polling.
pub fn get_batch_status(
    conn: &Connection,
    store: &dyn LockCounterStore,
    batch_id: &str,
) -> EngineResult<BatchStatus> {
    let batch = BatchKey::from_id(batch_id);
    let held = store.exists(&batch.lock_key())?;
    let remaining = store
        .get(&batch.counter_key())?
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(0);
    let completed = !held || remaining <= 0;
    let completion = if completed {
        tracker::completion_marker(store, &batch)?
    } else {
        None
    };
    Ok(BatchStatus {
        batch_id: batch.id().to_string(),
        held,
        remaining,
        completed,
        completion,
        jobs: queue::job_counts(conn, batch.id())?,
        failures: queue::failed_jobs(conn, batch.id())?,
    })
}
