use crate::error::EngineResult;
use crate::keys::BatchKey;
use crate::store::LockCounterStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMarker {
    pub batch_id: String,
    pub completed_at: String,
    pub status: String,
}

/// Drops the batch lock and its counter.
pub fn release(store: &dyn LockCounterStore, batch: &BatchKey) -> EngineResult<()> {
    let lock_key = batch.lock_key();
    let counter_key = batch.counter_key();
    store.delete_keys(&[lock_key.as_str(), counter_key.as_str()])?;
    debug!(batch_id = %batch, "released lock and counter");
    Ok(())
}

/// Counts one finished job against its batch. The job that brings the counter
/// to zero releases the batch and leaves a completion marker behind.
///
/// Returns the remaining count, or `None` when the counter is already gone
/// (batch released or expired), in which case nothing is changed.
pub fn report(
    store: &dyn LockCounterStore,
    batch: &BatchKey,
    retention: Duration,
) -> EngineResult<Option<i64>> {
    let Some(remaining) = store.decrement_and_get(&batch.counter_key(), 1)? else {
        debug!(batch_id = %batch, "counter missing, report ignored");
        return Ok(None);
    };
    debug!(batch_id = %batch, remaining, "job reported");
    if remaining <= 0 {
        complete(store, batch, retention)?;
    }
    Ok(Some(remaining))
}

/// Releases the batch and leaves a completion marker that outlives it for
/// `retention`.
pub fn complete(
    store: &dyn LockCounterStore,
    batch: &BatchKey,
    retention: Duration,
) -> EngineResult<()> {
    release(store, batch)?;
    let marker = CompletionMarker {
        batch_id: batch.id().to_string(),
        completed_at: Utc::now().to_rfc3339(),
        status: "completed".to_string(),
    };
    store.set_with_ttl(
        &batch.completed_key(),
        &serde_json::to_string(&marker)?,
        retention,
    )?;
    info!(batch_id = %batch, "all jobs processed, batch released");
    Ok(())
}

pub fn completion_marker(
    store: &dyn LockCounterStore,
    batch: &BatchKey,
) -> EngineResult<Option<CompletionMarker>> {
    match store.get(&batch.completed_key())? {
        Some(raw) => Ok(serde_json::from_str(&raw).ok()),
        None => Ok(None),
    }
}
