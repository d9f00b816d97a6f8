use crate::batch::tracker;
use crate::config::EngineConfig;
use crate::directory;
use crate::error::{EngineError, EngineResult};
use crate::keys::{self, BatchKey};
use crate::queue::{self, CreateAttendanceJob, JobRequest};
use crate::selection::{self, Selection};
use crate::store::LockCounterStore;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{error, info, warn};

/// One student's decision within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub class_id: String,
    pub session_id: String,
    pub learning_date: NaiveDate,
    pub student_id: String,
    pub is_attend: bool,
    pub note: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSubmission {
    pub batch_id: String,
    pub total_jobs: usize,
    pub enqueued: usize,
    pub skipped: usize,
    /// Another submission of the same batch still holds the lock.
    pub in_flight: bool,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct SubmitBatchRequest {
    pub class_id: String,
    pub session_id: String,
    pub learning_date: NaiveDate,
    pub selection: Selection,
    pub submitted_by: String,
}

/// Resolves the class roster against the selection and dispatches the result.
pub fn submit_batch(
    conn: &Connection,
    store: &dyn LockCounterStore,
    cfg: &EngineConfig,
    req: &SubmitBatchRequest,
) -> EngineResult<BatchSubmission> {
    if !directory::class_exists(conn, &req.class_id)? {
        return Err(EngineError::NotFound(format!("class {} not found", req.class_id)));
    }
    let roster = directory::get_active_roster(conn, &req.class_id)?;
    let flags = selection::resolve(&roster, &req.selection)?;
    let Some(session) = directory::get_session(conn, &req.session_id)? else {
        return Err(EngineError::NotFound(format!("session {} not found", req.session_id)));
    };
    if session.class_id != req.class_id {
        return Err(EngineError::InvalidBatch(format!(
            "session {} does not belong to class {}",
            req.session_id, req.class_id
        )));
    }
    let items: Vec<BatchItem> = flags
        .into_iter()
        .map(|f| BatchItem {
            class_id: req.class_id.clone(),
            session_id: req.session_id.clone(),
            learning_date: req.learning_date,
            student_id: f.student_id,
            is_attend: f.is_attend,
            note: String::new(),
        })
        .collect();
    dispatch(conn, store, cfg, &items, &req.submitted_by)
}

fn batch_key_for(items: &[BatchItem]) -> EngineResult<BatchKey> {
    let Some(first) = items.first() else {
        return Err(EngineError::InvalidBatch("batch has no students".to_string()));
    };
    let homogeneous = items.iter().all(|it| {
        it.class_id == first.class_id
            && it.session_id == first.session_id
            && it.learning_date == first.learning_date
    });
    if !homogeneous {
        return Err(EngineError::InvalidBatch(
            "all attendances must be from same class, session, and date".to_string(),
        ));
    }
    Ok(BatchKey::new(
        &first.class_id,
        &first.session_id,
        first.learning_date,
    ))
}

/// Locks the batch, seeds its counter and enqueues one job per student.
/// Returns as soon as the jobs are queued.
pub fn dispatch(
    conn: &Connection,
    store: &dyn LockCounterStore,
    cfg: &EngineConfig,
    items: &[BatchItem],
    submitted_by: &str,
) -> EngineResult<BatchSubmission> {
    let batch = batch_key_for(items)?;
    let total = items.len();

    let acquired = store.try_acquire_lock_and_seed_counter(
        &batch.lock_key(),
        &batch.counter_key(),
        cfg.lock_ttl,
        total as i64,
    )?;
    if !acquired {
        warn!(batch_id = %batch, "batch is already being processed");
        return Ok(BatchSubmission {
            batch_id: batch.id().to_string(),
            total_jobs: total,
            enqueued: 0,
            skipped: 0,
            in_flight: true,
            message: "Batch is already being processed".to_string(),
        });
    }
    info!(batch_id = %batch, jobs = total, "lock set for batch");

    let jobs: Vec<(String, JobRequest)> = items
        .iter()
        .map(|it| {
            (
                keys::job_key(&it.student_id, &it.session_id, it.learning_date),
                JobRequest::CreateAttendance(CreateAttendanceJob {
                    student_id: it.student_id.clone(),
                    session_id: it.session_id.clone(),
                    class_id: it.class_id.clone(),
                    learning_date: it.learning_date,
                    is_attend: it.is_attend,
                    note: it.note.clone(),
                    created_by: submitted_by.to_string(),
                    batch_id: batch.id().to_string(),
                }),
            )
        })
        .collect();

    let outcome = match queue::enqueue_bulk(conn, batch.id(), &jobs) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(batch_id = %batch, error = %e, "enqueue failed, releasing batch");
            tracker::release(store, &batch)?;
            return Err(e);
        }
    };

    if outcome.added == 0 {
        tracker::release(store, &batch)?;
        info!(batch_id = %batch, "released lock, no jobs added");
    } else if outcome.skipped > 0 {
        // Duplicates never report back; take them off the counter now.
        let remaining = store.decrement_and_get(&batch.counter_key(), outcome.skipped as i64)?;
        if remaining.is_some_and(|r| r <= 0) {
            tracker::complete(store, &batch, cfg.completion_retention)?;
        }
    }
    info!(
        batch_id = %batch,
        total,
        added = outcome.added,
        skipped = outcome.skipped,
        "queued batch"
    );

    Ok(BatchSubmission {
        batch_id: batch.id().to_string(),
        total_jobs: total,
        enqueued: outcome.added,
        skipped: outcome.skipped,
        in_flight: false,
        message: format!(
            "Processed {} jobs, skipped {} duplicates",
            outcome.added, outcome.skipped
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::NewSession;
    use crate::model::Status;
    use crate::store::SqliteLockStore;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    fn item(student: &str, session: &str) -> BatchItem {
        BatchItem {
            class_id: "c1".into(),
            session_id: session.into(),
            learning_date: NaiveDate::from_ymd_opt(2026, 10, 16).expect("date"),
            student_id: student.into(),
            is_attend: true,
            note: String::new(),
        }
    }

    fn setup() -> (tempfile::TempDir, Connection, SqliteLockStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = crate::db::open_db(dir.path()).expect("open db");
        let store = SqliteLockStore::open(&crate::db::db_path(dir.path())).expect("store");
        (dir, conn, store)
    }

    #[test]
    fn mixed_sessions_are_rejected_before_locking() {
        let (_dir, conn, store) = setup();
        let cfg = EngineConfig::default();
        let err = dispatch(&conn, &store, &cfg, &[item("a", "s1"), item("b", "s2")], "u")
            .expect_err("mixed");
        assert!(matches!(err, EngineError::InvalidBatch(_)));
        let batch = batch_key_for(&[item("a", "s1")]).expect("key");
        assert!(!store.exists(&batch.lock_key()).expect("exists"));
    }

    #[test]
    fn second_submission_is_in_flight() {
        let (_dir, conn, store) = setup();
        let cfg = EngineConfig::default();
        let items = [item("a", "s1"), item("b", "s1")];
        let first = dispatch(&conn, &store, &cfg, &items, "u").expect("first");
        assert_eq!(first.enqueued, 2);
        assert!(!first.in_flight);

        let second = dispatch(&conn, &store, &cfg, &items, "u").expect("second");
        assert!(second.in_flight);
        assert_eq!(second.batch_id, first.batch_id);
        assert_eq!(queue::job_counts(&conn, &first.batch_id).expect("counts").queued, 2);
    }

    #[test]
    fn all_duplicates_release_immediately() {
        let (_dir, conn, store) = setup();
        let cfg = EngineConfig::default();
        let items = [item("a", "s1")];
        let first = dispatch(&conn, &store, &cfg, &items, "u").expect("first");
        let batch = BatchKey::from_id(&first.batch_id);
        // Simulate the batch finishing.
        tracker::report(&store, &batch, cfg.completion_retention).expect("report");
        assert!(!store.exists(&batch.lock_key()).expect("exists"));

        let again = dispatch(&conn, &store, &cfg, &items, "u").expect("again");
        assert_eq!(again.enqueued, 0);
        assert_eq!(again.skipped, 1);
        assert!(!store.exists(&batch.lock_key()).expect("exists"));
        assert!(!store.exists(&batch.counter_key()).expect("exists"));
    }

    #[test]
    fn skipped_duplicates_come_off_the_counter() {
        let (_dir, conn, store) = setup();
        let cfg = EngineConfig::default();
        let early = [item("a", "s1")];
        let first = dispatch(&conn, &store, &cfg, &early, "u").expect("first");
        let batch = BatchKey::from_id(&first.batch_id);
        tracker::report(&store, &batch, cfg.completion_retention).expect("report");

        let full = [item("a", "s1"), item("b", "s1"), item("c", "s1")];
        let out = dispatch(&conn, &store, &cfg, &full, "u").expect("full");
        assert_eq!((out.enqueued, out.skipped), (2, 1));
        assert_eq!(store.get(&batch.counter_key()).expect("get").as_deref(), Some("2"));
    }

    /// Applies worker reports that land between enqueue and the duplicate
    /// subtraction.
    struct RacingStore {
        inner: SqliteLockStore,
        pending_reports: AtomicI64,
    }

    impl LockCounterStore for RacingStore {
        fn try_acquire_lock_and_seed_counter(
            &self,
            lock_key: &str,
            counter_key: &str,
            ttl: Duration,
            count: i64,
        ) -> EngineResult<bool> {
            self.inner
                .try_acquire_lock_and_seed_counter(lock_key, counter_key, ttl, count)
        }

        fn exists(&self, key: &str) -> EngineResult<bool> {
            self.inner.exists(key)
        }

        fn get(&self, key: &str) -> EngineResult<Option<String>> {
            self.inner.get(key)
        }

        fn decrement_and_get(&self, key: &str, by: i64) -> EngineResult<Option<i64>> {
            let pending = self.pending_reports.swap(0, Ordering::SeqCst);
            if pending > 0 {
                self.inner.decrement_and_get(key, pending)?;
            }
            self.inner.decrement_and_get(key, by)
        }

        fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<()> {
            self.inner.set_with_ttl(key, value, ttl)
        }

        fn delete_keys(&self, keys: &[&str]) -> EngineResult<()> {
            self.inner.delete_keys(keys)
        }
    }

    #[test]
    fn subtraction_that_finishes_the_batch_leaves_a_marker() {
        let (_dir, conn, inner) = setup();
        let store = RacingStore {
            inner,
            pending_reports: AtomicI64::new(0),
        };
        let cfg = EngineConfig::default();
        let first = dispatch(&conn, &store, &cfg, &[item("a", "s1")], "u").expect("first");
        let batch = BatchKey::from_id(&first.batch_id);
        tracker::report(&store, &batch, cfg.completion_retention).expect("report");
        assert!(tracker::completion_marker(&store, &batch).expect("marker").is_some());
        store.delete_keys(&[batch.completed_key().as_str()]).expect("clear marker");

        // "b" is drained by a worker before the dispatcher subtracts "a".
        store.pending_reports.store(1, Ordering::SeqCst);
        let out = dispatch(&conn, &store, &cfg, &[item("a", "s1"), item("b", "s1")], "u")
            .expect("second");
        assert_eq!((out.enqueued, out.skipped), (1, 1));
        assert!(!store.exists(&batch.lock_key()).expect("exists"));
        assert!(!store.exists(&batch.counter_key()).expect("exists"));
        let marker = tracker::completion_marker(&store, &batch)
            .expect("marker")
            .expect("marker written");
        assert_eq!(marker.batch_id, batch.id());
    }

    #[test]
    fn session_from_another_class_is_rejected_before_locking() {
        let (_dir, conn, store) = setup();
        let cfg = EngineConfig::default();
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).expect("date");
        let class_id = directory::create_class(&conn, "Biology").expect("class");
        let other_class = directory::create_class(&conn, "History").expect("class");
        let student = directory::create_student(&conn, "s", 0).expect("student");
        directory::set_membership(&conn, &student, &class_id, Status::Active).expect("enroll");
        let foreign = directory::create_session(
            &conn,
            &NewSession {
                class_id: other_class,
                weekday: "FRI".into(),
                start_time: "09:00".into(),
                end_time: "10:00".into(),
                amount: 40,
                valid_from: NaiveDate::from_ymd_opt(2026, 1, 1).expect("date"),
                valid_to: None,
            },
        )
        .expect("session");
        let request = |session_id: &str| SubmitBatchRequest {
            class_id: class_id.clone(),
            session_id: session_id.to_string(),
            learning_date: date,
            selection: Selection {
                is_selected_all: true,
                selected_student_ids: Vec::new(),
                unselected_student_ids: Vec::new(),
            },
            submitted_by: "u".into(),
        };

        let err = submit_batch(&conn, &store, &cfg, &request(&foreign.id)).expect_err("foreign");
        assert!(matches!(err, EngineError::InvalidBatch(_)));
        let batch = BatchKey::new(&class_id, &foreign.id, date);
        assert!(!store.exists(&batch.lock_key()).expect("exists"));
        assert_eq!(queue::job_counts(&conn, batch.id()).expect("counts").queued, 0);

        let err = submit_batch(&conn, &store, &cfg, &request("missing")).expect_err("missing");
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
