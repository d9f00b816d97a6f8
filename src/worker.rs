//! Job worker pool.
//!
//! Each worker thread owns its own database connection and lock store handle
//! and pulls jobs from the shared queue table. Nothing is shared in memory
//! between workers, so several daemons can drain one workspace together.

use crate::attendance::{self, CreateAttendanceRequest, CreateOutcome};
use crate::batch::tracker;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::keys::BatchKey;
use crate::queue::{self, ClaimedJob, CreateAttendanceJob, JobRequest};
use crate::store::{LockCounterStore, SqliteLockStore};
use rusqlite::Connection;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum JobOutcome {
    #[serde(rename_all = "camelCase")]
    Created {
        attendance_id: String,
        payment_id: String,
    },
    Skipped {
        reason: SkipReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    NotAttending,
    LockExpired,
    AlreadyRecorded,
}

/// Runs one create-attendance job. Does not touch the queue or the counter.
pub fn execute_create(
    conn: &Connection,
    store: &dyn LockCounterStore,
    job: &CreateAttendanceJob,
) -> EngineResult<JobOutcome> {
    let batch = BatchKey::from_id(&job.batch_id);
    if !store.exists(&batch.lock_key())? {
        return Ok(JobOutcome::Skipped {
            reason: SkipReason::LockExpired,
        });
    }

    let req = CreateAttendanceRequest {
        student_id: job.student_id.clone(),
        session_id: job.session_id.clone(),
        learning_date: job.learning_date,
        is_attend: job.is_attend,
        note: job.note.clone(),
    };
    match attendance::create_attendance(conn, &req, &job.created_by) {
        Ok(CreateOutcome::Created {
            attendance,
            payment,
        }) => Ok(JobOutcome::Created {
            attendance_id: attendance.id,
            payment_id: payment.id,
        }),
        Ok(CreateOutcome::NotAttending) => Ok(JobOutcome::Skipped {
            reason: SkipReason::NotAttending,
        }),
        // A previous attempt committed before its worker died.
        Err(EngineError::Conflict(_)) => Ok(JobOutcome::Skipped {
            reason: SkipReason::AlreadyRecorded,
        }),
        Err(e) => Err(e),
    }
}

fn execute(
    conn: &Connection,
    store: &dyn LockCounterStore,
    claimed: &ClaimedJob,
) -> EngineResult<JobOutcome> {
    match claimed.request()? {
        JobRequest::CreateAttendance(job) => execute_create(conn, store, &job),
    }
}

/// Runs a claimed job to its next state and, when that state is final,
/// reports it to the batch exactly once.
pub fn process_claimed(
    conn: &Connection,
    store: &dyn LockCounterStore,
    cfg: &EngineConfig,
    claimed: &ClaimedJob,
) -> EngineResult<()> {
    let batch = BatchKey::from_id(&claimed.batch_key);
    match execute(conn, store, claimed) {
        Ok(outcome) => {
            debug!(job_key = %claimed.job_key, ?outcome, "job completed");
            queue::mark_completed(conn, &claimed.job_key, &serde_json::to_value(&outcome)?)?;
        }
        Err(e) if e.is_retryable() && claimed.attempts < cfg.max_attempts => {
            let delay = cfg.backoff_for(claimed.attempts);
            warn!(
                job_key = %claimed.job_key,
                attempt = claimed.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "job failed, retrying"
            );
            queue::reschedule(conn, &claimed.job_key, &e.to_string(), delay)?;
            return Ok(());
        }
        Err(e) => {
            warn!(
                job_key = %claimed.job_key,
                attempt = claimed.attempts,
                error = %e,
                "job failed"
            );
            queue::mark_failed(conn, &claimed.job_key, &e.to_string())?;
        }
    }
    tracker::report(store, &batch, cfg.completion_retention)?;
    Ok(())
}

pub struct WorkerPool {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(db_path: PathBuf, cfg: EngineConfig) -> anyhow::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(cfg.workers);
        for worker_id in 0..cfg.workers {
            let conn = crate::db::open_connection(&db_path)?;
            let store = SqliteLockStore::open(&db_path)?;
            let cfg = cfg.clone();
            let shutdown = Arc::clone(&shutdown);
            let handle = std::thread::Builder::new()
                .name(format!("attendance-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, conn, store, cfg, shutdown))?;
            handles.push(handle);
        }
        info!(workers = cfg.workers, db = %db_path.display(), "worker pool started");
        Ok(WorkerPool { shutdown, handles })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        info!("worker pool stopped");
    }
}

fn worker_loop(
    worker_id: usize,
    conn: Connection,
    store: SqliteLockStore,
    cfg: EngineConfig,
    shutdown: Arc<AtomicBool>,
) {
    // Worker 0 also sweeps for jobs abandoned by dead workers.
    let sweep_every = cfg.stall_timeout.min(Duration::from_secs(60));
    let mut next_sweep = Instant::now();

    while !shutdown.load(Ordering::Acquire) {
        if worker_id == 0 && Instant::now() >= next_sweep {
            match queue::requeue_stalled(&conn, cfg.stall_timeout) {
                Ok(0) => {}
                Ok(n) => warn!(requeued = n, "requeued stalled jobs"),
                Err(e) => warn!(error = %e, "stalled job sweep failed"),
            }
            next_sweep = Instant::now() + sweep_every;
        }

        match queue::claim_next(&conn) {
            Ok(Some(claimed)) => {
                if let Err(e) = process_claimed(&conn, &store, &cfg, &claimed) {
                    error!(worker_id, job_key = %claimed.job_key, error = %e, "job bookkeeping failed");
                }
            }
            Ok(None) => std::thread::sleep(cfg.poll_interval),
            Err(e) => {
                warn!(worker_id, error = %e, "claim failed");
                std::thread::sleep(cfg.poll_interval);
            }
        }
    }
    debug!(worker_id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{get_batch_status, submit_batch, SubmitBatchRequest};
    use crate::directory::{self, NewSession};
    use crate::ledger;
    use crate::model::{LedgerMonth, Status};
    use crate::selection::Selection;
    use chrono::{Datelike, NaiveDate, Utc};

    struct Fixture {
        dir: tempfile::TempDir,
        conn: Connection,
        store: SqliteLockStore,
        class_id: String,
        session_id: String,
        students: Vec<String>,
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    /// Runs due jobs on the calling thread until the queue is empty.
    fn drain(conn: &Connection, store: &dyn LockCounterStore, cfg: &EngineConfig) -> EngineResult<usize> {
        let mut n = 0;
        while let Some(claimed) = queue::claim_next(conn)? {
            process_claimed(conn, store, cfg, &claimed)?;
            n += 1;
        }
        Ok(n)
    }

    fn fixture(n: usize, fee: i64) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = crate::db::open_db(dir.path()).expect("open db");
        let store = SqliteLockStore::open(&crate::db::db_path(dir.path())).expect("store");
        let class_id = directory::create_class(&conn, "Chemistry").expect("class");
        let session = directory::create_session(
            &conn,
            &NewSession {
                class_id: class_id.clone(),
                weekday: "THU".into(),
                start_time: "18:00".into(),
                end_time: "19:30".into(),
                amount: fee,
                valid_from: today().with_day(1).expect("day"),
                valid_to: None,
            },
        )
        .expect("session");
        let students = (0..n)
            .map(|i| {
                let id = directory::create_student(&conn, &format!("student {i}"), 10).expect("student");
                directory::set_membership(&conn, &id, &class_id, Status::Active).expect("enroll");
                id
            })
            .collect();
        Fixture {
            dir,
            conn,
            store,
            class_id,
            session_id: session.id,
            students,
        }
    }

    fn submit(f: &Fixture, cfg: &EngineConfig, selection: Selection) -> crate::batch::BatchSubmission {
        submit_batch(
            &f.conn,
            &f.store,
            cfg,
            &SubmitBatchRequest {
                class_id: f.class_id.clone(),
                session_id: f.session_id.clone(),
                learning_date: today(),
                selection,
                submitted_by: "teacher-1".into(),
            },
        )
        .expect("submit")
    }

    fn all_except(ids: &[String]) -> Selection {
        Selection {
            is_selected_all: true,
            selected_student_ids: vec![],
            unselected_student_ids: ids.to_vec(),
        }
    }

    #[test]
    fn batch_converges_and_writes_only_present_students() {
        let f = fixture(4, 100);
        let cfg = EngineConfig::default();
        let out = submit(&f, &cfg, all_except(&f.students[1..2]));
        assert_eq!(out.enqueued, 4);

        assert_eq!(drain(&f.conn, &f.store, &cfg).expect("drain"), 4);

        let status = get_batch_status(&f.conn, &f.store, &out.batch_id).expect("status");
        assert!(!status.held);
        assert!(status.completed);
        assert!(status.completion.is_some());
        assert_eq!(status.jobs.completed, 4);

        let batch = BatchKey::from_id(&out.batch_id);
        assert!(!f.store.exists(&batch.counter_key()).expect("exists"));

        let page = ledger::find_attendances(&f.conn, &ledger::AttendanceFilter::default())
            .expect("find");
        assert_eq!(page.statistic.total, 3);
        let month = LedgerMonth::of(today());
        assert!(ledger::get_payment_for_month(&f.conn, &f.students[1], month)
            .expect("payment")
            .is_none());
        let p0 = ledger::get_payment_for_month(&f.conn, &f.students[0], month)
            .expect("payment")
            .expect("exists");
        assert_eq!(p0.total_payment, 110);
    }

    #[test]
    fn resubmission_while_in_flight_creates_nothing_new() {
        let f = fixture(2, 100);
        let cfg = EngineConfig::default();
        let first = submit(&f, &cfg, all_except(&[]));
        let second = submit(&f, &cfg, all_except(&[]));
        assert!(second.in_flight);
        drain(&f.conn, &f.store, &cfg).expect("drain");

        // Finished jobs run again but find their rows already recorded.
        let third = submit(&f, &cfg, all_except(&[]));
        assert_eq!((third.enqueued, third.skipped), (2, 0));
        assert_eq!(first.batch_id, third.batch_id);
        assert_eq!(drain(&f.conn, &f.store, &cfg).expect("drain"), 2);

        let page = ledger::find_attendances(&f.conn, &ledger::AttendanceFilter::default())
            .expect("find");
        assert_eq!(page.statistic.total, 2);
        let p0 = ledger::get_payment_for_month(&f.conn, &f.students[0], LedgerMonth::of(today()))
            .expect("payment")
            .expect("exists");
        assert_eq!((p0.total_sessions, p0.total_payment), (1, 110));
        let status = get_batch_status(&f.conn, &f.store, &third.batch_id).expect("status");
        assert!(status.completed);
        assert_eq!(status.jobs.completed, 2);
    }

    #[test]
    fn abandoned_batch_can_be_run_again() {
        let f = fixture(1, 100);
        let short = EngineConfig {
            lock_ttl: Duration::from_millis(1),
            ..EngineConfig::default()
        };
        submit(&f, &short, all_except(&[]));
        std::thread::sleep(Duration::from_millis(20));
        drain(&f.conn, &f.store, &short).expect("drain");
        let page = ledger::find_attendances(&f.conn, &ledger::AttendanceFilter::default())
            .expect("find");
        assert_eq!(page.statistic.total, 0);

        let cfg = EngineConfig::default();
        let again = submit(&f, &cfg, all_except(&[]));
        assert_eq!((again.enqueued, again.skipped), (1, 0));
        drain(&f.conn, &f.store, &cfg).expect("drain");
        let page = ledger::find_attendances(&f.conn, &ledger::AttendanceFilter::default())
            .expect("find");
        assert_eq!(page.statistic.total, 1);
        let status = get_batch_status(&f.conn, &f.store, &again.batch_id).expect("status");
        assert!(status.completed);
        assert!(status.completion.is_some());
    }

    #[test]
    fn failed_job_runs_again_on_resubmission() {
        let f = fixture(1, 100);
        let cfg = EngineConfig::default();
        let student = &f.students[0];
        submit(&f, &cfg, all_except(&[]));
        directory::set_membership(&f.conn, student, &f.class_id, Status::Inactive).expect("leave");
        drain(&f.conn, &f.store, &cfg).expect("drain");
        let month = LedgerMonth::of(today());
        assert!(ledger::get_payment_for_month(&f.conn, student, month)
            .expect("payment")
            .is_none());

        directory::set_membership(&f.conn, student, &f.class_id, Status::Active).expect("rejoin");
        let again = submit(&f, &cfg, all_except(&[]));
        assert_eq!(again.enqueued, 1);
        drain(&f.conn, &f.store, &cfg).expect("drain");

        let payment = ledger::get_payment_for_month(&f.conn, student, month)
            .expect("payment")
            .expect("exists");
        assert_eq!(payment.total_attend, 1);
        let status = get_batch_status(&f.conn, &f.store, &again.batch_id).expect("status");
        assert_eq!((status.jobs.completed, status.jobs.failed), (1, 0));
        assert!(status.failures.is_empty());
    }

    #[test]
    fn failed_job_still_reports() {
        let f = fixture(2, 100);
        let cfg = EngineConfig::default();
        let out = submit(&f, &cfg, all_except(&[]));
        // The second student leaves the class after the roster was taken.
        directory::set_membership(&f.conn, &f.students[1], &f.class_id, Status::Inactive)
            .expect("leave");
        drain(&f.conn, &f.store, &cfg).expect("drain");

        let status = get_batch_status(&f.conn, &f.store, &out.batch_id).expect("status");
        assert!(status.completed);
        assert!(!status.held);
        assert_eq!(status.jobs.failed, 1);
        assert_eq!(status.failures.len(), 1);
        assert!(status.failures[0]
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("does not belong"));
    }

    #[test]
    fn expired_lock_skips_without_writing() {
        let f = fixture(1, 100);
        let cfg = EngineConfig {
            lock_ttl: Duration::from_millis(1),
            ..EngineConfig::default()
        };
        let out = submit(&f, &cfg, all_except(&[]));
        std::thread::sleep(Duration::from_millis(20));
        drain(&f.conn, &f.store, &cfg).expect("drain");

        let page = ledger::find_attendances(&f.conn, &ledger::AttendanceFilter::default())
            .expect("find");
        assert_eq!(page.statistic.total, 0);
        let status = get_batch_status(&f.conn, &f.store, &out.batch_id).expect("status");
        assert_eq!(status.jobs.completed, 1);
    }

    #[test]
    fn pool_drains_queue_in_background() {
        let f = fixture(6, 100);
        let cfg = EngineConfig {
            workers: 3,
            poll_interval: Duration::from_millis(5),
            ..EngineConfig::default()
        };
        let out = submit(&f, &cfg, all_except(&[]));
        let pool = WorkerPool::start(crate::db::db_path(f.dir.path()), cfg).expect("pool");
        assert_eq!(pool.size(), 3);

        let deadline = Instant::now() + Duration::from_secs(10);
        let status = loop {
            let status = get_batch_status(&f.conn, &f.store, &out.batch_id).expect("status");
            if status.completed || Instant::now() > deadline {
                break status;
            }
            std::thread::sleep(Duration::from_millis(10));
        };
        drop(pool);
        assert!(status.completed);
        let page = ledger::find_attendances(&f.conn, &ledger::AttendanceFilter::default())
            .expect("find");
        assert_eq!(page.statistic.total, 6);
    }
}
