//! Lock/counter store shared by every process working a workspace.
//!
//! Batch locks, remaining-job counters and completion markers live here. All
//! multi-key operations run inside one IMMEDIATE transaction, so a check and
//! the write that depends on it can never interleave with another writer.

use crate::error::{EngineError, EngineResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

pub trait LockCounterStore: Send + Sync {
    /// Takes `lock_key` and seeds `counter_key` to `count` in one transaction.
    /// Returns false, writing nothing, when the lock is already held.
    fn try_acquire_lock_and_seed_counter(
        &self,
        lock_key: &str,
        counter_key: &str,
        ttl: Duration,
        count: i64,
    ) -> EngineResult<bool>;

    fn exists(&self, key: &str) -> EngineResult<bool>;

    fn get(&self, key: &str) -> EngineResult<Option<String>>;

    /// Atomically subtracts `by` and returns the new value. A missing or
    /// expired key is left alone and yields `None`.
    fn decrement_and_get(&self, key: &str, by: i64) -> EngineResult<Option<i64>>;

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<()>;

    fn delete_keys(&self, keys: &[&str]) -> EngineResult<()>;
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Duration) -> i64 {
    now_millis().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

pub struct SqliteLockStore {
    conn: Mutex<Connection>,
}

impl SqliteLockStore {
    pub fn new(conn: Connection) -> Self {
        SqliteLockStore {
            conn: Mutex::new(conn),
        }
    }

    pub fn open(db_path: &Path) -> EngineResult<Self> {
        let conn = crate::db::open_connection(db_path)
            .map_err(|e| EngineError::Store(format!("open {}: {e}", db_path.display())))?;
        Ok(Self::new(conn))
    }

    fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> EngineResult<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| EngineError::Store(format!("lock store mutex poisoned: {e}")))?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

fn live_value(conn: &Connection, key: &str, now: i64) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM kv_entries
         WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        params![key, now],
        |r| r.get(0),
    )
    .optional()
}

fn purge_expired(conn: &Connection, key: &str, now: i64) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM kv_entries WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
        params![key, now],
    )?;
    Ok(())
}

impl LockCounterStore for SqliteLockStore {
    fn try_acquire_lock_and_seed_counter(
        &self,
        lock_key: &str,
        counter_key: &str,
        ttl: Duration,
        count: i64,
    ) -> EngineResult<bool> {
        let expires_at = expiry_millis(ttl);
        self.with_tx(|tx| {
            let now = now_millis();
            if live_value(tx, lock_key, now)?.is_some() {
                return Ok(false);
            }
            purge_expired(tx, lock_key, now)?;
            tx.execute(
                "INSERT INTO kv_entries(key, value, expires_at) VALUES(?1, 'processing', ?2)",
                params![lock_key, expires_at],
            )?;
            tx.execute(
                "INSERT INTO kv_entries(key, value, expires_at) VALUES(?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value = excluded.value,
                   expires_at = excluded.expires_at",
                params![counter_key, count.to_string(), expires_at],
            )?;
            Ok(true)
        })
    }

    fn exists(&self, key: &str) -> EngineResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let guard = self
            .conn
            .lock()
            .map_err(|e| EngineError::Store(format!("lock store mutex poisoned: {e}")))?;
        Ok(live_value(&guard, key, now_millis())?)
    }

    fn decrement_and_get(&self, key: &str, by: i64) -> EngineResult<Option<i64>> {
        self.with_tx(|tx| {
            let now = now_millis();
            let Some(raw) = live_value(tx, key, now)? else {
                return Ok(None);
            };
            let next = raw.trim().parse::<i64>().unwrap_or(0) - by;
            tx.execute(
                "UPDATE kv_entries SET value = ?2 WHERE key = ?1",
                params![key, next.to_string()],
            )?;
            Ok(Some(next))
        })
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<()> {
        let expires_at = expiry_millis(ttl);
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO kv_entries(key, value, expires_at) VALUES(?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value = excluded.value,
                   expires_at = excluded.expires_at",
                params![key, value, expires_at],
            )?;
            Ok(())
        })
    }

    fn delete_keys(&self, keys: &[&str]) -> EngineResult<()> {
        self.with_tx(|tx| {
            for key in keys {
                tx.execute("DELETE FROM kv_entries WHERE key = ?1", [key])?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SqliteLockStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = crate::db::open_db(dir.path()).expect("open db");
        (dir, SqliteLockStore::new(conn))
    }

    #[test]
    fn second_acquire_fails_closed() {
        let (_dir, store) = store();
        let ttl = Duration::from_secs(60);
        assert!(store
            .try_acquire_lock_and_seed_counter("lock:a", "counter:a", ttl, 3)
            .expect("first"));
        assert!(!store
            .try_acquire_lock_and_seed_counter("lock:a", "counter:a", ttl, 9)
            .expect("second"));
        assert_eq!(store.get("counter:a").expect("get").as_deref(), Some("3"));
    }

    #[test]
    fn expired_lock_can_be_reacquired() {
        let (_dir, store) = store();
        assert!(store
            .try_acquire_lock_and_seed_counter("lock:b", "counter:b", Duration::from_millis(1), 2)
            .expect("first"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!store.exists("lock:b").expect("exists"));
        assert!(store
            .try_acquire_lock_and_seed_counter("lock:b", "counter:b", Duration::from_secs(60), 5)
            .expect("reacquire"));
        assert_eq!(store.get("counter:b").expect("get").as_deref(), Some("5"));
    }

    #[test]
    fn decrement_on_missing_key_is_noop() {
        let (_dir, store) = store();
        assert_eq!(store.decrement_and_get("counter:none", 1).expect("decr"), None);
        assert!(!store.exists("counter:none").expect("exists"));
    }

    #[test]
    fn decrement_counts_down_then_delete() {
        let (_dir, store) = store();
        let ttl = Duration::from_secs(60);
        store
            .try_acquire_lock_and_seed_counter("lock:c", "counter:c", ttl, 2)
            .expect("acquire");
        assert_eq!(store.decrement_and_get("counter:c", 1).expect("decr"), Some(1));
        assert_eq!(store.decrement_and_get("counter:c", 1).expect("decr"), Some(0));
        store
            .delete_keys(&["lock:c", "counter:c"])
            .expect("delete");
        assert!(!store.exists("lock:c").expect("exists"));
        assert_eq!(store.decrement_and_get("counter:c", 1).expect("decr"), None);
    }

    #[test]
    fn concurrent_decrements_do_not_lose_updates() {
        let dir = tempfile::tempdir().expect("tempdir");
        drop(crate::db::open_db(dir.path()).expect("open db"));
        let path = crate::db::db_path(dir.path());
        let seed = SqliteLockStore::open(&path).expect("store");
        seed.try_acquire_lock_and_seed_counter("lock:d", "counter:d", Duration::from_secs(60), 40)
            .expect("acquire");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                let store = SqliteLockStore::open(&path).expect("store");
                for _ in 0..10 {
                    store.decrement_and_get("counter:d", 1).expect("decr");
                }
            }));
        }
        for h in handles {
            h.join().expect("thread should not panic");
        }
        assert_eq!(seed.get("counter:d").expect("get").as_deref(), Some("0"));
    }
}
