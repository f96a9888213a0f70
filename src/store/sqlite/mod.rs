//! SQLite-backed job store.
//!
//! Embedded persistence with WAL mode. The connection sits behind a mutex;
//! every operation is a single statement (or conditional update), so the
//! atomicity of `claim_next` holds across processes sharing the same file,
//! enforced by SQLite's own locking.

mod migration;
mod rows;

#[cfg(test)]
mod tests;

use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use super::{JobStore, QueueCounts, StaleOutcome};
use crate::error::QueueError;
use crate::job::{Job, JobId};

/// SQLite storage configuration.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file.
    pub path: PathBuf,
    /// Enable WAL mode (recommended).
    pub wal_mode: bool,
    /// Synchronous mode: 0=OFF, 1=NORMAL, 2=FULL.
    pub synchronous: i32,
    /// Cache size in pages (negative = KB).
    pub cache_size: i32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("duraq.db"),
            wal_mode: true,
            synchronous: 1,
            cache_size: -64000,
        }
    }
}

impl SqliteConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let path = std::env::var("DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("duraq.db"));

        let synchronous = std::env::var("SQLITE_SYNCHRONOUS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        let cache_size = std::env::var("SQLITE_CACHE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(-64000);

        Self {
            path,
            wal_mode: true,
            synchronous,
            cache_size,
        }
    }
}

/// SQLite job store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    pub path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) and migrate the database.
    pub fn open(config: SqliteConfig) -> Result<Self, QueueError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }

        let conn = Connection::open(&config.path)?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};
             PRAGMA synchronous = {};
             PRAGMA cache_size = {};
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = 5000;",
            if config.wal_mode { "WAL" } else { "DELETE" },
            config.synchronous,
            config.cache_size,
        ))?;

        migration::migrate(&conn)?;

        info!(path = %config.path.display(), "SQLite job store initialized");

        Ok(Self {
            conn: Mutex::new(conn),
            path: config.path,
        })
    }

    /// Open with configuration taken from the environment.
    pub fn open_from_env() -> Result<Self, QueueError> {
        Self::open(SqliteConfig::from_env())
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn save(&self, job: &Job) -> Result<(), QueueError> {
        let conn = self.conn.lock();
        rows::save(&conn, job)?;
        Ok(())
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        let conn = self.conn.lock();
        Ok(rows::find_by_id(&conn, id)?)
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease_ms: u64,
        now: u64,
    ) -> Result<Option<Job>, QueueError> {
        let conn = self.conn.lock();
        Ok(rows::claim_next(&conn, queue, worker_id, lease_ms, now)?)
    }

    async fn delete(&self, id: &JobId) -> Result<bool, QueueError> {
        let conn = self.conn.lock();
        Ok(rows::delete(&conn, id)?)
    }

    async fn cancel(&self, id: &JobId) -> Result<bool, QueueError> {
        let conn = self.conn.lock();
        Ok(rows::cancel(&conn, id)?)
    }

    async fn find_stale(&self, queue: &str, now: u64) -> Result<Vec<Job>, QueueError> {
        let conn = self.conn.lock();
        Ok(rows::find_stale(&conn, queue, now)?)
    }

    async fn recover_stale(
        &self,
        id: &JobId,
        outcome: &StaleOutcome,
        now: u64,
    ) -> Result<bool, QueueError> {
        let conn = self.conn.lock();
        Ok(rows::recover_stale(&conn, id, outcome, now)?)
    }

    async fn update_progress(
        &self,
        id: &JobId,
        progress: u8,
        now: u64,
    ) -> Result<bool, QueueError> {
        let conn = self.conn.lock();
        Ok(rows::update_progress(&conn, id, progress, now)?)
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError> {
        let conn = self.conn.lock();
        Ok(rows::counts(&conn, queue)?)
    }
}
