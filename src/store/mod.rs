//! Durable job storage.
//!
//! The store is the sole arbiter of job ownership: all mutation goes through
//! `save` and the atomic `claim_next`, never read-then-write without a guard.
//!
//! - `sqlite/` - embedded SQLite persistence (WAL mode)
//! - `memory.rs` - in-memory store for tests and DB-less embedding

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::QueueError;
use crate::job::{Job, JobId};

/// Decision applied to a stale job by the stall-recovery sweep.
#[derive(Debug, Clone)]
pub enum StaleOutcome {
    /// Another attempt is allowed; requeue as Delayed until `process_at`.
    Retry { process_at: u64, reason: String },
    /// Attempts exhausted; mark Failed.
    Fail { reason: String },
}

/// Per-state job tallies for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Storage port for jobs.
///
/// `claim_next` must be atomic: two concurrent callers must never claim the
/// same job, including callers in different processes sharing one store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store backend name for logging.
    fn name(&self) -> &'static str;

    /// Upsert the job's full state.
    async fn save(&self, job: &Job) -> Result<(), QueueError>;

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, QueueError>;

    /// Atomically select the highest-priority eligible job (Waiting, or
    /// Delayed with `process_at <= now`; ties broken by creation time) and
    /// mark it Active with a lease of `lease_ms` held by `worker_id`.
    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease_ms: u64,
        now: u64,
    ) -> Result<Option<Job>, QueueError>;

    /// Remove a job unconditionally (removeOnComplete / removeOnFail).
    /// Returns whether a row was removed.
    async fn delete(&self, id: &JobId) -> Result<bool, QueueError>;

    /// Remove a job only while it is not Active (cancellation before claim).
    async fn cancel(&self, id: &JobId) -> Result<bool, QueueError>;

    /// Active jobs in `queue` whose lease expired before `now`.
    async fn find_stale(&self, queue: &str, now: u64) -> Result<Vec<Job>, QueueError>;

    /// Apply a stall-recovery outcome, guarded so it only takes effect while
    /// the job is still Active with an expired lease. Returns whether this
    /// caller won the race.
    async fn recover_stale(
        &self,
        id: &JobId,
        outcome: &StaleOutcome,
        now: u64,
    ) -> Result<bool, QueueError>;

    /// Record processor progress; refused once the job is terminal.
    async fn update_progress(
        &self,
        id: &JobId,
        progress: u8,
        now: u64,
    ) -> Result<bool, QueueError>;

    /// Per-state tallies for `queue`.
    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError>;
}
