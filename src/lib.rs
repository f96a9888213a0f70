//! duraq - embedded persistent job queue and worker engine.
//!
//! Jobs are durably stored, claimed under a time-bounded lease by competing
//! workers, processed with bounded concurrency, retried with configurable
//! backoff on failure, and recovered by a stall sweep if a worker dies while
//! holding a lease.
//!
//! ## Module Organization
//!
//! - `retry.rs` - Retry policies and backoff delay computation
//! - `job.rs` - Job entity, state machine, lease transitions
//! - `store/` - Durable storage with an atomic claim primitive (SQLite, memory)
//! - `queue.rs` - Producer API: enqueue, query, cancel
//! - `worker/` - Polling slots, lock renewal, finalization, stall recovery
//! - `events.rs` - Fire-and-forget lifecycle event broadcast
//! - `processor.rs` - User processor contract and the handle it receives

pub mod error;
pub mod events;
pub mod job;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod time;
pub mod worker;

pub use error::{ProcessingError, QueueError};
pub use events::{EventBus, JobEvent};
pub use job::{Job, JobId, JobState};
pub use processor::{JobHandle, Processor, ProcessorFn};
pub use queue::{JobOptions, Queue};
pub use retry::{Backoff, RetryPolicy};
pub use store::{
    memory::MemoryStore,
    sqlite::{SqliteConfig, SqliteStore},
    JobStore, QueueCounts, StaleOutcome,
};
pub use worker::{Worker, WorkerOptions, WorkerState, WorkerStats};
