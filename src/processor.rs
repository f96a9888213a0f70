//! User processor contract.
//!
//! A processor receives a `JobHandle` and returns a result value or a
//! `ProcessingError`. Any returned value - including `Value::Null` - is a
//! completion; only an `Err` drives the retry/backoff/fail path.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{ProcessingError, QueueError};
use crate::job::{Job, JobId};
use crate::store::JobStore;
use crate::time::now_ms;

/// Unit of work executed by a worker slot.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, job: JobHandle) -> Result<Value, ProcessingError>;
}

/// Adapter turning an async closure into a `Processor`.
///
/// ```ignore
/// let processor = ProcessorFn::new(|job: JobHandle| async move {
///     Ok(serde_json::json!({ "echo": *job.payload() }))
/// });
/// ```
pub struct ProcessorFn<F> {
    f: F,
}

impl<F> ProcessorFn<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Processor for ProcessorFn<F>
where
    F: Fn(JobHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ProcessingError>> + Send + 'static,
{
    async fn process(&self, job: JobHandle) -> Result<Value, ProcessingError> {
        (self.f)(job).await
    }
}

/// The processor's view of its job.
///
/// Shares the worker's in-memory job state, so progress written here is
/// visible when the worker finalizes. Progress persistence goes through a
/// guarded store update rather than a full save, so it can never resurrect a
/// job another worker has since finalized.
#[derive(Clone)]
pub struct JobHandle {
    job: Arc<Mutex<Job>>,
    store: Arc<dyn JobStore>,
}

impl JobHandle {
    pub(crate) fn new(job: Arc<Mutex<Job>>, store: Arc<dyn JobStore>) -> Self {
        Self { job, store }
    }

    pub fn id(&self) -> JobId {
        self.job.lock().id
    }

    pub fn queue(&self) -> String {
        self.job.lock().queue.clone()
    }

    pub fn name(&self) -> String {
        self.job.lock().name.clone()
    }

    pub fn payload(&self) -> Arc<Value> {
        Arc::clone(&self.job.lock().payload)
    }

    /// Which attempt this execution is (1-based).
    pub fn attempts_made(&self) -> u32 {
        self.job.lock().attempts_made
    }

    pub fn progress(&self) -> u8 {
        self.job.lock().progress
    }

    /// Record progress (0-100) in memory and persist it.
    pub async fn update_progress(&self, progress: u8) -> Result<(), QueueError> {
        let now = now_ms();
        let id = {
            let mut job = self.job.lock();
            job.update_progress(progress, now)?;
            job.id
        };
        self.store.update_progress(&id, progress, now).await?;
        Ok(())
    }
}
