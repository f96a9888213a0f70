//! Worker: drives N concurrent processing slots against one queue.
//!
//! Module organization:
//! - `mod.rs` - Worker struct, options, state machine, run/close
//! - `processing.rs` - claimed-job processing, lock renewal, finalization
//! - `stall.rs` - stall-recovery sweep for leases whose owner died
//!
//! Workers never coordinate with each other; the store's atomic claim is the
//! sole arbiter of job ownership, so any number of workers (in any number of
//! processes) can drain the same queue.

mod processing;
mod stall;


use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{EventBus, JobEvent};
use crate::processor::Processor;
use crate::store::JobStore;
use crate::time::now_ms;

/// Per-slot jitter added to the poll interval so slots do not thunder-herd
/// the store.
const SLOT_POLL_JITTER_MS: u64 = 50;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Number of independent processing slots.
    pub concurrency: usize,
    /// How long a claim's lease lasts without renewal.
    pub lock_duration_ms: u64,
    /// Renewal period; must be strictly less than `lock_duration_ms` to leave
    /// margin for renewal latency. 0 disables renewal.
    pub lock_renew_ms: u64,
    /// Sleep between empty polls.
    pub poll_interval_ms: u64,
    /// Period of the stall-recovery sweep.
    pub stall_interval_ms: u64,
    /// How long `close(false)` waits for active jobs to drain.
    pub close_grace_ms: u64,
    /// Start the slots from the constructor.
    pub autorun: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lock_duration_ms: 30_000,
            lock_renew_ms: 15_000,
            poll_interval_ms: 500,
            stall_interval_ms: 5_000,
            close_grace_ms: 30_000,
            autorun: true,
        }
    }
}

impl WorkerOptions {
    /// Clamp inconsistent settings instead of failing construction.
    fn normalized(mut self, worker_id: &str) -> Self {
        self.concurrency = self.concurrency.max(1);
        if self.lock_renew_ms > 0 && self.lock_renew_ms >= self.lock_duration_ms {
            let adjusted = (self.lock_duration_ms / 2).max(1);
            warn!(
                worker_id,
                lock_renew_ms = self.lock_renew_ms,
                lock_duration_ms = self.lock_duration_ms,
                adjusted,
                "lock_renew_ms must be less than lock_duration_ms; adjusting"
            );
            self.lock_renew_ms = adjusted;
        }
        self.poll_interval_ms = self.poll_interval_ms.max(1);
        self.stall_interval_ms = self.stall_interval_ms.max(1);
        self
    }
}

/// Worker lifecycle: Stopped -> Running -> Closing -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Stopped,
    Running,
    Closing,
}

const STATE_STOPPED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_CLOSING: u8 = 2;

/// Point-in-time worker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub queue: String,
    pub state: WorkerState,
    pub active_jobs: usize,
    pub concurrency: usize,
}

pub struct Worker {
    pub(crate) id: String,
    pub(crate) queue: String,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) processor: Arc<dyn Processor>,
    pub(crate) opts: WorkerOptions,
    pub(crate) events: EventBus,
    state: AtomicU8,
    pub(crate) active: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Create a worker with its own event bus.
    pub fn new(
        queue: impl Into<String>,
        store: Arc<dyn JobStore>,
        processor: Arc<dyn Processor>,
        opts: WorkerOptions,
    ) -> Arc<Self> {
        Self::with_bus(queue, store, processor, opts, EventBus::default())
    }

    /// Create a worker publishing onto a shared event bus.
    pub fn with_bus(
        queue: impl Into<String>,
        store: Arc<dyn JobStore>,
        processor: Arc<dyn Processor>,
        opts: WorkerOptions,
        events: EventBus,
    ) -> Arc<Self> {
        let id = format!("worker-{}", Uuid::new_v4());
        let opts = opts.normalized(&id);
        let queue = queue.into();

        info!(
            worker_id = %id,
            queue = %queue,
            concurrency = opts.concurrency,
            backend = store.name(),
            "Worker created"
        );

        let worker = Arc::new(Self {
            id,
            queue,
            store,
            processor,
            opts,
            events,
            state: AtomicU8::new(STATE_STOPPED),
            active: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
        });

        if worker.opts.autorun {
            worker.run();
        }
        worker
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> WorkerState {
        match self.state.load(Ordering::Acquire) {
            STATE_RUNNING => WorkerState::Running,
            STATE_CLOSING => WorkerState::Closing,
            _ => WorkerState::Stopped,
        }
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            worker_id: self.id.clone(),
            queue: self.queue.clone(),
            state: self.state(),
            active_jobs: self.active.load(Ordering::Relaxed),
            concurrency: self.opts.concurrency,
        }
    }

    #[inline]
    pub(crate) fn is_closing(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_RUNNING
    }

    /// Start the processing slots and the stall sweep. Idempotent while
    /// running; rejected while closing.
    pub fn run(self: &Arc<Self>) {
        match self.state.compare_exchange(
            STATE_STOPPED,
            STATE_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_RUNNING) => {
                debug!(worker_id = %self.id, "Worker already running");
                return;
            }
            Err(_) => {
                warn!(worker_id = %self.id, "Worker is closing, cannot start");
                return;
            }
        }

        info!(worker_id = %self.id, queue = %self.queue, "Worker started");

        let mut tasks = self.tasks.lock();
        for slot in 0..self.opts.concurrency {
            let worker = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                worker.run_slot(slot).await;
            }));
        }
        let worker = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            worker.run_stall_sweep().await;
        }));
    }

    /// One claim-process loop. Claim errors are logged, surfaced as
    /// `WorkerError` and retried after a cooldown; they never escape the loop.
    async fn run_slot(self: Arc<Self>, slot: usize) {
        let poll = Duration::from_millis(
            self.opts.poll_interval_ms + slot as u64 * SLOT_POLL_JITTER_MS,
        );
        let cooldown = Duration::from_millis(
            (self.opts.poll_interval_ms * 5).clamp(self.opts.poll_interval_ms, 5_000),
        );

        loop {
            if self.is_closing() {
                break;
            }

            match self
                .store
                .claim_next(&self.queue, &self.id, self.opts.lock_duration_ms, now_ms())
                .await
            {
                Ok(Some(job)) => {
                    debug!(worker_id = %self.id, job_id = %job.id, slot, "Claimed job");
                    self.active.fetch_add(1, Ordering::AcqRel);
                    self.process_claimed(job).await;
                    self.active.fetch_sub(1, Ordering::AcqRel);
                }
                Ok(None) => sleep(poll).await,
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, slot, "Claim failed, backing off");
                    self.events.publish(JobEvent::WorkerError {
                        queue: self.queue.clone(),
                        worker_id: self.id.clone(),
                        error: e.to_string(),
                    });
                    sleep(cooldown).await;
                }
            }
        }
        debug!(worker_id = %self.id, slot, "Slot stopped");
    }

    /// Stop claiming immediately. Unless `force`, wait (bounded by
    /// `close_grace_ms`) for active jobs to finish; a forced close leaves
    /// in-flight jobs to stall recovery.
    pub async fn close(&self, force: bool) {
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        info!(worker_id = %self.id, force, "Worker closing");

        if !force {
            let deadline = Instant::now() + Duration::from_millis(self.opts.close_grace_ms);
            while self.active.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
                sleep(Duration::from_millis(25)).await;
            }
            let remaining = self.active.load(Ordering::Acquire);
            if remaining > 0 {
                warn!(
                    worker_id = %self.id,
                    remaining,
                    "Close grace elapsed with jobs still active; leaving them to stall recovery"
                );
            }
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.state.store(STATE_STOPPED, Ordering::Release);
        info!(worker_id = %self.id, "Worker stopped");
    }
}
