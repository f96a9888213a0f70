//! In-memory job store.
//!
//! Backs worker tests and hosts that want the queue without a database file.
//! Every mutating operation holds the map lock for its whole read-decide-write,
//! which gives it the same claim atomicity as the SQLite store's conditional
//! updates (within one process).

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{JobStore, QueueCounts, StaleOutcome};
use crate::error::QueueError;
use crate::job::{Job, JobId, JobState};

#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn save(&self, job: &Job) -> Result<(), QueueError> {
        self.jobs.lock().insert(job.id, job.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.jobs.lock().get(id).cloned())
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease_ms: u64,
        now: u64,
    ) -> Result<Option<Job>, QueueError> {
        let mut jobs = self.jobs.lock();

        let best = jobs
            .values()
            .filter(|j| j.queue == queue && j.is_eligible(now))
            .map(|j| (j.id, j.priority, j.created_at))
            // priority desc, created_at asc
            .min_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)))
            .map(|(id, _, _)| id);

        let Some(id) = best else {
            return Ok(None);
        };
        let job = jobs.get_mut(&id).expect("selected id is present");
        job.move_to_active(worker_id, now + lease_ms, now)?;
        Ok(Some(job.clone()))
    }

    async fn delete(&self, id: &JobId) -> Result<bool, QueueError> {
        Ok(self.jobs.lock().remove(id).is_some())
    }

    async fn cancel(&self, id: &JobId) -> Result<bool, QueueError> {
        let mut jobs = self.jobs.lock();
        match jobs.get(id) {
            Some(job) if job.state != JobState::Active => {
                jobs.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_stale(&self, queue: &str, now: u64) -> Result<Vec<Job>, QueueError> {
        Ok(self
            .jobs
            .lock()
            .values()
            .filter(|j| j.queue == queue && j.is_stale(now))
            .cloned()
            .collect())
    }

    async fn recover_stale(
        &self,
        id: &JobId,
        outcome: &StaleOutcome,
        now: u64,
    ) -> Result<bool, QueueError> {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(id) else {
            return Ok(false);
        };
        if !job.is_stale(now) {
            return Ok(false);
        }
        match outcome {
            StaleOutcome::Retry { process_at, reason } => {
                job.failed_reason = Some(reason.clone());
                job.move_to_delayed(*process_at, now)?;
            }
            StaleOutcome::Fail { reason } => {
                job.move_to_failed(reason.clone(), None, now)?;
            }
        }
        Ok(true)
    }

    async fn update_progress(
        &self,
        id: &JobId,
        progress: u8,
        now: u64,
    ) -> Result<bool, QueueError> {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(id) {
            Some(job) if !job.is_terminal() => {
                job.update_progress(progress, now)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError> {
        let jobs = self.jobs.lock();
        let mut counts = QueueCounts::default();
        for job in jobs.values().filter(|j| j.queue == queue) {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
