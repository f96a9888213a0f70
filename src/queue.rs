//! Producer-facing queue API.
//!
//! Enqueue jobs, query their state, cancel before claim. Validation happens
//! here, before anything touches the store.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::error::QueueError;
use crate::events::{EventBus, JobEvent};
use crate::job::{Job, JobId, JobState};
use crate::retry::RetryPolicy;
use crate::store::{JobStore, QueueCounts};
use crate::time::now_ms;

const MAX_QUEUE_NAME_LEN: usize = 128;
const MAX_JOB_NAME_LEN: usize = 128;

/// Per-job enqueue options.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Job kind label within the queue.
    pub name: String,
    /// Higher claims first among otherwise-eligible jobs.
    pub priority: i32,
    /// Initial delay before the job becomes eligible.
    pub delay_ms: u64,
    pub retry: RetryPolicy,
    /// Delete the row once the job completes.
    pub remove_on_complete: bool,
    /// Delete the row once the job terminally fails.
    pub remove_on_fail: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            priority: 0,
            delay_ms: 0,
            retry: RetryPolicy::default(),
            remove_on_complete: false,
            remove_on_fail: false,
        }
    }
}

/// Handle to one named queue on a store.
#[derive(Clone)]
pub struct Queue {
    name: String,
    store: Arc<dyn JobStore>,
    events: EventBus,
}

impl Queue {
    pub fn new(name: impl Into<String>, store: Arc<dyn JobStore>) -> Result<Self, QueueError> {
        Self::with_events(name, store, EventBus::default())
    }

    /// Share an event bus with the workers draining this queue so removals
    /// are observable alongside worker lifecycle events.
    pub fn with_events(
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        events: EventBus,
    ) -> Result<Self, QueueError> {
        let name = name.into();
        validate_queue_name(&name)?;
        Ok(Self {
            name,
            store,
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Enqueue a job with default options.
    pub async fn add<T: Serialize>(&self, payload: T) -> Result<Job, QueueError> {
        self.add_with_opts(payload, JobOptions::default()).await
    }

    /// Enqueue a job. Starts Waiting, or Delayed when `delay_ms > 0`.
    pub async fn add_with_opts<T: Serialize>(
        &self,
        payload: T,
        opts: JobOptions,
    ) -> Result<Job, QueueError> {
        if opts.name.is_empty() || opts.name.len() > MAX_JOB_NAME_LEN {
            return Err(QueueError::Validation(format!(
                "job name must be 1-{MAX_JOB_NAME_LEN} characters"
            )));
        }
        opts.retry.validate()?;

        let payload = serde_json::to_value(payload)
            .map_err(|e| QueueError::Validation(format!("payload is not serializable: {e}")))?;

        let now = now_ms();
        let mut job = Job::new(
            self.name.clone(),
            opts.name,
            payload,
            opts.priority,
            opts.retry,
            now + opts.delay_ms,
            now,
        );
        job.remove_on_complete = opts.remove_on_complete;
        job.remove_on_fail = opts.remove_on_fail;

        self.store.save(&job).await?;
        debug!(queue = %self.name, job_id = %job.id, state = job.state.as_str(), "Job enqueued");
        Ok(job)
    }

    pub async fn job(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        self.store.find_by_id(id).await
    }

    pub async fn state(&self, id: &JobId) -> Result<Option<JobState>, QueueError> {
        Ok(self.store.find_by_id(id).await?.map(|j| j.state))
    }

    /// Cancel a job that has not been claimed. An Active job belongs to its
    /// worker and cannot be cancelled here. Returns whether a job was removed.
    pub async fn cancel(&self, id: &JobId) -> Result<bool, QueueError> {
        let removed = self.store.cancel(id).await?;
        if removed {
            self.events.publish(JobEvent::JobRemoved {
                queue: self.name.clone(),
                job_id: *id,
            });
        }
        Ok(removed)
    }

    /// Per-state job tallies for this queue.
    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.store.counts(&self.name).await
    }
}

fn validate_queue_name(name: &str) -> Result<(), QueueError> {
    if name.is_empty() || name.len() > MAX_QUEUE_NAME_LEN {
        return Err(QueueError::Validation(format!(
            "queue name must be 1-{MAX_QUEUE_NAME_LEN} characters"
        )));
    }
    Ok(())
}
