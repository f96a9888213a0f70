//! Job entity and lifecycle state machine.
//!
//! A job holds its own state and exposes intention-revealing transitions
//! instead of raw setters. Side effects stay in memory; persisting the result
//! of a transition is the caller's responsibility, which keeps the entity
//! persistence-ignorant.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::QueueError;
use crate::retry::RetryPolicy;

/// Opaque unique job identifier, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, QueueError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| QueueError::Validation(format!("invalid job id {s:?}: {e}")))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Eligible for claiming now.
    Waiting,
    /// Eligible once `process_at` has passed (initial delay or retry backoff).
    Delayed,
    /// Leased by a worker and being processed.
    Active,
    /// Finished successfully (terminal).
    Completed,
    /// Exhausted its attempts (terminal).
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, QueueError> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(QueueError::Validation(format!(
                "unknown job state {other:?}"
            ))),
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    /// Job kind label, distinguishing job types within one queue.
    pub name: String,
    /// Payload wrapped in Arc for cheap cloning across worker slots.
    pub payload: Arc<Value>,
    pub state: JobState,
    /// Higher claims first among otherwise-eligible jobs.
    pub priority: i32,
    /// Incremented each time the job transitions into Active.
    pub attempts_made: u32,
    pub retry: RetryPolicy,
    pub created_at: u64,
    pub updated_at: u64,
    /// Earliest instant the job is eligible for claiming.
    pub process_at: u64,
    pub locked_by: Option<String>,
    /// Only meaningful while Active; after this instant the lease is stale.
    pub lock_expires_at: Option<u64>,
    /// 0-100, mutable by the processor while the job is not terminal.
    pub progress: u8,
    pub return_value: Option<Value>,
    pub failed_reason: Option<String>,
    pub stacktrace: Option<String>,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl Job {
    /// Create a Waiting job (or Delayed when `process_at > now`).
    pub fn new(
        queue: impl Into<String>,
        name: impl Into<String>,
        payload: Value,
        priority: i32,
        retry: RetryPolicy,
        process_at: u64,
        now: u64,
    ) -> Self {
        let process_at = process_at.max(now);
        Self {
            id: JobId::new(),
            queue: queue.into(),
            name: name.into(),
            payload: Arc::new(payload),
            state: if process_at > now {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            priority,
            attempts_made: 0,
            retry,
            created_at: now,
            updated_at: now,
            process_at,
            locked_by: None,
            lock_expires_at: None,
            progress: 0,
            return_value: None,
            failed_reason: None,
            stacktrace: None,
            remove_on_complete: false,
            remove_on_fail: false,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the job is claimable at `now`.
    #[inline]
    pub fn is_eligible(&self, now: u64) -> bool {
        match self.state {
            JobState::Waiting => self.attempts_made < self.retry.max_attempts,
            JobState::Delayed => {
                self.process_at <= now && self.attempts_made < self.retry.max_attempts
            }
            _ => false,
        }
    }

    /// Whether `worker_id` still holds a live lease on this job at `now`.
    #[inline]
    pub fn holds_live_lease(&self, worker_id: &str, now: u64) -> bool {
        self.state == JobState::Active
            && self.locked_by.as_deref() == Some(worker_id)
            && self.lock_expires_at.is_some_and(|at| at > now)
    }

    /// Whether the lease has expired without the owner finalizing the job.
    #[inline]
    pub fn is_stale(&self, now: u64) -> bool {
        self.state == JobState::Active && self.lock_expires_at.is_some_and(|at| at < now)
    }

    /// Waiting/Delayed -> Active. Increments `attempts_made` and sets the lease.
    pub fn move_to_active(
        &mut self,
        worker_id: &str,
        lock_expires_at: u64,
        now: u64,
    ) -> Result<(), QueueError> {
        if !matches!(self.state, JobState::Waiting | JobState::Delayed) {
            return Err(QueueError::InvalidTransition {
                from: self.state,
                to: JobState::Active,
            });
        }
        if self.attempts_made >= self.retry.max_attempts {
            return Err(QueueError::Validation(format!(
                "job {} has exhausted its {} attempts",
                self.id, self.retry.max_attempts
            )));
        }
        self.state = JobState::Active;
        self.attempts_made += 1;
        self.locked_by = Some(worker_id.to_string());
        self.lock_expires_at = Some(lock_expires_at);
        self.touch(now);
        Ok(())
    }

    /// Extend the lease. Refuses (returns false, no state change) when the
    /// caller no longer owns a live lock; this is how a worker detects it has
    /// lost ownership.
    pub fn renew_lock(&mut self, new_lock_expires_at: u64, worker_id: &str, now: u64) -> bool {
        if !self.holds_live_lease(worker_id, now) {
            return false;
        }
        self.lock_expires_at = Some(new_lock_expires_at);
        self.touch(now);
        true
    }

    /// Active -> Completed. Clears the lease.
    pub fn move_to_completed(&mut self, result: Value, now: u64) -> Result<(), QueueError> {
        if self.state != JobState::Active {
            return Err(QueueError::InvalidTransition {
                from: self.state,
                to: JobState::Completed,
            });
        }
        self.state = JobState::Completed;
        self.return_value = Some(result);
        self.clear_lock();
        self.touch(now);
        Ok(())
    }

    /// -> Failed (terminal). Clears the lease.
    pub fn move_to_failed(
        &mut self,
        reason: impl Into<String>,
        stacktrace: Option<String>,
        now: u64,
    ) -> Result<(), QueueError> {
        if self.is_terminal() {
            return Err(QueueError::InvalidTransition {
                from: self.state,
                to: JobState::Failed,
            });
        }
        self.state = JobState::Failed;
        self.failed_reason = Some(reason.into());
        self.stacktrace = stacktrace;
        self.clear_lock();
        self.touch(now);
        Ok(())
    }

    /// -> Delayed until `process_at`. Clears the lease. Used both for an
    /// initial delay and for backoff-driven retry.
    pub fn move_to_delayed(&mut self, process_at: u64, now: u64) -> Result<(), QueueError> {
        if self.is_terminal() {
            return Err(QueueError::InvalidTransition {
                from: self.state,
                to: JobState::Delayed,
            });
        }
        self.state = JobState::Delayed;
        self.process_at = process_at;
        self.clear_lock();
        self.touch(now);
        Ok(())
    }

    /// Record processor progress. Rejected once the job is terminal so that
    /// partial progress recorded before a failure is retained for diagnostics.
    pub fn update_progress(&mut self, progress: u8, now: u64) -> Result<(), QueueError> {
        if self.is_terminal() {
            return Err(QueueError::InvalidTransition {
                from: self.state,
                to: self.state,
            });
        }
        self.progress = progress.min(100);
        self.touch(now);
        Ok(())
    }

    #[inline]
    fn clear_lock(&mut self) {
        self.locked_by = None;
        self.lock_expires_at = None;
    }

    /// updated_at never moves backwards even if the caller's clock does.
    #[inline]
    fn touch(&mut self, now: u64) {
        self.updated_at = self.updated_at.max(now);
    }
}
