//! Stall recovery: periodically find active jobs whose lease expired (their
//! worker crashed or lost its lock) and either reschedule them with their own
//! backoff or fail them if attempts are exhausted.
//!
//! Recovery goes through the store's guarded `recover_stale` update, so when
//! several workers sweep the same queue exactly one wins per job.

use std::sync::Arc;

use tokio::time::{sleep, Duration};
use tracing::{debug, error, warn};

use crate::events::JobEvent;
use crate::store::StaleOutcome;
use crate::time::now_ms;

use super::Worker;

const STALL_REASON: &str = "job stalled: lock expired";

impl Worker {
    pub(crate) async fn run_stall_sweep(self: Arc<Self>) {
        let period = Duration::from_millis(self.opts.stall_interval_ms);
        loop {
            sleep(period).await;
            if self.is_closing() {
                break;
            }
            self.sweep_stalled().await;
        }
        debug!(worker_id = %self.id, "Stall sweep stopped");
    }

    async fn sweep_stalled(self: &Arc<Self>) {
        let now = now_ms();
        let stale = match self.store.find_stale(&self.queue, now).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(worker_id = %self.id, error = %e, "Stall sweep query failed");
                self.events.publish(JobEvent::WorkerError {
                    queue: self.queue.clone(),
                    worker_id: self.id.clone(),
                    error: e.to_string(),
                });
                return;
            }
        };

        for job in stale {
            let outcome = if job.retry.should_retry(job.attempts_made) {
                let delay = job.retry.calculate_delay(job.attempts_made);
                StaleOutcome::Retry {
                    process_at: now.saturating_add(delay),
                    reason: STALL_REASON.to_string(),
                }
            } else {
                StaleOutcome::Fail {
                    reason: STALL_REASON.to_string(),
                }
            };

            match self.store.recover_stale(&job.id, &outcome, now).await {
                // Someone else recovered (or re-claimed) it first.
                Ok(false) => {}
                Ok(true) => {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        attempts = job.attempts_made,
                        locked_by = job.locked_by.as_deref().unwrap_or(""),
                        "Recovered stalled job"
                    );
                    self.events.publish(JobEvent::JobFailed {
                        queue: self.queue.clone(),
                        job_id: job.id,
                        error: STALL_REASON.to_string(),
                    });
                    match outcome {
                        StaleOutcome::Retry { process_at, .. } => {
                            self.events.publish(JobEvent::JobDelayed {
                                queue: self.queue.clone(),
                                job_id: job.id,
                                delay_until: process_at,
                            });
                        }
                        StaleOutcome::Fail { .. } if job.remove_on_fail => {
                            if let Err(e) = self.store.delete(&job.id).await {
                                error!(job_id = %job.id, error = %e, "Failed to remove stalled job");
                            } else {
                                self.events.publish(JobEvent::JobRemoved {
                                    queue: self.queue.clone(),
                                    job_id: job.id,
                                });
                            }
                        }
                        StaleOutcome::Fail { .. } => {}
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, job_id = %job.id, error = %e, "Stall recovery failed");
                }
            }
        }
    }
}
