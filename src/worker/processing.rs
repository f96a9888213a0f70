//! Processing of a claimed job: lock renewal while the processor runs, then a
//! lease-checked finalization that either completes, reschedules, or fails
//! the job.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::error::ProcessingError;
use crate::events::JobEvent;
use crate::job::Job;
use crate::processor::JobHandle;
use crate::time::now_ms;

use super::Worker;

impl Worker {
    /// Run the processor against a job this worker just claimed.
    ///
    /// The job is shared with the processor's `JobHandle` behind a mutex so
    /// progress updates and lock renewals see one coherent copy.
    pub(crate) async fn process_claimed(self: &Arc<Self>, job: Job) {
        let job_id = job.id;
        let shared = Arc::new(Mutex::new(job));

        self.events.publish(JobEvent::JobActive {
            queue: self.queue.clone(),
            job_id,
        });

        let renewal = self.spawn_lock_renewal(&shared);

        let handle = JobHandle::new(Arc::clone(&shared), Arc::clone(&self.store));
        let result = self.processor.process(handle).await;

        if let Some(task) = renewal {
            task.abort();
        }

        self.finalize(&shared, result).await;
    }

    /// Periodically extend the lease while the processor runs. Stops on its
    /// own if the lease is no longer ours or the renewal write fails; the
    /// finalization check then decides what happens to the result.
    fn spawn_lock_renewal(
        self: &Arc<Self>,
        shared: &Arc<Mutex<Job>>,
    ) -> Option<JoinHandle<()>> {
        if self.opts.lock_renew_ms == 0 {
            return None;
        }
        let worker = Arc::clone(self);
        let shared = Arc::clone(shared);
        let period = Duration::from_millis(worker.opts.lock_renew_ms);

        Some(tokio::spawn(async move {
            loop {
                sleep(period).await;
                let now = now_ms();
                let renewed = {
                    let mut job = shared.lock();
                    job.renew_lock(now + worker.opts.lock_duration_ms, &worker.id, now)
                        .then(|| job.clone())
                };
                let Some(snapshot) = renewed else {
                    warn!(
                        worker_id = %worker.id,
                        job_id = %shared.lock().id,
                        "Lease no longer held, stopping renewal"
                    );
                    break;
                };
                if let Err(e) = worker.store.save(&snapshot).await {
                    error!(
                        worker_id = %worker.id,
                        job_id = %snapshot.id,
                        error = %e,
                        "Lock renewal failed, stopping renewal"
                    );
                    break;
                }
                debug!(worker_id = %worker.id, job_id = %snapshot.id, "Lock renewed");
            }
        }))
    }

    /// Apply the processor's result. The lease is re-checked first: if it
    /// expired mid-flight the job may already belong to another worker (or to
    /// stall recovery), so the result is dropped and the job left untouched.
    async fn finalize(
        self: &Arc<Self>,
        shared: &Arc<Mutex<Job>>,
        result: Result<Value, ProcessingError>,
    ) {
        let now = now_ms();
        let job_id = shared.lock().id;

        if !shared.lock().holds_live_lease(&self.id, now) {
            warn!(
                worker_id = %self.id,
                job_id = %job_id,
                "Lease lost before finalization, dropping result"
            );
            return;
        }

        match result {
            Ok(value) => self.finalize_success(shared, value, now).await,
            Err(err) => self.finalize_failure(shared, err, now).await,
        }
    }

    async fn finalize_success(self: &Arc<Self>, shared: &Arc<Mutex<Job>>, value: Value, now: u64) {
        let snapshot = {
            let mut job = shared.lock();
            if let Err(e) = job.move_to_completed(value, now) {
                error!(job_id = %job.id, error = %e, "Cannot complete job");
                return;
            }
            job.clone()
        };

        if let Err(e) = self.store.save(&snapshot).await {
            self.report_save_error(&snapshot, &e);
            return;
        }

        info!(
            worker_id = %self.id,
            job_id = %snapshot.id,
            attempts = snapshot.attempts_made,
            "Job completed"
        );
        self.events.publish(JobEvent::JobCompleted {
            queue: self.queue.clone(),
            job_id: snapshot.id,
            result: snapshot.return_value.clone().unwrap_or(Value::Null),
        });

        if snapshot.remove_on_complete {
            self.remove_finished(&snapshot).await;
        }
    }

    async fn finalize_failure(
        self: &Arc<Self>,
        shared: &Arc<Mutex<Job>>,
        err: ProcessingError,
        now: u64,
    ) {
        let (snapshot, retrying) = {
            let mut job = shared.lock();
            let attempts = job.attempts_made;
            if job.retry.should_retry(attempts) {
                let delay = job.retry.calculate_delay(attempts);
                job.failed_reason = Some(err.message.clone());
                job.stacktrace = err.stacktrace.clone();
                if let Err(e) = job.move_to_delayed(now.saturating_add(delay), now) {
                    error!(job_id = %job.id, error = %e, "Cannot reschedule job");
                    return;
                }
                (job.clone(), true)
            } else {
                if let Err(e) =
                    job.move_to_failed(err.message.clone(), err.stacktrace.clone(), now)
                {
                    error!(job_id = %job.id, error = %e, "Cannot fail job");
                    return;
                }
                (job.clone(), false)
            }
        };

        if let Err(e) = self.store.save(&snapshot).await {
            self.report_save_error(&snapshot, &e);
            return;
        }

        self.events.publish(JobEvent::JobFailed {
            queue: self.queue.clone(),
            job_id: snapshot.id,
            error: err.message.clone(),
        });

        if retrying {
            info!(
                worker_id = %self.id,
                job_id = %snapshot.id,
                attempts = snapshot.attempts_made,
                process_at = snapshot.process_at,
                error = %err.message,
                "Job failed, retry scheduled"
            );
            self.events.publish(JobEvent::JobDelayed {
                queue: self.queue.clone(),
                job_id: snapshot.id,
                delay_until: snapshot.process_at,
            });
        } else {
            warn!(
                worker_id = %self.id,
                job_id = %snapshot.id,
                attempts = snapshot.attempts_made,
                error = %err.message,
                "Job failed permanently"
            );
            if snapshot.remove_on_fail {
                self.remove_finished(&snapshot).await;
            }
        }
    }

    async fn remove_finished(self: &Arc<Self>, job: &Job) {
        match self.store.delete(&job.id).await {
            Ok(_) => {
                debug!(job_id = %job.id, "Finished job removed");
                self.events.publish(JobEvent::JobRemoved {
                    queue: self.queue.clone(),
                    job_id: job.id,
                });
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to remove finished job"),
        }
    }

    fn report_save_error(&self, job: &Job, e: &crate::error::QueueError) {
        error!(
            worker_id = %self.id,
            job_id = %job.id,
            error = %e,
            "Failed to persist job result"
        );
        self.events.publish(JobEvent::WorkerError {
            queue: self.queue.clone(),
            worker_id: self.id.clone(),
            error: e.to_string(),
        });
    }
}
