//! Lifecycle event broadcast.
//!
//! Workers publish events for external collaborators (logging, dashboards)
//! over a tokio broadcast channel. Publishing is fire-and-forget: a send with
//! no subscribers is not an error and never blocks the worker loop.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::job::JobId;

const DEFAULT_CAPACITY: usize = 256;

/// Job and worker lifecycle events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    JobActive {
        queue: String,
        job_id: JobId,
    },
    JobCompleted {
        queue: String,
        job_id: JobId,
        result: Value,
    },
    JobFailed {
        queue: String,
        job_id: JobId,
        error: String,
    },
    JobDelayed {
        queue: String,
        job_id: JobId,
        delay_until: u64,
    },
    JobRemoved {
        queue: String,
        job_id: JobId,
    },
    WorkerError {
        queue: String,
        worker_id: String,
        error: String,
    },
}

/// Clonable handle to the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all events published after this call. Slow subscribers
    /// miss events (broadcast lag) rather than backpressuring the workers.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; dropped silently when nobody is listening.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(JobEvent::JobActive {
            queue: "q".to_string(),
            job_id: JobId::new(),
        });
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let id = JobId::new();
        bus.publish(JobEvent::JobCompleted {
            queue: "q".to_string(),
            job_id: id,
            result: serde_json::json!(42),
        });
        match rx.recv().await.unwrap() {
            JobEvent::JobCompleted { job_id, result, .. } => {
                assert_eq!(job_id, id);
                assert_eq!(result, serde_json::json!(42));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
