//! Advisory job lifecycle events. Nothing in the worker reads these back to
//! make decisions; a lagging or absent subscriber loses events silently.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// Job is waiting in the queue (initially or for a retry).
    Queued {
        job_id: Uuid,
        attempt: u32,
        delay_ms: u64,
    },
    Started {
        job_id: Uuid,
        attempt: u32,
    },
    Completed {
        job_id: Uuid,
        processed: usize,
    },
    /// The job ended without completing; `retrying` tells whether the
    /// broker will deliver it again.
    Failed {
        job_id: Uuid,
        error: String,
        retrying: bool,
    },
    /// Another worker holds the job; this delivery did nothing.
    Skipped {
        job_id: Uuid,
    },
    /// The broker found the job's lease lapsed and re-queued it.
    Stalled {
        job_id: Uuid,
    },
}

/// Broadcast channel for [`JobEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn queued(&self, job_id: Uuid, attempt: u32, delay: Duration) {
        self.emit(JobEvent::Queued {
            job_id,
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
    }
}

/// Log every event until the bus is dropped.
pub async fn log_events(mut events: broadcast::Receiver<JobEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match &event {
                JobEvent::Queued { job_id, attempt, delay_ms } => {
                    tracing::info!(%job_id, attempt, delay_ms, "Job is in queue, awaiting execution")
                }
                JobEvent::Started { job_id, attempt } => {
                    tracing::info!(%job_id, attempt, "Job started")
                }
                JobEvent::Completed { job_id, processed } => {
                    tracing::info!(%job_id, processed, "Job completed")
                }
                JobEvent::Failed { job_id, error, retrying } => {
                    tracing::error!(%job_id, error = %error, retrying, "Job failed")
                }
                JobEvent::Skipped { job_id } => {
                    tracing::info!(%job_id, "Job skipped, already in progress elsewhere")
                }
                JobEvent::Stalled { job_id } => {
                    tracing::warn!(%job_id, "Job has stalled and will be retried")
                }
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Event logger lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
