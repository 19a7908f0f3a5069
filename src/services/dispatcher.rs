//! Pulls jobs from the broker and runs them under a lease with bounded
//! concurrency.
//!
//! Polls the queue while permits are available, re-queues jobs whose lease
//! lapsed, and applies the retry policy to passes that fail with a
//! [`JobError`]. Shutdown stops consumption and waits for in-flight jobs,
//! which stop after their current image.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerSettings;
use crate::services::events::{EventBus, JobEvent};
use crate::services::job_store::StoreError;
use crate::services::lease::LeaseManager;
use crate::services::queue::{Delivery, JobBroker};
use crate::services::state_machine::{JobError, JobOutcome, JobRunner};

pub struct Dispatcher {
    broker: Arc<dyn JobBroker>,
    leases: LeaseManager,
    runner: Arc<JobRunner>,
    events: EventBus,
    settings: WorkerSettings,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn JobBroker>,
        leases: LeaseManager,
        runner: Arc<JobRunner>,
        events: EventBus,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            broker,
            leases,
            runner,
            events,
            settings,
        }
    }

    /// Run the dispatch loop until the cancellation token is triggered.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut tasks = JoinSet::new();
        let mut stall_check = tokio::time::interval(self.settings.stalled_check_interval);
        stall_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            concurrency = self.settings.concurrency,
            lease_secs = self.settings.lease_duration.as_secs(),
            heartbeat_ms = self.settings.heartbeat_interval.as_millis() as u64,
            "Job dispatcher started"
        );

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Job task panicked");
                }
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = stall_check.tick() => {
                    self.recover_stalled().await;
                    continue;
                }
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.broker.consume(self.settings.lease_duration).await {
                Ok(Some(delivery)) => {
                    let this = Arc::clone(&self);
                    let cancel = cancel.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        let _ = this.handle(delivery, &cancel).await;
                    });
                    continue;
                }
                Ok(None) => {
                    tracing::trace!("No jobs available, sleeping");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to consume from queue, will retry");
                }
            }

            drop(permit);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        tracing::info!(in_flight = tasks.len(), "Job dispatcher shutting down");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Job task panicked during shutdown");
            }
        }
        tracing::info!("Job dispatcher stopped");
    }

    /// Run one delivery to its end and settle it with the broker.
    pub async fn handle(
        &self,
        delivery: Delivery,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let job_id = delivery.job_id();
        self.events.emit(JobEvent::Started {
            job_id,
            attempt: delivery.attempt(),
        });

        let lease = self
            .leases
            .acquire(delivery.clone(), self.settings.lease_duration)
            .await;
        let result = self.runner.run(job_id, lease.handle(), cancel).await;
        lease.release().await;

        match &result {
            Ok(JobOutcome::Interrupted { .. }) => {
                // Left in the active list; stall recovery re-delivers it once
                // the lease runs out.
            }
            Ok(JobOutcome::Skipped { recheck_after }) => {
                // Never acknowledged: the holder may have died right after
                // its last update.
                self.events.emit(JobEvent::Skipped { job_id });
                match self.broker.defer(&delivery, *recheck_after).await {
                    Ok(()) => self.events.queued(job_id, delivery.attempt(), *recheck_after),
                    Err(e) => {
                        tracing::warn!(%job_id, error = %e, "Failed to defer skipped job");
                    }
                }
            }
            Ok(outcome) => {
                self.complete(&delivery).await;
                self.events.emit(match outcome {
                    JobOutcome::Completed { processed } => JobEvent::Completed {
                        job_id,
                        processed: *processed,
                    },
                    JobOutcome::Failed { failed, .. } => JobEvent::Failed {
                        job_id,
                        error: format!("{failed} image(s) failed"),
                        retrying: false,
                    },
                    _ => JobEvent::Skipped { job_id },
                });
            }
            Err(e) => self.retry_or_fail(&delivery, e).await,
        }

        result
    }

    async fn retry_or_fail(&self, delivery: &Delivery, error: &JobError) {
        let job_id = delivery.job_id();
        let attempt = delivery.attempt();

        if let Some(delay) = self.settings.retry.backoff(attempt) {
            self.events.emit(JobEvent::Failed {
                job_id,
                error: error.to_string(),
                retrying: true,
            });
            match self.broker.retry(delivery, delay).await {
                Ok(()) => self.events.queued(job_id, attempt + 1, delay),
                Err(e) => {
                    tracing::error!(%job_id, error = %e, "Failed to schedule retry");
                }
            }
            return;
        }

        tracing::warn!(%job_id, attempt, error = %error, "Job failed after max attempts");
        match self.runner.fail(job_id).await {
            Ok(()) | Err(StoreError::JobNotFound(_)) => self.complete(delivery).await,
            Err(e) => {
                // Stays active; stall recovery brings it back once the lease lapses.
                tracing::error!(%job_id, error = %e, "Failed to mark job failed");
            }
        }
        self.events.emit(JobEvent::Failed {
            job_id,
            error: error.to_string(),
            retrying: false,
        });
    }

    async fn complete(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.complete(delivery).await {
            tracing::error!(job_id = %delivery.job_id(), error = %e, "Failed to acknowledge job");
        }
    }

    async fn recover_stalled(&self) {
        match self.broker.recover_stalled().await {
            Ok(stalled) => {
                for job_id in stalled {
                    self.events.emit(JobEvent::Stalled { job_id });
                }
            }
            Err(e) => tracing::error!(error = %e, "Stalled job check failed"),
        }
    }
}
