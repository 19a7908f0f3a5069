//! Job status lifecycle: `pending → in_progress → completed | failed`.
//!
//! A job found `in_progress` is only taken over when its last update is older
//! than the stall threshold; otherwise the delivery is skipped without any
//! write and must be checked again once the threshold could have passed. Every image is attempted once per pass and the terminal status is
//! decided afterwards.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::job::JobStatus;
use crate::services::job_store::{JobStore, StoreError};
use crate::services::lease::LeaseHandle;
use crate::services::processor::ItemProcessor;
use crate::services::status_cache::StatusWriter;

/// Added to the remaining stall window before a skipped job is looked at again.
const RECHECK_MARGIN: Duration = Duration::from_secs(1);

/// How a delivery of a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Another worker is actively processing the job; nothing was written.
    /// The job counts as stalled if it is still untouched after `recheck_after`.
    Skipped { recheck_after: Duration },
    /// The job had already finished; nothing was written.
    AlreadyTerminal(JobStatus),
    Completed { processed: usize },
    Failed { processed: usize, failed: usize },
    /// Shutdown was requested between images; the job stays `in_progress`.
    Interrupted { attempted: usize },
}

/// Unrecoverable failure of a pass, left to the broker's retry policy.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {0} does not exist")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct JobRunner {
    store: Arc<dyn JobStore>,
    status: Arc<StatusWriter>,
    processor: Arc<ItemProcessor>,
    stall_threshold: Duration,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        status: Arc<StatusWriter>,
        processor: Arc<ItemProcessor>,
        stall_threshold: Duration,
    ) -> Self {
        Self {
            store,
            status,
            processor,
            stall_threshold,
        }
    }

    /// Claim the job and run one processing pass over all of its images.
    ///
    /// If the pass fails after the claim, the job is put back to `pending`
    /// so that the broker's re-delivery is not mistaken for a live worker.
    pub async fn run(
        &self,
        job_id: Uuid,
        lease: &LeaseHandle,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        if let Some(outcome) = self.claim(job_id).await? {
            return Ok(outcome);
        }

        let result = self.process_pass(job_id, lease, cancel).await;
        if let Err(e) = &result {
            tracing::error!(%job_id, error = %e, "Job pass aborted, releasing claim");
            if let Err(e) = self.status.set_status(job_id, JobStatus::Pending).await {
                tracing::error!(%job_id, error = %e, "Failed to release job claim");
            }
        }
        result
    }

    /// Move the job to `in_progress`, or return the outcome that ends this
    /// delivery without processing.
    async fn claim(&self, job_id: Uuid) -> Result<Option<JobOutcome>, JobError> {
        let current = self
            .store
            .get_job_status(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;

        match current {
            status @ (JobStatus::Completed | JobStatus::Failed) => {
                tracing::info!(%job_id, %status, "Job already finished, ignoring delivery");
                return Ok(Some(JobOutcome::AlreadyTerminal(status)));
            }
            JobStatus::InProgress => {
                let elapsed = self
                    .store
                    .elapsed_since_update(job_id)
                    .await?
                    .ok_or(JobError::NotFound(job_id))?;

                if elapsed <= self.stall_threshold {
                    tracing::info!(
                        %job_id,
                        seconds_since_update = elapsed.as_secs(),
                        "Job is being processed elsewhere, skipping"
                    );
                    metrics::counter!("image_jobs_skipped_total").increment(1);
                    return Ok(Some(JobOutcome::Skipped {
                        recheck_after: self.stall_threshold - elapsed + RECHECK_MARGIN,
                    }));
                }
                tracing::warn!(
                    %job_id,
                    seconds_since_update = elapsed.as_secs(),
                    "Job appears stalled, resuming processing"
                );
            }
            JobStatus::Pending => {}
        }

        self.status.set_status(job_id, JobStatus::InProgress).await?;
        Ok(None)
    }

    async fn process_pass(
        &self,
        job_id: Uuid,
        lease: &LeaseHandle,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let started = Instant::now();
        let images = self.store.list_images(job_id).await?;
        tracing::info!(%job_id, images = images.len(), "Processing job");

        let mut processed = 0;
        let mut failed = 0;
        for image in &images {
            if cancel.is_cancelled() {
                let attempted = processed + failed;
                tracing::warn!(
                    %job_id,
                    attempted,
                    remaining = images.len() - attempted,
                    "Shutdown requested, leaving job for re-delivery"
                );
                return Ok(JobOutcome::Interrupted { attempted });
            }

            if self.processor.process(image, lease).await?.is_failed() {
                failed += 1;
            } else {
                processed += 1;
            }
            // Keeps the job from looking stalled while a long pass runs.
            self.store.touch_job(job_id).await?;
        }

        metrics::histogram!("image_job_processing_seconds").record(started.elapsed().as_secs_f64());

        if failed > 0 {
            self.status.set_status(job_id, JobStatus::Failed).await?;
            metrics::counter!("image_jobs_failed_total").increment(1);
            tracing::info!(%job_id, processed, failed, "Job failed");
            Ok(JobOutcome::Failed { processed, failed })
        } else {
            self.status.set_status(job_id, JobStatus::Completed).await?;
            metrics::counter!("image_jobs_completed_total").increment(1);
            tracing::info!(%job_id, processed, "Job successfully completed");
            Ok(JobOutcome::Completed { processed })
        }
    }

    /// Mark a job failed after the broker gave up on it.
    pub async fn fail(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.status.set_status(job_id, JobStatus::Failed).await?;
        metrics::counter!("image_jobs_failed_total").increment(1);
        Ok(())
    }
}
