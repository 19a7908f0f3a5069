use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::db::queries;
use crate::models::job::{ImageStatus, JobImage, JobStatus, NewJobImage};

/// Durable, authoritative storage of jobs and their images.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically insert a pending job with all of its images.
    async fn insert_job(&self, images: &[NewJobImage]) -> Result<Uuid, StoreError>;

    async fn get_job_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, StoreError>;

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError>;

    /// Refresh the job's last-updated instant without a status change.
    async fn touch_job(&self, job_id: Uuid) -> Result<(), StoreError>;

    async fn elapsed_since_update(&self, job_id: Uuid) -> Result<Option<Duration>, StoreError>;

    async fn list_images(&self, job_id: Uuid) -> Result<Vec<JobImage>, StoreError>;

    async fn update_image_status(
        &self,
        image_id: Uuid,
        status: ImageStatus,
        perimeter: Option<i64>,
    ) -> Result<(), StoreError>;

    async fn failed_store_ids(&self, job_id: Uuid) -> Result<Vec<String>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// PostgreSQL-backed [`JobStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_job(&self, images: &[NewJobImage]) -> Result<Uuid, StoreError> {
        Ok(queries::create_job(&self.pool, images).await?)
    }

    async fn get_job_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, StoreError> {
        Ok(queries::get_job_status(&self.pool, job_id).await?)
    }

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        match queries::update_job_status(&self.pool, job_id, status).await? {
            0 => Err(StoreError::JobNotFound(job_id)),
            _ => Ok(()),
        }
    }

    async fn touch_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        Ok(queries::touch_job(&self.pool, job_id).await?)
    }

    async fn elapsed_since_update(&self, job_id: Uuid) -> Result<Option<Duration>, StoreError> {
        Ok(queries::elapsed_since_update(&self.pool, job_id).await?)
    }

    async fn list_images(&self, job_id: Uuid) -> Result<Vec<JobImage>, StoreError> {
        Ok(queries::list_images(&self.pool, job_id).await?)
    }

    async fn update_image_status(
        &self,
        image_id: Uuid,
        status: ImageStatus,
        perimeter: Option<i64>,
    ) -> Result<(), StoreError> {
        Ok(queries::update_image_status(&self.pool, image_id, status, perimeter).await?)
    }

    async fn failed_store_ids(&self, job_id: Uuid) -> Result<Vec<String>, StoreError> {
        Ok(queries::failed_store_ids(&self.pool, job_id).await?)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job {0} not found")]
    JobNotFound(Uuid),
}
