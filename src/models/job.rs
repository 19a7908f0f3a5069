use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Lifecycle of a batch job.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs are never picked up again by the worker.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Outcome of a single image within a job.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ImageStatus {
    Pending,
    Processed,
    Failed,
}

/// A submitted batch of images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One image of a job, tied to the store it was captured at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobImage {
    pub id: Uuid,
    pub job_id: Uuid,
    pub store_id: String,
    pub image_url: String,
    pub status: ImageStatus,
    /// Derived from the image metadata; `None` until processed.
    pub perimeter: Option<i64>,
}

/// Image row to insert at submission time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJobImage {
    pub store_id: String,
    pub image_url: String,
}
