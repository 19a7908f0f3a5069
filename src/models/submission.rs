use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{JobStatus, NewJobImage};

/// Request body of `POST /api/submit`.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitRequest {
    /// Declared number of visits; must equal `visits.len()`.
    #[garde(skip)]
    #[serde(alias = "counts")]
    pub count: usize,

    #[garde(length(min = 1), dive)]
    pub visits: Vec<Visit>,
}

/// Images captured during one store visit.
#[derive(Debug, Deserialize, Validate)]
pub struct Visit {
    #[garde(length(min = 1, max = 64))]
    pub store_id: String,

    #[garde(length(min = 1), inner(length(min = 1, max = 2048)))]
    pub image_url: Vec<String>,

    #[garde(skip)]
    #[serde(default)]
    pub visit_time: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("Invalid submission: {0}")]
    Invalid(#[from] garde::Report),

    #[error("Declared count {declared} does not match {actual} visits")]
    CountMismatch { declared: usize, actual: usize },
}

impl SubmitRequest {
    /// Validate field constraints and the declared visit count.
    pub fn check(&self) -> Result<(), SubmissionError> {
        if self.count != self.visits.len() {
            return Err(SubmissionError::CountMismatch {
                declared: self.count,
                actual: self.visits.len(),
            });
        }
        self.validate()?;
        Ok(())
    }

    /// Flatten visits into one image row per URL.
    pub fn images(&self) -> Vec<NewJobImage> {
        self.visits
            .iter()
            .flat_map(|visit| {
                visit.image_url.iter().map(|url| NewJobImage {
                    store_id: visit.store_id.clone(),
                    image_url: url.clone(),
                })
            })
            .collect()
    }
}

/// Response after a job has been accepted.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

/// Query string of `GET /api/status`.
#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub jobid: Option<String>,
}

/// Response for querying job status.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailedStores>,
}

/// Stores whose images failed, reported alongside a `failed` status.
#[derive(Debug, Serialize, Deserialize)]
pub struct FailedStores {
    pub store_ids: Vec<String>,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
