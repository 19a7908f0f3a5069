use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::JobStatus;
use crate::models::submission::{
    ErrorResponse, FailedStores, JobStatusResponse, StatusQuery, SubmitRequest, SubmitResponse,
};

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// POST /api/submit: Persist a batch of store-visit images and queue it.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    request
        .check()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    let images = request.images();
    let job_id = state.store.insert_job(&images).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to create job");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    })?;

    state.status.cache_status(job_id, JobStatus::Pending).await;

    state.queue.enqueue(job_id).await.map_err(|e| {
        tracing::error!(%job_id, error = %e, "Failed to enqueue job");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    })?;

    metrics::counter!("image_jobs_submitted_total").increment(1);
    tracing::info!(%job_id, images = images.len(), "Job submitted");

    Ok((StatusCode::CREATED, Json(SubmitResponse { job_id })))
}

/// GET /api/status?jobid=<id>: Current job status, with failing stores.
pub async fn get_job_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job_id = query
        .jobid
        .as_deref()
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "Missing jobid"))?;
    let job_id = Uuid::parse_str(job_id)
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "Invalid jobid"))?;

    let status = state
        .status
        .get_status(job_id)
        .await
        .map_err(|e| {
            tracing::error!(%job_id, error = %e, "Failed to fetch job status");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        })?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Job not found"))?;

    let error = match status {
        JobStatus::Failed => {
            let store_ids = state.store.failed_store_ids(job_id).await.map_err(|e| {
                tracing::error!(%job_id, error = %e, "Failed to fetch failed stores");
                api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            })?;
            Some(FailedStores {
                store_ids,
                error: "Store not found".to_string(),
            })
        }
        _ => None,
    };

    Ok(Json(JobStatusResponse {
        job_id,
        status,
        error,
    }))
}
