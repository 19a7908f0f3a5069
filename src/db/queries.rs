use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::{ImageStatus, Job, JobImage, JobStatus, NewJobImage};

/// Insert a job and all of its images in one transaction.
pub async fn create_job(pool: &PgPool, images: &[NewJobImage]) -> Result<Uuid, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        INSERT INTO jobs (status)
        VALUES ('pending')
        RETURNING id
        "#,
    )
    .fetch_one(&mut *tx)
    .await?;
    let job_id: Uuid = row.try_get("id")?;

    for image in images {
        sqlx::query(
            r#"
            INSERT INTO job_images (job_id, store_id, image_url, status)
            VALUES ($1, $2, $3, 'pending')
            "#,
        )
        .bind(job_id)
        .bind(&image.store_id)
        .bind(&image.image_url)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(job_id)
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, status, created_at, updated_at
        FROM jobs
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        Ok(Job {
            id: r.try_get("id")?,
            status: parse_job_status(&r)?,
            created_at: r.try_get("created_at")?,
            updated_at: r.try_get("updated_at")?,
        })
    })
    .transpose()
}

/// Get just the status of a job
pub async fn get_job_status(pool: &PgPool, job_id: Uuid) -> Result<Option<JobStatus>, sqlx::Error> {
    let row = sqlx::query("SELECT status FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.map(|r| parse_job_status(&r)).transpose()
}

/// Update job status, refreshing `updated_at`
pub async fn update_job_status(
    pool: &PgPool,
    job_id: Uuid,
    status: JobStatus,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = $1,
            updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(status.as_ref())
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Refresh `updated_at` without changing the status
pub async fn touch_job(pool: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE jobs SET updated_at = NOW() WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Time since the job row was last updated, measured by the database clock
pub async fn elapsed_since_update(
    pool: &PgPool,
    job_id: Uuid,
) -> Result<Option<Duration>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT EXTRACT(EPOCH FROM (NOW() - updated_at))::DOUBLE PRECISION AS seconds
        FROM jobs
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        let seconds: f64 = r.try_get("seconds")?;
        Ok(Duration::from_secs_f64(seconds.max(0.0)))
    })
    .transpose()
}

/// List all images of a job in insertion order
pub async fn list_images(pool: &PgPool, job_id: Uuid) -> Result<Vec<JobImage>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, job_id, store_id, image_url, status, perimeter
        FROM job_images
        WHERE job_id = $1
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| {
            let status_str: String = r.try_get("status")?;
            let status = ImageStatus::from_str(&status_str)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

            Ok(JobImage {
                id: r.try_get("id")?,
                job_id: r.try_get("job_id")?,
                store_id: r.try_get("store_id")?,
                image_url: r.try_get("image_url")?,
                status,
                perimeter: r.try_get("perimeter")?,
            })
        })
        .collect()
}

/// Record an image outcome. The perimeter is overwritten, so a failed
/// image never keeps a value from an earlier pass.
pub async fn update_image_status(
    pool: &PgPool,
    image_id: Uuid,
    status: ImageStatus,
    perimeter: Option<i64>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE job_images
        SET status = $1,
            perimeter = $2,
            updated_at = NOW()
        WHERE id = $3
        "#,
    )
    .bind(status.as_ref())
    .bind(perimeter)
    .bind(image_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Distinct store ids whose images failed
pub async fn failed_store_ids(pool: &PgPool, job_id: Uuid) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT store_id
        FROM job_images
        WHERE job_id = $1 AND status = 'failed'
        ORDER BY store_id
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(|r| r.try_get("store_id")).collect()
}

fn parse_job_status(row: &PgRow) -> Result<JobStatus, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    JobStatus::from_str(&status_str).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}
