use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::models::job::{ImageStatus, JobImage};
use crate::models::store::ReferenceDataSet;
use crate::services::job_store::{JobStore, StoreError};
use crate::services::lease::LeaseHandle;
use crate::services::metadata::{FetchError, MetadataFetcher};

/// Result of processing one image. Failures are data, not errors.
#[derive(Debug)]
pub enum ItemOutcome {
    Processed { perimeter: i64 },
    Failed(ItemFault),
}

impl ItemOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ItemOutcome::Failed(_))
    }
}

/// Why an image failed. Recorded on the image, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum ItemFault {
    #[error("Store {0} not found")]
    StoreNotFound(String),

    #[error("Metadata fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Content length {0} out of range")]
    OutOfRange(u64),
}

/// Performs the per-image unit of work.
pub struct ItemProcessor {
    store: Arc<dyn JobStore>,
    fetcher: Arc<dyn MetadataFetcher>,
    reference: Arc<ReferenceDataSet>,
    delay: (Duration, Duration),
}

impl ItemProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        fetcher: Arc<dyn MetadataFetcher>,
        reference: Arc<ReferenceDataSet>,
        delay: (Duration, Duration),
    ) -> Self {
        Self {
            store,
            fetcher,
            reference,
            delay,
        }
    }

    /// Process one image and persist its outcome.
    ///
    /// Only a failure to persist the outcome is returned as an error.
    pub async fn process(
        &self,
        image: &JobImage,
        lease: &LeaseHandle,
    ) -> Result<ItemOutcome, StoreError> {
        tracing::info!(job_id = %image.job_id, image_id = %image.id, url = %image.image_url, "Processing image");

        let outcome = match self.reference.get(&image.store_id) {
            None => ItemOutcome::Failed(ItemFault::StoreNotFound(image.store_id.clone())),
            Some(store) => {
                tracing::debug!(image_id = %image.id, store = %store.store_name, "Store resolved");
                match self.measure(image, lease).await {
                    Ok(perimeter) => ItemOutcome::Processed { perimeter },
                    Err(fault) => ItemOutcome::Failed(fault),
                }
            }
        };

        match &outcome {
            ItemOutcome::Processed { perimeter } => {
                self.store
                    .update_image_status(image.id, ImageStatus::Processed, Some(*perimeter))
                    .await?;
                metrics::counter!("image_items_processed_total").increment(1);
            }
            ItemOutcome::Failed(fault) => {
                tracing::warn!(image_id = %image.id, url = %image.image_url, error = %fault, "Image failed");
                self.store
                    .update_image_status(image.id, ImageStatus::Failed, None)
                    .await?;
                metrics::counter!("image_items_failed_total").increment(1);
            }
        }

        Ok(outcome)
    }

    /// Fetch metadata and derive the perimeter, renewing the lease around
    /// the external call.
    async fn measure(&self, image: &JobImage, lease: &LeaseHandle) -> Result<i64, ItemFault> {
        lease.renew().await;
        let metadata = self.fetcher.head(&image.image_url).await?;
        let perimeter = perimeter(metadata.content_length)?;

        tokio::time::sleep(self.work_delay()).await;
        lease.renew().await;

        Ok(perimeter)
    }

    fn work_delay(&self) -> Duration {
        let (min, max) = self.delay;
        if max <= min {
            return min;
        }
        let millis = rand::rng().random_range(min.as_millis() as u64..max.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

/// Numeric result derived from an image's size.
pub fn perimeter(content_length: u64) -> Result<i64, ItemFault> {
    content_length
        .checked_mul(2)
        .and_then(|p| i64::try_from(p).ok())
        .ok_or(ItemFault::OutOfRange(content_length))
}
