use async_trait::async_trait;
use reqwest::header::CONTENT_LENGTH;
use std::time::Duration;

/// Metadata of a remote image, as reported by its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageMetadata {
    pub content_length: u64,
}

/// Fetches image metadata without downloading the body.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    async fn head(&self, url: &str) -> Result<ImageMetadata, FetchError>;
}

/// [`MetadataFetcher`] issuing HTTP `HEAD` requests.
pub struct HttpMetadataFetcher {
    client: reqwest::Client,
}

impl HttpMetadataFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("image-batch-processor/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MetadataFetcher for HttpMetadataFetcher {
    async fn head(&self, url: &str) -> Result<ImageMetadata, FetchError> {
        let response = self.client.head(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let header = response
            .headers()
            .get(CONTENT_LENGTH)
            .ok_or(FetchError::MissingContentLength)?;
        let content_length = header
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| FetchError::InvalidContentLength(format!("{header:?}")))?;

        Ok(ImageMetadata { content_length })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Response has no Content-Length header")]
    MissingContentLength,

    #[error("Invalid Content-Length header: {0}")]
    InvalidContentLength(String),
}
