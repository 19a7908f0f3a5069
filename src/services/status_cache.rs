//! Job status mirrored into Redis in front of the durable store.
//!
//! Writes go durable-first, then cache. Reads try the cache and fall back to
//! the store, repopulating the cache on a miss. A crash or cache failure
//! between the two writes may leave a missing or stale entry, never a wrong
//! durable value.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::JobStatus;
use crate::services::job_store::{JobStore, StoreError};

const STATUS_KEY_PREFIX: &str = "job_status:";

/// Fast key/value cache with per-key expiry.
#[async_trait]
pub trait StatusCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Reset the key's expiry; a zero TTL evicts the key immediately.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;
}

/// Redis-backed [`StatusCache`] sharing one multiplexed connection.
#[derive(Clone)]
pub struct RedisStatusCache {
    conn: ConnectionManager,
}

impl RedisStatusCache {
    pub async fn new(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl StatusCache for RedisStatusCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl.as_secs() as i64).await?;
        Ok(())
    }
}

/// Write-through status writer with read-through fallback.
pub struct StatusWriter {
    store: Arc<dyn JobStore>,
    cache: Arc<dyn StatusCache>,
    ttl: Duration,
}

impl StatusWriter {
    pub fn new(store: Arc<dyn JobStore>, cache: Arc<dyn StatusCache>, ttl: Duration) -> Self {
        Self { store, cache, ttl }
    }

    pub fn status_key(job_id: Uuid) -> String {
        format!("{STATUS_KEY_PREFIX}{job_id}")
    }

    /// Persist a status transition, then mirror it into the cache.
    pub async fn set_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        self.store.update_job_status(job_id, status).await?;
        self.cache_status(job_id, status).await;
        Ok(())
    }

    /// Mirror an already-persisted status into the cache (e.g. right after
    /// the submission transaction committed).
    pub async fn cache_status(&self, job_id: Uuid, status: JobStatus) {
        let key = Self::status_key(job_id);
        if let Err(e) = self.cache.set_with_ttl(&key, status.as_ref(), self.ttl).await {
            tracing::warn!(%job_id, %status, error = %e, "Status cache write failed, invalidating entry");
            // A leftover entry would still hold the previous status.
            if let Err(e) = self.cache.expire(&key, Duration::ZERO).await {
                tracing::error!(%job_id, error = %e, "Status cache invalidation failed");
            }
        }
    }

    /// Current status: cache hit, otherwise the durable value (re-cached).
    pub async fn get_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, StoreError> {
        let key = Self::status_key(job_id);
        match self.cache.get(&key).await {
            Ok(Some(value)) => match JobStatus::from_str(&value) {
                Ok(status) => return Ok(Some(status)),
                Err(_) => {
                    tracing::warn!(%job_id, value = %value, "Ignoring unparseable cached status");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(%job_id, error = %e, "Status cache read failed, using store");
            }
        }

        let status = self.store.get_job_status(job_id).await?;
        if let Some(status) = status {
            self.cache_status(job_id, status).await;
        }
        Ok(status)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
