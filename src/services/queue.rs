use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

const QUEUE_NAME: &str = "image-processing";
const WAIT_KEY: &str = "image-processing:wait";
const ACTIVE_KEY: &str = "image-processing:active";
const DELAYED_KEY: &str = "image-processing:delayed";
const LOCK_KEY_PREFIX: &str = "image-processing:lock:";

/// Delayed entries promoted per consume call.
const PROMOTE_BATCH: i64 = 100;

/// Job payload serialized into Redis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    /// Stable across retries of the same message.
    pub delivery_id: Uuid,
    pub job_id: Uuid,
    /// Attempts already made before this delivery.
    pub attempts: u32,
}

impl QueuedJob {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            delivery_id: Uuid::new_v4(),
            job_id,
            attempts: 0,
        }
    }
}

/// A job handed to this worker, plus the lease token proving ownership.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: QueuedJob,
    /// Exact payload as stored in the active list.
    pub payload: String,
    pub token: String,
}

impl Delivery {
    pub fn job_id(&self) -> Uuid {
        self.job.job_id
    }

    /// 1-based number of the attempt this delivery represents.
    pub fn attempt(&self) -> u32 {
        self.job.attempts + 1
    }
}

/// Bounded exponential retry: `base_delay * 2^(attempt - 1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before re-delivering after the given failed attempt, or `None`
    /// once attempts are exhausted.
    pub fn backoff(&self, failed_attempt: u32) -> Option<Duration> {
        if failed_attempt >= self.max_attempts {
            return None;
        }
        let exponent = failed_attempt.saturating_sub(1).min(16);
        Some(self.base_delay.saturating_mul(1 << exponent))
    }
}

/// Lease operations the broker offers on a delivered job.
#[async_trait]
pub trait LeaseBroker: Send + Sync {
    /// Extend our lease; fails with [`QueueError::LeaseLost`] if it is not ours.
    async fn extend_lease(&self, delivery: &Delivery, duration: Duration) -> Result<(), QueueError>;

    /// Take the lease again if it lapsed or is still ours.
    async fn reacquire_lease(
        &self,
        delivery: &Delivery,
        duration: Duration,
    ) -> Result<(), QueueError>;
}

/// At-least-once job queue with leases, delayed retries and stall recovery.
#[async_trait]
pub trait JobBroker: LeaseBroker {
    async fn enqueue(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Take the next due job, leasing it for `lease_duration`.
    async fn consume(&self, lease_duration: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge a delivery; it will not be re-delivered.
    ///
    /// This and the other settling operations fail with
    /// [`QueueError::LeaseLost`] when another consumer holds the delivery.
    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Re-deliver after `delay` with the attempt counter incremented.
    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError>;

    /// Re-deliver after `delay` without counting an attempt.
    async fn defer(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError>;

    /// Return active jobs whose lease lapsed to the wait list.
    async fn recover_stalled(&self) -> Result<Vec<Uuid>, QueueError>;

    async fn queue_depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis-backed job queue.
#[derive(Clone)]
pub struct JobQueue {
    conn: ConnectionManager,
}

impl JobQueue {
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!(queue = QUEUE_NAME, "Connected to job queue");
        Ok(Self { conn })
    }

    fn lock_key(delivery_id: Uuid) -> String {
        format!("{LOCK_KEY_PREFIX}{delivery_id}")
    }

    /// Remove the delivery from the active list and drop its lock, optionally
    /// scheduling `next` on the delayed set. Refused when another consumer
    /// holds the lock, so a late worker never settles someone else's entry.
    async fn settle(
        &self,
        delivery: &Delivery,
        next: Option<(&QueuedJob, Duration)>,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let script = Script::new(
            r#"
            local current = redis.call('GET', KEYS[3])
            if current ~= false and current ~= ARGV[2] then
                return 0
            end
            redis.call('LREM', KEYS[1], 1, ARGV[1])
            if ARGV[3] ~= '' then
                redis.call('ZADD', KEYS[2], ARGV[4], ARGV[3])
            end
            redis.call('DEL', KEYS[3])
            return 1
        "#,
        );

        let (next_payload, ready_at) = match next {
            Some((job, delay)) => (
                serde_json::to_string(job)?,
                chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64,
            ),
            None => (String::new(), 0),
        };

        let settled: i64 = script
            .key(ACTIVE_KEY)
            .key(DELAYED_KEY)
            .key(Self::lock_key(delivery.job.delivery_id))
            .arg(&delivery.payload)
            .arg(&delivery.token)
            .arg(next_payload)
            .arg(ready_at)
            .invoke_async(&mut conn)
            .await?;

        match settled {
            1 => Ok(()),
            _ => Err(QueueError::LeaseLost(delivery.job.job_id)),
        }
    }
}

#[async_trait]
impl LeaseBroker for JobQueue {
    async fn extend_lease(&self, delivery: &Delivery, duration: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let script = Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('PEXPIRE', KEYS[1], ARGV[2])
            end
            return 0
        "#,
        );
        let extended: i64 = script
            .key(Self::lock_key(delivery.job.delivery_id))
            .arg(&delivery.token)
            .arg(duration.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        match extended {
            1 => Ok(()),
            _ => Err(QueueError::LeaseLost(delivery.job.job_id)),
        }
    }

    async fn reacquire_lease(
        &self,
        delivery: &Delivery,
        duration: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let script = Script::new(
            r#"
            local current = redis.call('GET', KEYS[1])
            if current == false or current == ARGV[1] then
                redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
                return 1
            end
            return 0
        "#,
        );
        let acquired: i64 = script
            .key(Self::lock_key(delivery.job.delivery_id))
            .arg(&delivery.token)
            .arg(duration.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        match acquired {
            1 => Ok(()),
            _ => Err(QueueError::LeaseLost(delivery.job.job_id)),
        }
    }
}

#[async_trait]
impl JobBroker for JobQueue {
    async fn enqueue(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&QueuedJob::new(job_id))?;
        conn.lpush::<_, _, ()>(WAIT_KEY, &payload).await?;
        Ok(())
    }

    async fn consume(&self, lease_duration: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        // Promotion, move to active and lock happen atomically so stall
        // recovery never sees an active entry without its lock.
        let script = Script::new(
            r#"
            local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[5]))
            for _, entry in ipairs(due) do
                redis.call('ZREM', KEYS[1], entry)
                redis.call('LPUSH', KEYS[2], entry)
            end

            local payload = redis.call('RPOPLPUSH', KEYS[2], KEYS[3])
            if not payload then
                return false
            end

            local ok, job = pcall(cjson.decode, payload)
            if ok and job.delivery_id then
                redis.call('SET', ARGV[4] .. job.delivery_id, ARGV[2], 'PX', ARGV[3])
            end
            return payload
        "#,
        );

        let token = Uuid::new_v4().to_string();
        let payload: Option<String> = script
            .key(DELAYED_KEY)
            .key(WAIT_KEY)
            .key(ACTIVE_KEY)
            .arg(chrono::Utc::now().timestamp_millis())
            .arg(&token)
            .arg(lease_duration.as_millis() as u64)
            .arg(LOCK_KEY_PREFIX)
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        match serde_json::from_str::<QueuedJob>(&payload) {
            Ok(job) => Ok(Some(Delivery {
                job,
                payload,
                token,
            })),
            Err(e) => {
                // Unreadable payloads would be re-delivered forever.
                conn.lrem::<_, _, ()>(ACTIVE_KEY, 1, &payload).await?;
                Err(QueueError::Serialize(e))
            }
        }
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle(delivery, None).await
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let next = QueuedJob {
            attempts: delivery.job.attempts + 1,
            ..delivery.job.clone()
        };
        self.settle(delivery, Some((&next, delay))).await
    }

    async fn defer(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        self.settle(delivery, Some((&delivery.job, delay))).await
    }

    async fn recover_stalled(&self) -> Result<Vec<Uuid>, QueueError> {
        let mut conn = self.conn.clone();
        let script = Script::new(
            r#"
            local moved = {}
            local active = redis.call('LRANGE', KEYS[1], 0, -1)
            for _, payload in ipairs(active) do
                local ok, job = pcall(cjson.decode, payload)
                if ok and job.delivery_id then
                    if redis.call('EXISTS', ARGV[1] .. job.delivery_id) == 0 then
                        redis.call('LREM', KEYS[1], 1, payload)
                        redis.call('RPUSH', KEYS[2], payload)
                        table.insert(moved, payload)
                    end
                end
            end
            return moved
        "#,
        );

        let moved: Vec<String> = script
            .key(ACTIVE_KEY)
            .key(WAIT_KEY)
            .arg(LOCK_KEY_PREFIX)
            .invoke_async(&mut conn)
            .await?;

        Ok(moved
            .iter()
            .filter_map(|payload| serde_json::from_str::<QueuedJob>(payload).ok())
            .map(|job| job.job_id)
            .collect())
    }

    /// Jobs waiting now plus jobs waiting out a retry delay.
    async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let waiting: u64 = conn.llen(WAIT_KEY).await?;
        let delayed: u64 = conn.zcard(DELAYED_KEY).await?;
        Ok(waiting + delayed)
    }

    /// Check Redis connectivity (for health checks).
    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Lease for job {0} is held by another consumer or expired")]
    LeaseLost(Uuid),
}
