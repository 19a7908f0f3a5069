use serde::Deserialize;
use std::time::Duration;

use crate::services::queue::RetryPolicy;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue and status cache
    pub redis_url: String,

    /// CSV file mapping store ids to store records
    #[serde(default = "default_reference_data_path")]
    pub reference_data_path: String,

    /// Maximum number of jobs processed concurrently by one worker process
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,

    /// An in-progress job not updated for longer than this is considered stalled
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,

    /// TTL of cached job status entries
    #[serde(default = "default_status_ttl_secs")]
    pub status_ttl_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay of the exponential retry backoff
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_processing_delay_min_ms")]
    pub processing_delay_min_ms: u64,

    #[serde(default = "default_processing_delay_max_ms")]
    pub processing_delay_max_ms: u64,

    /// Sleep between queue polls when no job is available
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_stalled_check_interval_secs")]
    pub stalled_check_interval_secs: u64,

    /// Prometheus listener for the worker process
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_reference_data_path() -> String {
    "data/StoreMasterAssignment.csv".to_string()
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_lease_duration_secs() -> u64 {
    300
}

fn default_stall_threshold_secs() -> u64 {
    300
}

fn default_status_ttl_secs() -> u64 {
    3600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_processing_delay_min_ms() -> u64 {
    100
}

fn default_processing_delay_max_ms() -> u64 {
    400
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_stalled_check_interval_secs() -> u64 {
    30
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

/// Heartbeats run this many times per lease duration.
const HEARTBEATS_PER_LEASE: u32 = 30;

/// Typed worker tuning derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub lease_duration: Duration,
    pub heartbeat_interval: Duration,
    pub stall_threshold: Duration,
    pub status_ttl: Duration,
    pub retry: RetryPolicy,
    pub fetch_timeout: Duration,
    pub processing_delay: (Duration, Duration),
    pub poll_interval: Duration,
    pub stalled_check_interval: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        let lease_duration = Duration::from_secs(self.lease_duration_secs);
        let min_delay = self.processing_delay_min_ms;
        let max_delay = self.processing_delay_max_ms.max(min_delay);

        WorkerSettings {
            concurrency: self.worker_concurrency.max(1),
            lease_duration,
            heartbeat_interval: heartbeat_interval(lease_duration),
            stall_threshold: Duration::from_secs(self.stall_threshold_secs),
            status_ttl: Duration::from_secs(self.status_ttl_secs),
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                base_delay: Duration::from_millis(self.backoff_base_ms),
            },
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            processing_delay: (
                Duration::from_millis(min_delay),
                Duration::from_millis(max_delay),
            ),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stalled_check_interval: Duration::from_secs(self.stalled_check_interval_secs),
        }
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }
}

/// Renewal cadence for a lease of the given length (1/30th, never zero).
pub fn heartbeat_interval(lease_duration: Duration) -> Duration {
    (lease_duration / HEARTBEATS_PER_LEASE).max(Duration::from_millis(1))
}
