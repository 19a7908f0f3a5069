//! In-memory collaborators for exercising the worker without PostgreSQL,
//! Redis or the network.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use image_batch_processor::config::WorkerSettings;
use image_batch_processor::models::job::{ImageStatus, Job, JobImage, JobStatus, NewJobImage};
use image_batch_processor::models::store::{ReferenceDataSet, StoreRecord};
use image_batch_processor::services::dispatcher::Dispatcher;
use image_batch_processor::services::events::EventBus;
use image_batch_processor::services::job_store::{JobStore, StoreError};
use image_batch_processor::services::lease::LeaseManager;
use image_batch_processor::services::metadata::{FetchError, ImageMetadata, MetadataFetcher};
use image_batch_processor::services::processor::ItemProcessor;
use image_batch_processor::services::queue::{
    Delivery, JobBroker, LeaseBroker, QueueError, QueuedJob, RetryPolicy,
};
use image_batch_processor::services::state_machine::JobRunner;
use image_batch_processor::services::status_cache::{CacheError, StatusCache, StatusWriter};

pub const KNOWN_STORES: &[&str] = &["RP00001", "RP00002", "S00339218"];

// ── Durable store ────────────────────────────────────────────────────

#[derive(Default)]
struct StoreState {
    jobs: HashMap<Uuid, Job>,
    images: Vec<JobImage>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    mutations: AtomicUsize,
    pub fail_list_images: AtomicBool,
    pub fail_status_updates: AtomicBool,
}

impl MemoryStore {
    pub fn job(&self, job_id: Uuid) -> Job {
        self.state.lock().unwrap().jobs[&job_id].clone()
    }

    pub fn images(&self, job_id: Uuid) -> Vec<JobImage> {
        self.state
            .lock()
            .unwrap()
            .images
            .iter()
            .filter(|i| i.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Force a status and last-update instant, bypassing mutation tracking.
    pub fn set_job(&self, job_id: Uuid, status: JobStatus, updated_ago: Duration) {
        let mut state = self.state.lock().unwrap();
        let job = state.jobs.get_mut(&job_id).unwrap();
        job.status = status;
        job.updated_at = Utc::now() - chrono::Duration::from_std(updated_ago).unwrap();
    }

    /// Number of writes made through the [`JobStore`] interface after submission.
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn mutate(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, images: &[NewJobImage]) -> Result<Uuid, StoreError> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let job_id = Uuid::new_v4();
        state.jobs.insert(
            job_id,
            Job {
                id: job_id,
                status: JobStatus::Pending,
                created_at: now,
                updated_at: now,
            },
        );
        for image in images {
            state.images.push(JobImage {
                id: Uuid::new_v4(),
                job_id,
                store_id: image.store_id.clone(),
                image_url: image.image_url.clone(),
                status: ImageStatus::Pending,
                perimeter: None,
            });
        }
        Ok(job_id)
    }

    async fn get_job_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, StoreError> {
        Ok(self.state.lock().unwrap().jobs.get(&job_id).map(|j| j.status))
    }

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        if self.fail_status_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        job.status = status;
        job.updated_at = Utc::now();
        self.mutate();
        Ok(())
    }

    async fn touch_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.updated_at = Utc::now();
        }
        self.mutate();
        Ok(())
    }

    async fn elapsed_since_update(&self, job_id: Uuid) -> Result<Option<Duration>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.jobs.get(&job_id).map(|job| elapsed(job.updated_at)))
    }

    async fn list_images(&self, job_id: Uuid) -> Result<Vec<JobImage>, StoreError> {
        if self.fail_list_images.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(self.images(job_id))
    }

    async fn update_image_status(
        &self,
        image_id: Uuid,
        status: ImageStatus,
        perimeter: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(image) = state.images.iter_mut().find(|i| i.id == image_id) {
            image.status = status;
            image.perimeter = perimeter;
        }
        self.mutate();
        Ok(())
    }

    async fn failed_store_ids(&self, job_id: Uuid) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self
            .images(job_id)
            .into_iter()
            .filter(|i| i.status == ImageStatus::Failed)
            .map(|i| i.store_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn elapsed(since: DateTime<Utc>) -> Duration {
    (Utc::now() - since).to_std().unwrap_or_default()
}

// ── Status cache ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
    writes: AtomicUsize,
    pub fail_writes: AtomicBool,
}

impl MemoryCache {
    pub fn value(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.value(key))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, _ttl: Duration) -> Result<(), CacheError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "writes disabled",
            ))));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.insert(key, value);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        if ttl.is_zero() {
            self.entries.lock().unwrap().remove(key);
        }
        Ok(())
    }
}

// ── Broker ───────────────────────────────────────────────────────────

#[derive(Default)]
struct BrokerState {
    wait: VecDeque<QueuedJob>,
    delayed: Vec<(QueuedJob, tokio::time::Instant)>,
    active: Vec<Delivery>,
    /// delivery id → token of the consumer holding the lease
    locks: HashMap<Uuid, String>,
    completed: Vec<Uuid>,
    retries: Vec<(Uuid, Duration)>,
    deferrals: Vec<(Uuid, Duration)>,
}

impl BrokerState {
    /// Settling is refused when another consumer holds the lease.
    fn settle(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        if self.held_by_other(delivery) {
            return Err(QueueError::LeaseLost(delivery.job_id()));
        }
        if let Some(pos) = self.active.iter().position(|d| d.payload == delivery.payload) {
            self.active.remove(pos);
        }
        self.locks.remove(&delivery.job.delivery_id);
        Ok(())
    }

    fn held_by_other(&self, delivery: &Delivery) -> bool {
        matches!(
            self.locks.get(&delivery.job.delivery_id),
            Some(token) if *token != delivery.token
        )
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    extends: AtomicU64,
}

impl MemoryBroker {
    pub fn extend_calls(&self) -> u64 {
        self.extends.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> Vec<Uuid> {
        self.state.lock().unwrap().completed.clone()
    }

    pub fn retries(&self) -> Vec<(Uuid, Duration)> {
        self.state.lock().unwrap().retries.clone()
    }

    pub fn deferrals(&self) -> Vec<(Uuid, Duration)> {
        self.state.lock().unwrap().deferrals.clone()
    }

    pub fn active_len(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    /// Simulate the lease of an active delivery running out.
    pub fn lapse(&self, delivery_id: Uuid) {
        self.state.lock().unwrap().locks.remove(&delivery_id);
    }

    /// Make every delayed entry due now.
    pub fn release_delayed(&self) {
        let now = tokio::time::Instant::now();
        for (_, ready) in self.state.lock().unwrap().delayed.iter_mut() {
            *ready = now;
        }
    }

    /// Build a delivery as if consumed, without touching the queues.
    pub fn delivery_for(job_id: Uuid, attempts: u32) -> Delivery {
        let job = QueuedJob {
            attempts,
            ..QueuedJob::new(job_id)
        };
        Delivery {
            payload: serde_json::to_string(&job).unwrap(),
            job,
            token: Uuid::new_v4().to_string(),
        }
    }
}

#[async_trait]
impl LeaseBroker for MemoryBroker {
    async fn extend_lease(&self, delivery: &Delivery, _duration: Duration) -> Result<(), QueueError> {
        self.extends.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        match state.locks.get(&delivery.job.delivery_id) {
            Some(token) if *token == delivery.token => Ok(()),
            _ => Err(QueueError::LeaseLost(delivery.job_id())),
        }
    }

    async fn reacquire_lease(
        &self,
        delivery: &Delivery,
        _duration: Duration,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if state.held_by_other(delivery) {
            return Err(QueueError::LeaseLost(delivery.job_id()));
        }
        state
            .locks
            .insert(delivery.job.delivery_id, delivery.token.clone());
        Ok(())
    }
}

#[async_trait]
impl JobBroker for MemoryBroker {
    async fn enqueue(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.state
            .lock()
            .unwrap()
            .wait
            .push_back(QueuedJob::new(job_id));
        Ok(())
    }

    async fn consume(&self, _lease_duration: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.state.lock().unwrap();
        let now = tokio::time::Instant::now();
        let (due, later): (Vec<_>, Vec<_>) =
            state.delayed.drain(..).partition(|(_, ready)| *ready <= now);
        state.delayed = later;
        state.wait.extend(due.into_iter().map(|(job, _)| job));

        let Some(job) = state.wait.pop_front() else {
            return Ok(None);
        };
        let delivery = Delivery {
            payload: serde_json::to_string(&job)?,
            job,
            token: Uuid::new_v4().to_string(),
        };
        state
            .locks
            .insert(delivery.job.delivery_id, delivery.token.clone());
        state.active.push(delivery.clone());
        Ok(Some(delivery))
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.settle(delivery)?;
        state.completed.push(delivery.job_id());
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.settle(delivery)?;
        state.retries.push((delivery.job_id(), delay));
        let next = QueuedJob {
            attempts: delivery.job.attempts + 1,
            ..delivery.job.clone()
        };
        state
            .delayed
            .push((next, tokio::time::Instant::now() + delay));
        Ok(())
    }

    async fn defer(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.settle(delivery)?;
        state.deferrals.push((delivery.job_id(), delay));
        state
            .delayed
            .push((delivery.job.clone(), tokio::time::Instant::now() + delay));
        Ok(())
    }

    async fn recover_stalled(&self) -> Result<Vec<Uuid>, QueueError> {
        let mut state = self.state.lock().unwrap();
        let active = std::mem::take(&mut state.active);
        let (stalled, live): (Vec<_>, Vec<_>) = active
            .into_iter()
            .partition(|d| !state.locks.contains_key(&d.job.delivery_id));
        state.active = live;
        let job_ids = stalled.iter().map(|d| d.job_id()).collect();
        state.wait.extend(stalled.into_iter().map(|d| d.job));
        Ok(job_ids)
    }

    async fn queue_depth(&self) -> Result<u64, QueueError> {
        let state = self.state.lock().unwrap();
        Ok((state.wait.len() + state.delayed.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

// ── Metadata fetch ───────────────────────────────────────────────────

/// Answers every URL with a fixed content length, except URLs containing
/// `broken`, which fail with HTTP 404. `fail_all` fails every URL.
pub struct StubFetcher {
    pub content_length: u64,
    pub latency: Duration,
    pub fail_all: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StubFetcher {
    pub fn new(content_length: u64) -> Self {
        Self {
            content_length,
            latency: Duration::ZERO,
            fail_all: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataFetcher for StubFetcher {
    async fn head(&self, url: &str) -> Result<ImageMetadata, FetchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if url.contains("broken") || self.fail_all.load(Ordering::SeqCst) {
            return Err(FetchError::Status(404));
        }
        Ok(ImageMetadata {
            content_length: self.content_length,
        })
    }
}

// ── Wiring ───────────────────────────────────────────────────────────

pub fn reference_data() -> ReferenceDataSet {
    KNOWN_STORES
        .iter()
        .map(|id| {
            (
                id.to_string(),
                StoreRecord {
                    store_name: format!("Store {id}"),
                    area_code: "7".to_string(),
                },
            )
        })
        .collect()
}

pub fn settings() -> WorkerSettings {
    WorkerSettings {
        concurrency: 2,
        lease_duration: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(10),
        stall_threshold: Duration::from_secs(300),
        status_ttl: Duration::from_secs(3600),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
        },
        fetch_timeout: Duration::from_secs(1),
        processing_delay: (Duration::ZERO, Duration::ZERO),
        poll_interval: Duration::from_millis(5),
        stalled_check_interval: Duration::from_millis(20),
    }
}

/// A fully wired worker over in-memory collaborators.
pub struct TestWorld {
    pub store: Arc<MemoryStore>,
    pub cache: Arc<MemoryCache>,
    pub broker: Arc<MemoryBroker>,
    pub fetcher: Arc<StubFetcher>,
    pub status: Arc<StatusWriter>,
    pub processor: Arc<ItemProcessor>,
    pub runner: Arc<JobRunner>,
    pub leases: LeaseManager,
    pub events: EventBus,
    pub settings: WorkerSettings,
}

impl TestWorld {
    pub fn new() -> Self {
        Self::with_fetcher(StubFetcher::new(1024))
    }

    pub fn with_fetcher(fetcher: StubFetcher) -> Self {
        let settings = settings();
        let store = Arc::new(MemoryStore::default());
        let cache = Arc::new(MemoryCache::default());
        let broker = Arc::new(MemoryBroker::default());
        let fetcher = Arc::new(fetcher);

        let status = Arc::new(StatusWriter::new(
            store.clone(),
            cache.clone(),
            settings.status_ttl,
        ));
        let processor = Arc::new(ItemProcessor::new(
            store.clone(),
            fetcher.clone(),
            Arc::new(reference_data()),
            settings.processing_delay,
        ));
        let runner = Arc::new(JobRunner::new(
            store.clone(),
            status.clone(),
            processor.clone(),
            settings.stall_threshold,
        ));

        Self {
            leases: LeaseManager::new(broker.clone(), settings.heartbeat_interval),
            store,
            cache,
            broker,
            fetcher,
            status,
            processor,
            runner,
            events: EventBus::new(),
            settings,
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            self.broker.clone(),
            self.leases.clone(),
            self.runner.clone(),
            self.events.clone(),
            self.settings.clone(),
        ))
    }

    /// Persist a pending job with one image per `(store_id, url)` pair.
    pub async fn submit(&self, images: &[(&str, &str)]) -> Uuid {
        let images: Vec<NewJobImage> = images
            .iter()
            .map(|(store_id, url)| NewJobImage {
                store_id: store_id.to_string(),
                image_url: url.to_string(),
            })
            .collect();
        let job_id = self.store.insert_job(&images).await.unwrap();
        self.status.cache_status(job_id, JobStatus::Pending).await;
        job_id
    }

    pub fn image_statuses(&self, job_id: Uuid) -> Vec<ImageStatus> {
        self.store
            .images(job_id)
            .into_iter()
            .map(|i| i.status)
            .collect()
    }
}
