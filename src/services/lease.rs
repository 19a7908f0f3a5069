//! Renewable per-job leases.
//!
//! A [`Lease`] owns the heartbeat task of exactly one delivery. Dropping or
//! releasing it stops the heartbeat; [`Lease::release`] also waits for an
//! in-flight renewal to finish, so no renewal happens after it returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::services::queue::{Delivery, LeaseBroker};

/// Issues leases over delivered jobs.
#[derive(Clone)]
pub struct LeaseManager {
    broker: Arc<dyn LeaseBroker>,
    heartbeat: Duration,
}

impl LeaseManager {
    /// `heartbeat` must be well below any lease duration passed to
    /// [`LeaseManager::acquire`]; see [`crate::config::heartbeat_interval`].
    pub fn new(broker: Arc<dyn LeaseBroker>, heartbeat: Duration) -> Self {
        Self { broker, heartbeat }
    }

    /// Establish ownership of `delivery` for `duration` and start renewing
    /// it every heartbeat interval.
    ///
    /// Failing to take the lease is logged, not fatal: the job status check
    /// decides whether another worker is active.
    pub async fn acquire(&self, delivery: Delivery, duration: Duration) -> Lease {
        let handle = LeaseHandle {
            broker: Arc::clone(&self.broker),
            delivery: Arc::new(delivery),
            duration,
            renewals: Arc::new(AtomicU64::new(0)),
        };

        if let Err(e) = self.broker.reacquire_lease(&handle.delivery, duration).await {
            metrics::counter!("lease_renewal_failures_total").increment(1);
            tracing::warn!(
                job_id = %handle.job_id(),
                delivery_id = %handle.delivery.job.delivery_id,
                error = %e,
                "Could not take lease, continuing without it"
            );
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(heartbeat(
            handle.clone(),
            self.heartbeat,
            cancel.clone(),
        ));

        Lease {
            handle,
            cancel,
            task: Some(task),
        }
    }
}

async fn heartbeat(handle: LeaseHandle, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                handle.renew().await;
            }
        }
    }
}

/// Cheap, cloneable access to a lease for code running under it.
#[derive(Clone)]
pub struct LeaseHandle {
    broker: Arc<dyn LeaseBroker>,
    delivery: Arc<Delivery>,
    duration: Duration,
    renewals: Arc<AtomicU64>,
}

impl LeaseHandle {
    pub fn job_id(&self) -> uuid::Uuid {
        self.delivery.job_id()
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Renewal attempts made so far through this lease.
    pub fn renewal_attempts(&self) -> u64 {
        self.renewals.load(Ordering::Relaxed)
    }

    /// Extend the lease; on failure try one re-acquisition. Returns whether
    /// the lease is held afterwards. Never fails the caller.
    pub async fn renew(&self) -> bool {
        self.renewals.fetch_add(1, Ordering::Relaxed);
        let job_id = self.job_id();

        let err = match self.broker.extend_lease(&self.delivery, self.duration).await {
            Ok(()) => {
                tracing::debug!(%job_id, "Lease extended");
                return true;
            }
            Err(e) => e,
        };

        tracing::warn!(%job_id, error = %err, "Failed to extend lease, re-acquiring");
        match self.broker.reacquire_lease(&self.delivery, self.duration).await {
            Ok(()) => {
                tracing::info!(%job_id, "Lease re-acquired");
                true
            }
            Err(e) => {
                metrics::counter!("lease_renewal_failures_total").increment(1);
                tracing::error!(%job_id, error = %e, "Unable to re-acquire lease, continuing");
                false
            }
        }
    }
}

/// Scope guard for a leased job.
pub struct Lease {
    handle: LeaseHandle,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Lease {
    pub fn handle(&self) -> &LeaseHandle {
        &self.handle
    }

    /// Stop the heartbeat and wait for it to exit.
    pub async fn release(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(job_id = %self.handle.job_id(), error = %e, "Lease heartbeat ended abnormally");
            }
        }
        tracing::info!(job_id = %self.handle.job_id(), "Lease renewal stopped");
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
