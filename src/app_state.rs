use std::sync::Arc;

use crate::services::{job_store::JobStore, queue::JobBroker, status_cache::StatusWriter};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub status: Arc<StatusWriter>,
    pub queue: Arc<dyn JobBroker>,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>, status: StatusWriter, queue: Arc<dyn JobBroker>) -> Self {
        Self {
            store,
            status: Arc::new(status),
            queue,
        }
    }
}
