pub mod dispatcher;
pub mod events;
pub mod job_store;
pub mod lease;
pub mod metadata;
pub mod processor;
pub mod queue;
pub mod reference_data;
pub mod state_machine;
pub mod status_cache;
