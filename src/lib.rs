//! Batch Image Processing Service
//!
//! This library provides the core functionality for the image-batch-processor
//! system: job submission and status lookup over HTTP, and a Redis-backed
//! worker that processes each job's images under a renewable lease while
//! tracking job and image status in PostgreSQL with a Redis status cache.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
