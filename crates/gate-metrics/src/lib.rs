//! # gate-metrics
//!
//! Process-wide Prometheus metrics for infergate.
//!
//! This crate provides:
//! - Request counters, latency/size/token histograms labeled by model and
//!   target model
//! - Pool-level gauges for average KV-cache utilization and queue depth
//! - One-time idempotent registration against the process registry
//! - An axum `/metrics` endpoint serving the text exposition format

use thiserror::Error;

pub mod exporter;
pub mod registry;

pub use exporter::MetricsExporter;
pub use registry::{registered, InferenceMetrics};

/// Result type for metrics operations
pub type Result<T> = std::result::Result<T, MetricsError>;

/// Errors that can occur during metrics operations
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
