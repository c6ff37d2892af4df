//! # gate-backend
//!
//! The live data plane for pod state.
//!
//! This crate provides:
//! - The [`Datastore`]: the in-memory snapshot of pool config, model
//!   catalog, pod membership, and per-pod telemetry
//! - Control-plane reconcilers keeping the datastore current from external
//!   add/update/delete notifications
//! - The metrics [`Provider`]: periodic scraping of each pod's Prometheus
//!   endpoint and publication of pool-wide gauges

pub mod datastore;
pub mod provider;
pub mod reconcile;
pub mod scrape;

pub use datastore::Datastore;
pub use provider::{Provider, ProviderHandle};
pub use reconcile::{
    BootstrapSeed, ModelReconciler, PodInfo, PodReconciler, PoolReconciler, WatchEvent,
};
pub use scrape::{HttpMetricsClient, PodMetricsClient};
