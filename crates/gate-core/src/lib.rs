//! # gate-core
//!
//! Core types, traits, and utilities for infergate - an external-processor
//! endpoint picker for LLM inference gateways.
//!
//! This crate provides the foundational data structures and interfaces that
//! are shared across all other infergate components. It includes:
//!
//! - Core data structures for the pool, pods, pod metrics, and the model
//!   catalog
//! - The per-request record handed to the scheduler
//! - Configuration schema and parsing utilities
//! - Error handling types and utilities

pub mod config;
pub mod error;
pub mod model;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{RunnerConfig, SchedulerConfig};
pub use error::{Error, Result};
pub use model::{Criticality, InferenceModel, TargetModel};
pub use types::{InferencePool, LlmRequest, Metrics, Pod, PodMetrics, PoolRef};
