//! # gate-sched
//!
//! Request scheduling for infergate.
//!
//! This crate provides:
//! - A generic, composable filter-tree engine over pod sets with
//!   success/failure branching
//! - The concrete policy tree balancing load, LoRA affinity, and admission
//!   control across criticality classes
//! - The scheduler entry point that reduces the live fleet to a single pod

pub mod filter;
pub mod scheduler;

pub use filter::{Filter, PodSet};
pub use scheduler::{PodMetricsProvider, Scheduler};
