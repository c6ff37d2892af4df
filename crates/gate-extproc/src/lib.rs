//! # gate-extproc
//!
//! The request-processing protocol driver for infergate.
//!
//! This crate provides:
//! - The per-stream state machine turning ext-proc messages into header and
//!   body mutations plus dynamic metadata
//! - The tonic `ExternalProcessor` service implementation
//! - TLS bootstrap (certificate directory or self-signed synthesis)
//! - The server runner wiring the datastore, reconcilers, scraper,
//!   scheduler, and gRPC server together
//! - The `gated` binary

pub mod handler;
pub mod runner;
pub mod service;
pub mod tls;

pub use handler::{ExtProcService, RequestContext};
pub use runner::{ControlPlaneChannels, ServerRunner};
