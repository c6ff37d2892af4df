//! Error handling for infergate
//!
//! Provides a unified error type and result type for use across all infergate
//! components.

/// Result type alias for infergate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for infergate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Invalid request or parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Required state is not yet available
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Backend capacity exhausted; the caller may shed or retry
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Metrics scrape or parse errors
    #[error("Scrape error: {0}")]
    Scrape(String),

    /// Certificate loading or synthesis errors
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a not ready error
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a scrape error
    pub fn scrape(msg: impl Into<String>) -> Self {
        Self::Scrape(msg.into())
    }

    /// Create a certificate error
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable from the client's perspective
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ResourceExhausted(_)
                | Error::NotReady(_)
                | Error::Network(_)
                | Error::Timeout(_)
        )
    }

    /// Check if this error indicates a client-side problem
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidRequest(_) | Error::NotFound(_) | Error::Json(_)
        )
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) => "configuration",
            Error::InvalidRequest(_) => "invalid_request",
            Error::NotFound(_) => "not_found",
            Error::NotReady(_) => "not_ready",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::Network(_) => "network",
            Error::Timeout(_) => "timeout",
            Error::Scrape(_) => "scrape",
            Error::Certificate(_) => "certificate",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
        }
    }
}
