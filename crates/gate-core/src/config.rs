//! Runner configuration: defaults, validation, and file loading

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default ext-proc listen port
pub const DEFAULT_GRPC_PORT: u16 = 9002;

/// Default header/metadata key carrying the chosen endpoint to the proxy
pub const DEFAULT_TARGET_ENDPOINT_KEY: &str = "x-gateway-destination-endpoint";

/// Default pool namespace
pub const DEFAULT_POOL_NAMESPACE: &str = "default";

/// Default Prometheus exporter port
pub const DEFAULT_METRICS_PORT: u16 = 9090;

/// Top-level configuration for the endpoint-picker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// ext-proc gRPC listen port
    pub grpc_port: u16,

    /// Header and dynamic-metadata key written back to the proxy
    pub target_endpoint_key: String,

    /// Name of the InferencePool to bind; required
    pub pool_name: String,

    /// Namespace of the pool
    pub pool_namespace: String,

    /// Pool-membership reconciliation cadence
    #[serde(with = "humantime_serde")]
    pub refresh_pods_interval: Duration,

    /// Per-pod scrape cadence
    #[serde(with = "humantime_serde")]
    pub refresh_metrics_interval: Duration,

    /// Pool-gauge refresh cadence
    #[serde(with = "humantime_serde")]
    pub refresh_prometheus_metrics_interval: Duration,

    /// Serve the ext-proc endpoint over TLS
    pub secure_serving: bool,

    /// Directory containing `tls.crt` and `tls.key`; when empty and
    /// `secure_serving` is on, a self-signed certificate is synthesized
    pub cert_path: Option<PathBuf>,

    /// Prometheus exporter listen port
    pub metrics_port: u16,

    /// How long to wait at startup for the pool binding to appear
    #[serde(with = "humantime_serde")]
    pub pool_ready_timeout: Duration,

    /// Optional seed file declaring the pool, models, and static pods,
    /// replayed through the reconcilers at startup (dev/test stand-in for a
    /// live control-plane watch)
    pub bootstrap: Option<PathBuf>,

    /// Scheduling policy thresholds
    pub scheduler: SchedulerConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            grpc_port: DEFAULT_GRPC_PORT,
            target_endpoint_key: DEFAULT_TARGET_ENDPOINT_KEY.to_string(),
            pool_name: String::new(),
            pool_namespace: DEFAULT_POOL_NAMESPACE.to_string(),
            refresh_pods_interval: Duration::from_secs(10),
            refresh_metrics_interval: Duration::from_millis(50),
            refresh_prometheus_metrics_interval: Duration::from_secs(5),
            secure_serving: true,
            cert_path: None,
            metrics_port: DEFAULT_METRICS_PORT,
            pool_ready_timeout: Duration::from_secs(30),
            bootstrap: None,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.pool_name.is_empty() {
            return Err(crate::Error::config("pool name is required"));
        }
        if self.target_endpoint_key.is_empty() {
            return Err(crate::Error::config("target endpoint key must not be empty"));
        }
        if self.refresh_metrics_interval.is_zero() {
            return Err(crate::Error::config(
                "metrics refresh interval must be positive",
            ));
        }
        if self.refresh_pods_interval.is_zero() {
            return Err(crate::Error::config("pods refresh interval must be positive"));
        }
        self.scheduler.validate()
    }
}

/// Scheduling policy thresholds.
///
/// Defaults were arrived at heuristically; operators can override them in
/// the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// KV-cache utilization above which a pod stops accepting sheddable work
    pub kv_cache_threshold: f64,

    /// Queue depth above which a pod stops accepting sheddable work
    pub queue_threshold_critical: u32,

    /// Queue depth below which LoRA affinity is prioritized over load
    pub queueing_threshold_lora: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kv_cache_threshold: 0.8,
            queue_threshold_critical: 5,
            queueing_threshold_lora: 50,
        }
    }
}

impl SchedulerConfig {
    /// Validate threshold ranges
    pub fn validate(&self) -> crate::Result<()> {
        if !(0.0..=1.0).contains(&self.kv_cache_threshold) {
            return Err(crate::Error::config(format!(
                "kv_cache_threshold {} outside [0, 1]",
                self.kv_cache_threshold
            )));
        }
        Ok(())
    }
}
