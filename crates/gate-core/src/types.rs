//! Core data structures for the pool, pods, and per-pod telemetry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Reference identifying the one inference pool this process manages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolRef {
    pub name: String,
    pub namespace: String,
}

impl PoolRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for PoolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The logical unit being balanced: a homogeneous fleet of model-server pods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferencePool {
    /// Pool name
    pub name: String,

    /// Pool namespace
    pub namespace: String,

    /// Port each member pod serves inference (and `/metrics`) on
    pub target_port: u16,

    /// Label selector identifying member pods
    #[serde(default)]
    pub selector: HashMap<String, String>,
}

impl InferencePool {
    /// Pool-scoped reference for this pool
    pub fn pool_ref(&self) -> PoolRef {
        PoolRef::new(self.name.clone(), self.namespace.clone())
    }

    /// Whether a pod with the given labels is selected by this pool.
    ///
    /// An empty selector matches nothing; a pool must opt pods in explicitly.
    pub fn selects(&self, labels: &HashMap<String, String>) -> bool {
        !self.selector.is_empty()
            && self
                .selector
                .iter()
                .all(|(k, v)| labels.get(k).is_some_and(|lv| lv == v))
    }
}

/// A backend model-server instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pod {
    /// Pool-scoped pod name
    pub name: String,

    /// Network address, `ip:targetPort`
    pub address: String,
}

impl Pod {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Pod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.address)
    }
}

/// Telemetry scraped from one pod's metrics endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Number of requests queued at the server
    pub waiting_queue_size: u32,

    /// Fraction of KV-cache currently in use, in [0, 1]
    pub kv_cache_usage_percent: f64,

    /// Identifiers of LoRA adapters currently loaded
    pub active_models: HashSet<String>,

    /// Capacity for concurrently loaded adapters
    pub max_active_models: u32,

    /// Wall-clock of the last successful scrape
    pub updated_at: DateTime<Utc>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            waiting_queue_size: 0,
            kv_cache_usage_percent: 0.0,
            active_models: HashSet::new(),
            max_active_models: 0,
            updated_at: Utc::now(),
        }
    }
}

impl Metrics {
    /// Whether the pod has room to load another adapter
    pub fn has_adapter_capacity(&self) -> bool {
        (self.active_models.len() as u32) < self.max_active_models
    }
}

/// A pod together with its most recent telemetry.
///
/// Records are immutable once published; the scraper replaces the whole
/// record on update so readers holding an `Arc` observe a coherent view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodMetrics {
    pub pod: Pod,
    pub metrics: Metrics,
}

impl PodMetrics {
    pub fn new(pod: Pod) -> Self {
        Self {
            pod,
            metrics: Metrics::default(),
        }
    }

    pub fn with_metrics(pod: Pod, metrics: Metrics) -> Arc<Self> {
        Arc::new(Self { pod, metrics })
    }
}

impl fmt::Display for PodMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} queue={} kv={:.3} adapters={}/{}",
            self.pod,
            self.metrics.waiting_queue_size,
            self.metrics.kv_cache_usage_percent,
            self.metrics.active_models.len(),
            self.metrics.max_active_models
        )
    }
}

/// Transient per-request record handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmRequest {
    /// Model name as requested by the client
    pub model: String,

    /// Target model after weighted resolution; equals `model` when the
    /// catalog declares no target variants
    pub resolved_target_model: String,

    /// Whether the request inherits `Critical` from its model
    pub critical: bool,
}
