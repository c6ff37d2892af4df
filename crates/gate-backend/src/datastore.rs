//! In-memory datastore for pool config, model catalog, and pod state

use dashmap::DashMap;
use gate_core::{Error, InferenceModel, InferencePool, Metrics, Pod, PodMetrics, Result};
use gate_sched::PodMetricsProvider;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// The only shared mutable state in the process.
///
/// Reconcilers and the scraper are the only writers; the scheduler and the
/// request handler read short, coherent snapshots. Pod-metrics records are
/// immutable once published, so a snapshot is a copy of `Arc` pointers.
#[derive(Debug)]
pub struct Datastore {
    pool: RwLock<Option<InferencePool>>,
    models: DashMap<String, InferenceModel>,
    pods: DashMap<String, Pod>,
    metrics: DashMap<String, Arc<PodMetrics>>,
    pool_ready_tx: watch::Sender<bool>,
}

impl Default for Datastore {
    fn default() -> Self {
        Self::new()
    }
}

impl Datastore {
    pub fn new() -> Self {
        let (pool_ready_tx, _) = watch::channel(false);
        Self {
            pool: RwLock::new(None),
            models: DashMap::new(),
            pods: DashMap::new(),
            metrics: DashMap::new(),
            pool_ready_tx,
        }
    }

    /// The active pool, or `NotReady` until the pool reconciler has seen it.
    pub fn get_pool(&self) -> Result<InferencePool> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::not_ready("inference pool not yet known"))
    }

    /// Install or replace the active pool config.
    pub fn set_pool(&self, pool: InferencePool) {
        info!(pool = %pool.pool_ref(), "Pool configuration updated");
        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = Some(pool);
        let _ = self.pool_ready_tx.send(true);
    }

    /// Forget the pool and evict every pod.
    pub fn clear_pool(&self) {
        info!("Pool configuration cleared");
        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = None;
        let _ = self.pool_ready_tx.send(false);
        self.clear_pods();
    }

    /// Block until the pool binding appears, up to `timeout`.
    pub async fn wait_for_pool(&self, timeout: Duration) -> Result<InferencePool> {
        let mut ready = self.pool_ready_tx.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                if *ready.borrow_and_update() {
                    return;
                }
                if ready.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        match waited {
            Ok(()) => self.get_pool(),
            Err(_) => Err(Error::timeout(format!(
                "pool binding did not appear within {timeout:?}"
            ))),
        }
    }

    /// Upsert a member pod. A fresh pod starts with zeroed telemetry so it
    /// is schedulable immediately; the address is refreshed in place.
    pub fn add_or_update_pod(&self, pod: Pod) {
        debug!(pod = %pod, "Pod upserted");
        self.metrics
            .entry(pod.name.clone())
            .and_modify(|existing| {
                if existing.pod != pod {
                    *existing = Arc::new(PodMetrics {
                        pod: pod.clone(),
                        metrics: existing.metrics.clone(),
                    });
                }
            })
            .or_insert_with(|| Arc::new(PodMetrics::new(pod.clone())));
        self.pods.insert(pod.name.clone(), pod);
    }

    /// Remove a pod and its telemetry.
    pub fn remove_pod(&self, name: &str) {
        if self.pods.remove(name).is_some() {
            debug!(pod = name, "Pod removed");
        }
        self.metrics.remove(name);
    }

    /// Current member pods.
    pub fn list_pods(&self) -> Vec<Pod> {
        self.pods.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Drop every pod and its telemetry.
    pub fn clear_pods(&self) {
        self.pods.clear();
        self.metrics.clear();
    }

    /// Upsert a model into the catalog, keyed by its logical model name.
    pub fn upsert_model(&self, model: InferenceModel) {
        debug!(model = %model.model_name, "Model upserted");
        self.models.insert(model.model_name.clone(), model);
    }

    /// Remove a model by its logical model name.
    pub fn remove_model(&self, model_name: &str) {
        self.models.remove(model_name);
    }

    /// Remove a model by its control-plane object name, the key deletes
    /// arrive under.
    pub fn remove_model_by_object(&self, object_name: &str) {
        self.models.retain(|_, m| m.name != object_name);
    }

    /// Look up the catalog entry for a requested model name.
    pub fn fetch_model(&self, model_name: &str) -> Option<InferenceModel> {
        self.models.get(model_name).map(|entry| entry.value().clone())
    }

    /// Publish a fresh telemetry record for a pod. Ignored when the pod is
    /// no longer a member: membership events alone decide existence.
    pub fn update_pod_metrics(&self, pod_name: &str, metrics: Metrics) {
        if let Some(pod) = self.pods.get(pod_name).map(|p| p.value().clone()) {
            self.metrics
                .insert(pod_name.to_string(), PodMetrics::with_metrics(pod, metrics));
        }
    }

    /// Reconcile the telemetry table against current membership; a safety
    /// net behind the event-driven upserts.
    pub fn sync_metrics_membership(&self) {
        for entry in self.pods.iter() {
            self.metrics
                .entry(entry.key().clone())
                .or_insert_with(|| Arc::new(PodMetrics::new(entry.value().clone())));
        }
        self.metrics
            .retain(|name, _| self.pods.contains_key(name));
    }
}

impl PodMetricsProvider for Datastore {
    fn all_pod_metrics(&self) -> Vec<Arc<PodMetrics>> {
        self.metrics
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
