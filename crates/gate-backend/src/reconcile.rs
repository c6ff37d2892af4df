//! Control-plane reconcilers
//!
//! The orchestration platform's watch clients live outside this process;
//! they deliver add/update/delete notifications over typed channels. Each
//! reconciler drains one channel and keeps the datastore current. Appliers
//! are idempotent: replaying a notification for the same state is a no-op.

use crate::datastore::Datastore;
use gate_core::{InferenceModel, InferencePool, Pod, PoolRef, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One notification from an external watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    /// The object exists with this state (create or update).
    Applied(T),
    /// The object named by the key is gone.
    Deleted(String),
}

/// Pod-level facts delivered by the platform watch: identity, address, the
/// labels the pool selector matches against, and readiness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub ip: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default = "default_ready")]
    pub ready: bool,
}

fn default_ready() -> bool {
    true
}

/// Tracks the one InferencePool this process is bound to.
pub struct PoolReconciler {
    datastore: Arc<Datastore>,
    pool_ref: PoolRef,
}

impl PoolReconciler {
    pub fn new(datastore: Arc<Datastore>, pool_ref: PoolRef) -> Self {
        Self {
            datastore,
            pool_ref,
        }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<WatchEvent<InferencePool>>) {
        info!(pool = %self.pool_ref, "Pool reconciler started");
        while let Some(event) = rx.recv().await {
            self.apply(event);
        }
        debug!("Pool reconciler event stream closed");
    }

    pub fn apply(&self, event: WatchEvent<InferencePool>) {
        match event {
            WatchEvent::Applied(pool) => {
                if pool.name == self.pool_ref.name && pool.namespace == self.pool_ref.namespace {
                    self.datastore.set_pool(pool);
                }
            }
            WatchEvent::Deleted(name) => {
                if name == self.pool_ref.name {
                    self.datastore.clear_pool();
                }
            }
        }
    }
}

/// Maintains the model catalog for the bound pool.
pub struct ModelReconciler {
    datastore: Arc<Datastore>,
    pool_name: String,
}

impl ModelReconciler {
    pub fn new(datastore: Arc<Datastore>, pool_name: impl Into<String>) -> Self {
        Self {
            datastore,
            pool_name: pool_name.into(),
        }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<WatchEvent<InferenceModel>>) {
        info!(pool = %self.pool_name, "Model reconciler started");
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.apply(event) {
                warn!(error = %e, "Rejected model notification");
            }
        }
        debug!("Model reconciler event stream closed");
    }

    pub fn apply(&self, event: WatchEvent<InferenceModel>) -> Result<()> {
        match event {
            WatchEvent::Applied(model) => {
                if model.pool_name != self.pool_name {
                    debug!(
                        model = %model.model_name,
                        pool = %model.pool_name,
                        "Ignoring model for another pool"
                    );
                    return Ok(());
                }
                model.validate()?;
                self.datastore.upsert_model(model);
            }
            WatchEvent::Deleted(object_name) => {
                self.datastore.remove_model_by_object(&object_name);
            }
        }
        Ok(())
    }
}

/// Maintains pod membership from pod-level events: a pod is a member while
/// it matches the pool selector and reports ready.
pub struct PodReconciler {
    datastore: Arc<Datastore>,
}

impl PodReconciler {
    pub fn new(datastore: Arc<Datastore>) -> Self {
        Self { datastore }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<WatchEvent<PodInfo>>) {
        info!("Pod reconciler started");
        while let Some(event) = rx.recv().await {
            self.apply(event);
        }
        debug!("Pod reconciler event stream closed");
    }

    pub fn apply(&self, event: WatchEvent<PodInfo>) {
        match event {
            WatchEvent::Applied(info) => {
                let Ok(pool) = self.datastore.get_pool() else {
                    debug!(pod = %info.name, "Ignoring pod event; pool not yet known");
                    return;
                };
                if info.ready && pool.selects(&info.labels) {
                    let address = format!("{}:{}", info.ip, pool.target_port);
                    self.datastore.add_or_update_pod(Pod::new(info.name, address));
                } else {
                    self.datastore.remove_pod(&info.name);
                }
            }
            WatchEvent::Deleted(name) => {
                self.datastore.remove_pod(&name);
            }
        }
    }
}

/// Static pool/model/pod declarations replayed through the reconcilers at
/// startup; the dev and test stand-in for a live watch feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapSeed {
    #[serde(default)]
    pub pool: Option<InferencePool>,
    #[serde(default)]
    pub models: Vec<InferenceModel>,
    #[serde(default)]
    pub pods: Vec<PodInfo>,
}

impl BootstrapSeed {
    /// Load a seed from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let seed: Self = serde_yaml::from_str(&contents)?;
        Ok(seed)
    }

    /// Replay the declarations as watch events. The pool event goes first
    /// and is waited on before pod events, so pod events find the selector
    /// in place; the channels are otherwise unordered between each other.
    pub async fn replay(
        self,
        datastore: &Datastore,
        pool_tx: &mpsc::Sender<WatchEvent<InferencePool>>,
        model_tx: &mpsc::Sender<WatchEvent<InferenceModel>>,
        pod_tx: &mpsc::Sender<WatchEvent<PodInfo>>,
    ) {
        if let Some(pool) = self.pool {
            let _ = pool_tx.send(WatchEvent::Applied(pool)).await;
            if let Err(e) = datastore
                .wait_for_pool(std::time::Duration::from_secs(5))
                .await
            {
                warn!(error = %e, "Seed pool did not land; pod seed entries may be dropped");
            }
        }
        for model in self.models {
            let _ = model_tx.send(WatchEvent::Applied(model)).await;
        }
        for pod in self.pods {
            let _ = pod_tx.send(WatchEvent::Applied(pod)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gate_core::{Criticality, TargetModel};
    use gate_sched::PodMetricsProvider;
    use std::io::Write;

    fn pool(name: &str) -> InferencePool {
        InferencePool {
            name: name.to_string(),
            namespace: "default".to_string(),
            target_port: 8000,
            selector: HashMap::from([("app".to_string(), "vllm".to_string())]),
        }
    }

    fn model(object: &str, model_name: &str, pool_name: &str) -> InferenceModel {
        InferenceModel {
            name: object.to_string(),
            model_name: model_name.to_string(),
            criticality: Some(Criticality::Sheddable),
            target_models: vec![],
            pool_name: pool_name.to_string(),
        }
    }

    fn pod_info(name: &str, ip: &str, ready: bool) -> PodInfo {
        PodInfo {
            name: name.to_string(),
            ip: ip.to_string(),
            labels: HashMap::from([("app".to_string(), "vllm".to_string())]),
            ready,
        }
    }

    #[test]
    fn test_pool_reconciler_filters_by_ref() {
        let datastore = Arc::new(Datastore::new());
        let reconciler = PoolReconciler::new(
            datastore.clone(),
            PoolRef::new("pool", "default"),
        );

        reconciler.apply(WatchEvent::Applied(pool("other")));
        assert!(datastore.get_pool().is_err());

        reconciler.apply(WatchEvent::Applied(pool("pool")));
        assert_eq!(datastore.get_pool().unwrap().name, "pool");

        reconciler.apply(WatchEvent::Deleted("other".to_string()));
        assert!(datastore.get_pool().is_ok());

        reconciler.apply(WatchEvent::Deleted("pool".to_string()));
        assert!(datastore.get_pool().is_err());
    }

    #[test]
    fn test_pool_delete_evicts_pods() {
        let datastore = Arc::new(Datastore::new());
        let pool_rec =
            PoolReconciler::new(datastore.clone(), PoolRef::new("pool", "default"));
        let pod_rec = PodReconciler::new(datastore.clone());

        pool_rec.apply(WatchEvent::Applied(pool("pool")));
        pod_rec.apply(WatchEvent::Applied(pod_info("p1", "10.0.0.1", true)));
        assert_eq!(datastore.list_pods().len(), 1);

        pool_rec.apply(WatchEvent::Deleted("pool".to_string()));
        assert!(datastore.list_pods().is_empty());
    }

    #[test]
    fn test_model_reconciler_validates_and_filters() {
        let datastore = Arc::new(Datastore::new());
        let reconciler = ModelReconciler::new(datastore.clone(), "pool");

        reconciler
            .apply(WatchEvent::Applied(model("m1-obj", "m1", "pool")))
            .unwrap();
        assert!(datastore.fetch_model("m1").is_some());

        // Another pool's model is ignored
        reconciler
            .apply(WatchEvent::Applied(model("m2-obj", "m2", "elsewhere")))
            .unwrap();
        assert!(datastore.fetch_model("m2").is_none());

        // All-zero weights fail validation
        let mut bad = model("m3-obj", "m3", "pool");
        bad.target_models = vec![TargetModel {
            name: "m3-a".to_string(),
            weight: 0,
        }];
        assert!(reconciler.apply(WatchEvent::Applied(bad)).is_err());

        reconciler
            .apply(WatchEvent::Deleted("m1-obj".to_string()))
            .unwrap();
        assert!(datastore.fetch_model("m1").is_none());
    }

    #[test]
    fn test_pod_reconciler_membership() {
        let datastore = Arc::new(Datastore::new());
        datastore.set_pool(pool("pool"));
        let reconciler = PodReconciler::new(datastore.clone());

        reconciler.apply(WatchEvent::Applied(pod_info("p1", "10.0.0.1", true)));
        let pods = datastore.list_pods();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].address, "10.0.0.1:8000");

        // Re-applying the same state is a no-op
        reconciler.apply(WatchEvent::Applied(pod_info("p1", "10.0.0.1", true)));
        assert_eq!(datastore.list_pods().len(), 1);

        // A pod turning not-ready leaves the pool
        reconciler.apply(WatchEvent::Applied(pod_info("p1", "10.0.0.1", false)));
        assert!(datastore.list_pods().is_empty());

        // A pod with non-matching labels never joins
        let mut foreign = pod_info("p2", "10.0.0.2", true);
        foreign.labels = HashMap::from([("app".to_string(), "tgi".to_string())]);
        reconciler.apply(WatchEvent::Applied(foreign));
        assert!(datastore.list_pods().is_empty());

        reconciler.apply(WatchEvent::Applied(pod_info("p3", "10.0.0.3", true)));
        reconciler.apply(WatchEvent::Deleted("p3".to_string()));
        assert!(datastore.list_pods().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_seed_replay() {
        let datastore = Arc::new(Datastore::new());
        let (pool_tx, pool_rx) = mpsc::channel(8);
        let (model_tx, model_rx) = mpsc::channel(8);
        let (pod_tx, pod_rx) = mpsc::channel(8);

        let pool_task = tokio::spawn(
            PoolReconciler::new(datastore.clone(), PoolRef::new("pool", "default")).run(pool_rx),
        );
        let model_task =
            tokio::spawn(ModelReconciler::new(datastore.clone(), "pool").run(model_rx));
        let pod_task = tokio::spawn(PodReconciler::new(datastore.clone()).run(pod_rx));

        let seed = BootstrapSeed {
            pool: Some(pool("pool")),
            models: vec![model("m1-obj", "m1", "pool")],
            pods: vec![pod_info("p1", "10.0.0.1", true)],
        };
        seed.replay(&datastore, &pool_tx, &model_tx, &pod_tx).await;

        // Closing the channels lets the reconcilers drain and exit.
        drop(pool_tx);
        drop(model_tx);
        drop(pod_tx);
        pool_task.await.unwrap();
        model_task.await.unwrap();
        pod_task.await.unwrap();

        assert_eq!(datastore.get_pool().unwrap().name, "pool");
        assert!(datastore.fetch_model("m1").is_some());
        assert_eq!(datastore.all_pod_metrics().len(), 1);
    }

    #[test]
    fn test_seed_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "pool:\n  name: pool\n  namespace: default\n  target_port: 8000\n  selector:\n    app: vllm\nmodels:\n  - name: m1-obj\n    model_name: m1\n    criticality: Critical\n    pool_name: pool\npods:\n  - name: p1\n    ip: 10.0.0.1\n    labels:\n      app: vllm\n"
        )
        .unwrap();

        let seed = BootstrapSeed::from_file(file.path()).unwrap();
        assert_eq!(seed.pool.unwrap().name, "pool");
        assert_eq!(seed.models.len(), 1);
        assert!(seed.models[0].is_critical());
        assert_eq!(seed.pods.len(), 1);
        assert!(seed.pods[0].ready);
    }
}
