//! Server runner: wires the data plane, scheduler, and gRPC server

use crate::handler::ExtProcService;
use crate::tls;
use gate_backend::{
    BootstrapSeed, Datastore, HttpMetricsClient, ModelReconciler, PodInfo, PodReconciler,
    PoolReconciler, Provider, WatchEvent,
};
use gate_core::{Error, InferenceModel, InferencePool, PoolRef, Result, RunnerConfig};
use gate_metrics::MetricsExporter;
use gate_proto::ExternalProcessorServer;
use gate_sched::Scheduler;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tonic::transport::{Server, ServerTlsConfig};
use tracing::{info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Senders feeding the control-plane reconcilers. A live watch client (or
/// the bootstrap seed) pushes notifications through these.
#[derive(Clone)]
pub struct ControlPlaneChannels {
    pub pool: mpsc::Sender<WatchEvent<InferencePool>>,
    pub model: mpsc::Sender<WatchEvent<InferenceModel>>,
    pub pod: mpsc::Sender<WatchEvent<PodInfo>>,
}

/// Owns the process wiring: datastore, reconcilers, provider, scheduler,
/// metrics exporter, and the ext-proc gRPC server.
pub struct ServerRunner {
    config: RunnerConfig,
    datastore: Arc<Datastore>,
    channels: ControlPlaneChannels,
    pool_rx: mpsc::Receiver<WatchEvent<InferencePool>>,
    model_rx: mpsc::Receiver<WatchEvent<InferenceModel>>,
    pod_rx: mpsc::Receiver<WatchEvent<PodInfo>>,
}

impl ServerRunner {
    pub fn new(config: RunnerConfig) -> Self {
        let (pool_tx, pool_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (model_tx, model_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (pod_tx, pod_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            datastore: Arc::new(Datastore::new()),
            channels: ControlPlaneChannels {
                pool: pool_tx,
                model: model_tx,
                pod: pod_tx,
            },
            pool_rx,
            model_rx,
            pod_rx,
        }
    }

    /// The event channels a watch client feeds.
    pub fn channels(&self) -> ControlPlaneChannels {
        self.channels.clone()
    }

    /// The shared datastore, mostly useful to tests.
    pub fn datastore(&self) -> Arc<Datastore> {
        Arc::clone(&self.datastore)
    }

    /// Run until the shutdown future resolves. Startup errors (invalid
    /// config, bind failure, certificate problems, missing pool binding)
    /// surface here so the binary can exit non-zero.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        self.config.validate()?;
        gate_metrics::registered();

        let (shutdown_tx, _) = watch::channel(false);
        {
            let trigger = shutdown_tx.clone();
            tokio::spawn(async move {
                shutdown.await;
                let _ = trigger.send(true);
            });
        }

        let pool_ref = PoolRef::new(
            self.config.pool_name.clone(),
            self.config.pool_namespace.clone(),
        );
        info!(pool = %pool_ref, port = self.config.grpc_port, "Starting endpoint picker");

        // Reconcilers drain their channels until every sender is dropped.
        tokio::spawn(
            PoolReconciler::new(self.datastore.clone(), pool_ref).run(self.pool_rx),
        );
        tokio::spawn(
            ModelReconciler::new(self.datastore.clone(), self.config.pool_name.clone())
                .run(self.model_rx),
        );
        tokio::spawn(PodReconciler::new(self.datastore.clone()).run(self.pod_rx));

        if let Some(path) = &self.config.bootstrap {
            info!(seed = %path.display(), "Replaying bootstrap seed");
            BootstrapSeed::from_file(path)?
                .replay(
                    &self.datastore,
                    &self.channels.pool,
                    &self.channels.model,
                    &self.channels.pod,
                )
                .await;
        }

        // Without a pool binding there is nothing to schedule onto.
        self.datastore
            .wait_for_pool(self.config.pool_ready_timeout)
            .await?;

        let client = HttpMetricsClient::new(self.config.refresh_metrics_interval)?;
        let provider = Provider::new(self.datastore.clone(), Arc::new(client));
        let provider_handle = provider
            .start(
                self.config.refresh_pods_interval,
                self.config.refresh_metrics_interval,
                self.config.refresh_prometheus_metrics_interval,
            )
            .await;

        let scheduler = Arc::new(Scheduler::new(
            self.datastore.clone(),
            self.config.scheduler.clone(),
        ));
        let service = ExtProcService::new(
            self.datastore.clone(),
            scheduler,
            self.config.target_endpoint_key.clone(),
        );

        let metrics_addr: SocketAddr = ([0, 0, 0, 0], self.config.metrics_port).into();
        {
            let exporter = MetricsExporter::for_default_registry(metrics_addr);
            let stop = wait_for_signal(shutdown_tx.subscribe());
            tokio::spawn(async move {
                if let Err(e) = exporter.serve(stop).await {
                    warn!(error = %e, "Metrics exporter stopped");
                }
            });
        }

        let grpc_addr: SocketAddr = ([0, 0, 0, 0], self.config.grpc_port).into();
        let mut builder = Server::builder();
        if self.config.secure_serving {
            let identity = tls::server_identity(self.config.cert_path.as_deref())?;
            builder = builder
                .tls_config(ServerTlsConfig::new().identity(identity))
                .map_err(|e| Error::certificate(format!("invalid TLS configuration: {e}")))?;
        }

        info!(addr = %grpc_addr, tls = self.config.secure_serving, "Serving ext-proc");
        let serve_result = builder
            .add_service(ExternalProcessorServer::new(service))
            .serve_with_shutdown(grpc_addr, wait_for_signal(shutdown_tx.subscribe()))
            .await;

        provider_handle.stop().await;
        serve_result.map_err(|e| Error::network(format!("ext-proc server failed: {e}")))?;

        info!("Endpoint picker stopped");
        Ok(())
    }
}

async fn wait_for_signal(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}
