//! Main binary for the infergate endpoint-picker daemon (gated)

use clap::Parser;
use gate_core::RunnerConfig;
use gate_extproc::ServerRunner;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gated")]
#[command(about = "External-processor endpoint picker for LLM inference gateways")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path (YAML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// ext-proc gRPC listen port
    #[arg(long)]
    grpc_port: Option<u16>,

    /// Header and metadata key carrying the chosen endpoint
    #[arg(long)]
    target_endpoint_key: Option<String>,

    /// Name of the InferencePool to bind (required here or in the config file)
    #[arg(long)]
    pool_name: Option<String>,

    /// Namespace of the pool
    #[arg(long)]
    pool_namespace: Option<String>,

    /// Pod-membership reconciliation cadence (e.g. 10s)
    #[arg(long, value_parser = humantime::parse_duration)]
    refresh_pods_interval: Option<Duration>,

    /// Per-pod metrics scrape cadence (e.g. 50ms)
    #[arg(long, value_parser = humantime::parse_duration)]
    refresh_metrics_interval: Option<Duration>,

    /// Pool-gauge refresh cadence (e.g. 5s)
    #[arg(long, value_parser = humantime::parse_duration)]
    refresh_prometheus_metrics_interval: Option<Duration>,

    /// Serve the ext-proc endpoint over TLS
    #[arg(long)]
    secure_serving: Option<bool>,

    /// Directory containing tls.crt and tls.key
    #[arg(long, value_name = "DIR")]
    cert_path: Option<PathBuf>,

    /// Prometheus exporter listen port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Seed file replayed through the reconcilers at startup
    #[arg(long, value_name = "FILE")]
    bootstrap: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> gate_core::Result<RunnerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                RunnerConfig::from_file(path)?
            }
            None => RunnerConfig::default(),
        };

        if let Some(port) = self.grpc_port {
            config.grpc_port = port;
        }
        if let Some(key) = self.target_endpoint_key {
            config.target_endpoint_key = key;
        }
        if let Some(name) = self.pool_name {
            config.pool_name = name;
        }
        if let Some(namespace) = self.pool_namespace {
            config.pool_namespace = namespace;
        }
        if let Some(interval) = self.refresh_pods_interval {
            config.refresh_pods_interval = interval;
        }
        if let Some(interval) = self.refresh_metrics_interval {
            config.refresh_metrics_interval = interval;
        }
        if let Some(interval) = self.refresh_prometheus_metrics_interval {
            config.refresh_prometheus_metrics_interval = interval;
        }
        if let Some(secure) = self.secure_serving {
            config.secure_serving = secure;
        }
        if let Some(path) = self.cert_path {
            config.cert_path = Some(path);
        }
        if let Some(port) = self.metrics_port {
            config.metrics_port = port;
        }
        if let Some(path) = self.bootstrap {
            config.bootstrap = Some(path);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let runner = ServerRunner::new(config);
    if let Err(e) = runner.run(shutdown_signal()).await {
        error!("Endpoint picker failed: {}", e);
        std::process::exit(1);
    }
}

/// Resolves on ctrl-c or, on unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C signal"),
            _ = term.recv() => info!("Received termination signal"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C signal");
    }
}
