//! Prometheus text-format exporter endpoint

use crate::{MetricsError, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Serves a Prometheus registry over HTTP.
#[derive(Debug, Clone)]
pub struct MetricsExporter {
    registry: Registry,
    bind_addr: SocketAddr,
}

impl MetricsExporter {
    /// Create an exporter for the given registry.
    pub fn new(registry: Registry, bind_addr: SocketAddr) -> Self {
        Self {
            registry,
            bind_addr,
        }
    }

    /// Create an exporter for the process default registry.
    pub fn for_default_registry(bind_addr: SocketAddr) -> Self {
        Self::new(prometheus::default_registry().clone(), bind_addr)
    }

    /// Bind and serve until the provided shutdown future resolves.
    pub async fn serve(self, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> Result<()> {
        let app = create_metrics_app(self.registry.clone());
        let listener = TcpListener::bind(self.bind_addr).await?;

        info!("Serving metrics on http://{}/metrics", self.bind_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| MetricsError::Export(format!("metrics server failed: {e}")))
    }

    /// Export metrics as Prometheus text format.
    pub fn export_metrics(&self) -> Result<String> {
        encode_registry(&self.registry)
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| MetricsError::Export(format!("Failed to encode metrics: {e}")))?;

    String::from_utf8(buffer)
        .map_err(|e| MetricsError::Export(format!("Failed to convert metrics to string: {e}")))
}

fn create_metrics_app(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(registry)
}

async fn metrics_handler(State(registry): State<Registry>) -> Response {
    match encode_registry(&registry) {
        Ok(text) => (
            StatusCode::OK,
            [("content-type", TextEncoder::new().format_type())],
            text,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to encode Prometheus metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

async fn health_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Counter;

    #[test]
    fn test_export_contains_registered_metric() {
        let registry = Registry::new();
        let counter = Counter::new("test_counter", "A test counter").unwrap();
        counter.inc();
        registry.register(Box::new(counter)).unwrap();

        let exporter = MetricsExporter::new(registry, "127.0.0.1:0".parse().unwrap());
        let text = exporter.export_metrics().unwrap();
        assert!(text.contains("test_counter"));
        assert!(text.contains('1'));
    }

    #[tokio::test]
    async fn test_serve_and_shutdown() {
        let registry = Registry::new();
        let exporter = MetricsExporter::new(registry, "127.0.0.1:0".parse().unwrap());

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(exporter.serve(async {
            let _ = rx.await;
        }));

        // Give the listener a moment, then shut down.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let _ = tx.send(());
        handle.await.unwrap().unwrap();
    }
}
