//! Metric definitions and recording helpers

use crate::{MetricsError, Result};
use prometheus::{
    CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::OnceLock;
use std::time::Instant;

/// Subsystem prefix for per-model request metrics
pub const INFERENCE_MODEL_COMPONENT: &str = "inference_model";

/// Subsystem prefix for pool-aggregate metrics
pub const INFERENCE_POOL_COMPONENT: &str = "inference_pool";

const MODEL_LABELS: &[&str] = &["model_name", "target_model_name"];

/// The full metric set for the endpoint picker.
///
/// Construct with [`InferenceMetrics::new`] and attach to a registry with
/// [`InferenceMetrics::register`], or use [`registered`] for the process-wide
/// instance.
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    request_counter: CounterVec,
    request_latencies: HistogramVec,
    request_sizes: HistogramVec,
    response_sizes: HistogramVec,
    input_tokens: HistogramVec,
    output_tokens: HistogramVec,
    pool_avg_kv_cache: GaugeVec,
    pool_avg_queue_size: GaugeVec,
}

impl InferenceMetrics {
    /// Create the metric set, unregistered.
    pub fn new() -> Result<Self> {
        let request_counter = CounterVec::new(
            Opts::new(
                "request_total",
                "Counter of inference model requests broken out for each model and target model.",
            )
            .subsystem(INFERENCE_MODEL_COMPONENT),
            MODEL_LABELS,
        )
        .map_err(|e| MetricsError::Registry(e.to_string()))?;

        let request_latencies = HistogramVec::new(
            HistogramOpts::new(
                "request_duration_seconds",
                "Inference model response latency distribution in seconds for each model and target model.",
            )
            .subsystem(INFERENCE_MODEL_COMPONENT)
            .buckets(vec![
                0.005, 0.025, 0.05, 0.1, 0.2, 0.4, 0.6, 0.8, 1.0, 1.25, 1.5, 2.0, 3.0, 4.0, 5.0,
                6.0, 8.0, 10.0, 15.0, 20.0, 30.0, 45.0, 60.0, 120.0, 180.0, 240.0, 300.0, 360.0,
                480.0, 600.0, 900.0, 1200.0, 1800.0, 2700.0, 3600.0,
            ]),
            MODEL_LABELS,
        )
        .map_err(|e| MetricsError::Registry(e.to_string()))?;

        let request_sizes = HistogramVec::new(
            HistogramOpts::new(
                "request_sizes",
                "Inference model requests size distribution in bytes for each model and target model.",
            )
            .subsystem(INFERENCE_MODEL_COMPONENT)
            .buckets(vec![
                64.0, 128.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0, 8192.0, 16384.0, 32768.0,
                65536.0, 131072.0, 262144.0, 524288.0, 1048576.0, 2097152.0, 4194304.0, 8388608.0,
                16777216.0, 33554432.0, 67108864.0, 134217728.0, 268435456.0, 536870912.0,
                1073741824.0,
            ]),
            MODEL_LABELS,
        )
        .map_err(|e| MetricsError::Registry(e.to_string()))?;

        let response_sizes = HistogramVec::new(
            HistogramOpts::new(
                "response_sizes",
                "Inference model responses size distribution in bytes for each model and target model.",
            )
            .subsystem(INFERENCE_MODEL_COMPONENT)
            .buckets(vec![
                1.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0, 8192.0,
                16384.0, 32778.0, 65536.0,
            ]),
            MODEL_LABELS,
        )
        .map_err(|e| MetricsError::Registry(e.to_string()))?;

        let input_tokens = HistogramVec::new(
            HistogramOpts::new(
                "input_tokens",
                "Inference model input token count distribution for requests in each model.",
            )
            .subsystem(INFERENCE_MODEL_COMPONENT)
            .buckets(vec![
                1.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0, 8192.0,
                16384.0, 32778.0, 65536.0, 131072.0, 262144.0, 524288.0, 1048576.0,
            ]),
            MODEL_LABELS,
        )
        .map_err(|e| MetricsError::Registry(e.to_string()))?;

        let output_tokens = HistogramVec::new(
            HistogramOpts::new(
                "output_tokens",
                "Inference model output token count distribution for requests in each model.",
            )
            .subsystem(INFERENCE_MODEL_COMPONENT)
            .buckets(vec![
                1.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0, 8192.0,
            ]),
            MODEL_LABELS,
        )
        .map_err(|e| MetricsError::Registry(e.to_string()))?;

        let pool_avg_kv_cache = GaugeVec::new(
            Opts::new(
                "average_kv_cache_utilization",
                "The average kv cache utilization for an inference server pool.",
            )
            .subsystem(INFERENCE_POOL_COMPONENT),
            &["name"],
        )
        .map_err(|e| MetricsError::Registry(e.to_string()))?;

        let pool_avg_queue_size = GaugeVec::new(
            Opts::new(
                "average_queue_size",
                "The average number of requests pending in the model server queue.",
            )
            .subsystem(INFERENCE_POOL_COMPONENT),
            &["name"],
        )
        .map_err(|e| MetricsError::Registry(e.to_string()))?;

        Ok(Self {
            request_counter,
            request_latencies,
            request_sizes,
            response_sizes,
            input_tokens,
            output_tokens,
            pool_avg_kv_cache,
            pool_avg_queue_size,
        })
    }

    /// Register every collector with the given registry.
    pub fn register(&self, registry: &Registry) -> Result<()> {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(self.request_counter.clone()),
            Box::new(self.request_latencies.clone()),
            Box::new(self.request_sizes.clone()),
            Box::new(self.response_sizes.clone()),
            Box::new(self.input_tokens.clone()),
            Box::new(self.output_tokens.clone()),
            Box::new(self.pool_avg_kv_cache.clone()),
            Box::new(self.pool_avg_queue_size.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .map_err(|e| MetricsError::Registry(e.to_string()))?;
        }
        Ok(())
    }

    /// Record one handled request.
    pub fn record_request(&self, model_name: &str, target_model_name: &str) {
        self.request_counter
            .with_label_values(&[model_name, target_model_name])
            .inc();
    }

    /// Record the request body size in bytes.
    pub fn record_request_size(&self, model_name: &str, target_model_name: &str, size: usize) {
        self.request_sizes
            .with_label_values(&[model_name, target_model_name])
            .observe(size as f64);
    }

    /// Record end-to-end request latency.
    ///
    /// Rejects samples where the completion time is not strictly after the
    /// receive time; nothing is observed in that case.
    pub fn record_request_latency(
        &self,
        model_name: &str,
        target_model_name: &str,
        received: Instant,
        complete: Instant,
    ) -> Result<()> {
        let elapsed = complete
            .checked_duration_since(received)
            .filter(|d| !d.is_zero())
            .ok_or_else(|| {
                MetricsError::InvalidSample("request completed at or before receive time".into())
            })?;
        self.request_latencies
            .with_label_values(&[model_name, target_model_name])
            .observe(elapsed.as_secs_f64());
        Ok(())
    }

    /// Record the accumulated response size in bytes.
    pub fn record_response_size(&self, model_name: &str, target_model_name: &str, size: usize) {
        self.response_sizes
            .with_label_values(&[model_name, target_model_name])
            .observe(size as f64);
    }

    /// Record the input token count; zero samples are dropped.
    pub fn record_input_tokens(&self, model_name: &str, target_model_name: &str, count: u64) {
        if count > 0 {
            self.input_tokens
                .with_label_values(&[model_name, target_model_name])
                .observe(count as f64);
        }
    }

    /// Record the output token count; zero samples are dropped.
    pub fn record_output_tokens(&self, model_name: &str, target_model_name: &str, count: u64) {
        if count > 0 {
            self.output_tokens
                .with_label_values(&[model_name, target_model_name])
                .observe(count as f64);
        }
    }

    /// Publish the pool-wide average KV-cache utilization.
    pub fn record_pool_avg_kv_cache(&self, pool_name: &str, utilization: f64) {
        self.pool_avg_kv_cache
            .with_label_values(&[pool_name])
            .set(utilization);
    }

    /// Publish the pool-wide average queue depth.
    pub fn record_pool_avg_queue_size(&self, pool_name: &str, queue_size: f64) {
        self.pool_avg_queue_size
            .with_label_values(&[pool_name])
            .set(queue_size);
    }
}

static REGISTERED: OnceLock<InferenceMetrics> = OnceLock::new();

/// The process-wide metric set, registered against the default Prometheus
/// registry exactly once. Subsequent calls return the same instance.
pub fn registered() -> &'static InferenceMetrics {
    REGISTERED.get_or_init(|| {
        let metrics = InferenceMetrics::new().expect("metric definitions are valid");
        metrics
            .register(prometheus::default_registry())
            .expect("default registry accepts the metric set once");
        metrics
    })
}
