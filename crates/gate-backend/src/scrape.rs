//! Pod metrics scraping and Prometheus text-format parsing

use async_trait::async_trait;
use chrono::Utc;
use gate_core::{Error, Metrics, Pod, Result};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Gauge family carrying the server's waiting-queue depth.
pub const WAITING_QUEUE_SIZE_METRIC: &str = "vllm:num_requests_waiting";

/// Gauge family carrying the KV-cache utilization fraction.
pub const KV_CACHE_USAGE_METRIC: &str = "vllm:gpu_cache_usage_perc";

/// Info family describing loaded LoRA adapters; the sample value is a
/// timestamp, so the greatest sample wins when several are exposed.
pub const LORA_INFO_METRIC: &str = "vllm:lora_requests_info";

const LORA_RUNNING_ADAPTERS_LABEL: &str = "running_lora_adapters";
const LORA_MAX_ADAPTERS_LABEL: &str = "max_lora";

/// Fetches one pod's telemetry.
#[async_trait]
pub trait PodMetricsClient: Send + Sync {
    async fn fetch_metrics(&self, pod: &Pod) -> Result<Metrics>;
}

/// HTTP client scraping `http://<pod.address>/metrics`.
#[derive(Debug, Clone)]
pub struct HttpMetricsClient {
    client: reqwest::Client,
}

impl HttpMetricsClient {
    /// Build a client with a per-request timeout. The timeout bounds one
    /// scrape so a stuck pod cannot stall the ticker for the others.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build scrape client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PodMetricsClient for HttpMetricsClient {
    async fn fetch_metrics(&self, pod: &Pod) -> Result<Metrics> {
        let url = format!("http://{}/metrics", pod.address);
        debug!(pod = %pod, url = %url, "Scraping pod metrics");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::network(format!("scrape of {} failed: {e}", pod.address)))?;

        if !response.status().is_success() {
            return Err(Error::scrape(format!(
                "scrape of {} returned {}",
                pod.address,
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::scrape(format!("reading scrape body from {}: {e}", pod.address)))?;

        parse_metrics(&body)
    }
}

/// One parsed sample line.
struct Sample {
    name: String,
    labels: HashMap<String, String>,
    value: f64,
}

/// Parse the known metric families out of a Prometheus text-format page.
/// Families that are absent default to zero/empty.
pub fn parse_metrics(text: &str) -> Result<Metrics> {
    let mut metrics = Metrics {
        updated_at: Utc::now(),
        ..Metrics::default()
    };
    let mut best_lora: Option<Sample> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(sample) = parse_sample(line) else {
            continue;
        };
        match sample.name.as_str() {
            WAITING_QUEUE_SIZE_METRIC => {
                metrics.waiting_queue_size = sample.value.max(0.0) as u32;
            }
            KV_CACHE_USAGE_METRIC => {
                metrics.kv_cache_usage_percent = sample.value;
            }
            LORA_INFO_METRIC => {
                if best_lora.as_ref().map_or(true, |b| sample.value > b.value) {
                    best_lora = Some(sample);
                }
            }
            _ => {}
        }
    }

    if let Some(lora) = best_lora {
        if let Some(adapters) = lora.labels.get(LORA_RUNNING_ADAPTERS_LABEL) {
            metrics.active_models = adapters
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(max) = lora.labels.get(LORA_MAX_ADAPTERS_LABEL) {
            metrics.max_active_models = max.parse().unwrap_or(0);
        }
    }

    Ok(metrics)
}

/// Parse a `name{label="value",...} value [timestamp]` line. Returns `None`
/// for lines that do not look like samples.
fn parse_sample(line: &str) -> Option<Sample> {
    let (name_and_labels, rest) = match line.find('{') {
        Some(brace) => {
            let close = line.rfind('}')?;
            (
                (&line[..brace], parse_labels(&line[brace + 1..close])?),
                &line[close + 1..],
            )
        }
        None => {
            let space = line.find(char::is_whitespace)?;
            ((&line[..space], HashMap::new()), &line[space..])
        }
    };
    let value: f64 = rest.split_whitespace().next()?.parse().ok()?;
    Some(Sample {
        name: name_and_labels.0.trim().to_string(),
        labels: name_and_labels.1,
        value,
    })
}

/// Quote-aware label parsing; label values may themselves contain commas
/// (the adapter list does).
fn parse_labels(text: &str) -> Option<HashMap<String, String>> {
    let mut labels = HashMap::new();
    let mut chars = text.chars().peekable();

    loop {
        // Skip separators and trailing whitespace
        while matches!(chars.peek(), Some(',') | Some(' ')) {
            chars.next();
        }
        if chars.peek().is_none() {
            return Some(labels);
        }

        let mut key = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            key.push(c);
        }
        if chars.next()? != '"' {
            return None;
        }

        let mut value = String::new();
        let mut escaped = false;
        loop {
            let c = chars.next()?;
            if escaped {
                value.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                break;
            } else {
                value.push(c);
            }
        }
        labels.insert(key.trim().to_string(), value);
    }
}
