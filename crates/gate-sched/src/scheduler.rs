//! The concrete scheduling policy and entry point

use crate::filter::{
    can_accept_new_lora_predicate, critical_request_predicate, drop_request,
    has_capacity_predicate, least_kv_cache, least_queuing, lora_affinity_predicate,
    low_lora_cost_predicate, low_queueing_predicate, Filter,
};
use gate_core::{Error, LlmRequest, Pod, PodMetrics, Result, SchedulerConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Source of the current fleet snapshot.
pub trait PodMetricsProvider: Send + Sync {
    /// A coherent snapshot of every member pod with its latest telemetry.
    fn all_pod_metrics(&self) -> Vec<Arc<PodMetrics>>;
}

/// Picks one pod per request by walking the policy tree over the live fleet.
pub struct Scheduler {
    provider: Arc<dyn PodMetricsProvider>,
    root: Arc<Filter>,
    rng: Mutex<StdRng>,
}

impl Scheduler {
    /// Create a scheduler with an entropy-seeded tie-break source.
    pub fn new(provider: Arc<dyn PodMetricsProvider>, config: SchedulerConfig) -> Self {
        Self::with_rng(provider, config, StdRng::from_entropy())
    }

    /// Create a scheduler with an injected random source, for deterministic
    /// tests.
    pub fn with_rng(
        provider: Arc<dyn PodMetricsProvider>,
        config: SchedulerConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            provider,
            root: build_policy_tree(&config),
            rng: Mutex::new(rng),
        }
    }

    /// Find the target pod for a request based on current fleet telemetry.
    pub fn schedule(&self, req: &LlmRequest) -> Result<Pod> {
        let pods = self.provider.all_pod_metrics();
        debug!(
            model = %req.model,
            target_model = %req.resolved_target_model,
            critical = req.critical,
            candidates = pods.len(),
            "Scheduling a request"
        );

        let candidates = self.root.evaluate(req, &pods)?;
        if candidates.is_empty() {
            return Err(Error::internal("filter returned zero pods on success"));
        }

        // Intentional randomness across tied candidates to spread load.
        let index = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..candidates.len());
        let chosen = &candidates[index];
        debug!(pod = %chosen.pod, "Selected target pod");
        Ok(chosen.pod.clone())
    }
}

/// Build the policy tree.
///
/// Root splits on criticality: critical requests descend the low-latency
/// branch, everything else must pass admission control or be dropped.
fn build_policy_tree(config: &SchedulerConfig) -> Arc<Filter> {
    // least queue -> least KV cache
    let queue_and_kv = Arc::new(
        Filter::selector("least queuing", least_queuing).next_on_success_or_failure(Arc::new(
            Filter::selector("least KV cache percent", least_kv_cache),
        )),
    );

    // least queue -> low cost LoRA -> least KV cache
    let queue_lora_and_kv = Arc::new(
        Filter::selector("least queuing", least_queuing).next_on_success_or_failure(Arc::new(
            Filter::predicate("low cost LoRA", low_lora_cost_predicate())
                .next_on_success_or_failure(Arc::new(Filter::selector(
                    "least KV cache percent",
                    least_kv_cache,
                ))),
        )),
    );

    let low_latency = Arc::new(
        Filter::predicate(
            "low queueing filter",
            low_queueing_predicate(config.queueing_threshold_lora),
        )
        .next_on_success(Arc::new(
            Filter::predicate("affinity LoRA", lora_affinity_predicate())
                .next_on_success(queue_and_kv.clone())
                .next_on_failure(Arc::new(
                    Filter::predicate("can accept LoRA Adapter", can_accept_new_lora_predicate())
                        .next_on_success_or_failure(queue_and_kv),
                )),
        ))
        .next_on_failure(queue_lora_and_kv.clone()),
    );

    // When no pod has both a quiet queue and KV headroom, the sheddable
    // request is dropped to make room for critical traffic.
    let sheddable = Arc::new(
        Filter::predicate(
            "has capacity for sheddable requests",
            has_capacity_predicate(config.queue_threshold_critical, config.kv_cache_threshold),
        )
        .next_on_success(queue_lora_and_kv)
        .next_on_failure(Arc::new(Filter::selector("drop request", drop_request))),
    );

    Arc::new(
        Filter::predicate("critical request", critical_request_predicate())
            .next_on_success(low_latency)
            .next_on_failure(sheddable),
    )
}
