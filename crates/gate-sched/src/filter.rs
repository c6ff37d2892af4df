//! Composable filter tree over pod sets
//!
//! A filter node reduces a pod set for a request and routes evaluation to an
//! optional follow-up node depending on the outcome. "Success" means the
//! node produced a non-empty subset without error; on failure the follow-up
//! sees the node's original input, not the empty result. The two-outcome
//! branching lets a policy express "prefer X; if nothing qualifies, fall
//! back to Y".

use gate_core::{Error, LlmRequest, PodMetrics, Result};
use std::sync::Arc;
use tracing::debug;

/// A snapshot subset flowing through the tree.
pub type PodSet = Vec<Arc<PodMetrics>>;

/// Reduces a pod set for a request.
pub type SelectorFn =
    Box<dyn Fn(&LlmRequest, &[Arc<PodMetrics>]) -> Result<PodSet> + Send + Sync>;

/// Qualifies a single pod for a request.
pub type PredicateFn = Box<dyn Fn(&LlmRequest, &PodMetrics) -> bool + Send + Sync>;

enum FilterOp {
    Selector(SelectorFn),
    Predicate(PredicateFn),
}

/// One node of the filter tree.
pub struct Filter {
    name: &'static str,
    op: FilterOp,
    next_on_success: Option<Arc<Filter>>,
    next_on_failure: Option<Arc<Filter>>,
    next_on_success_or_failure: Option<Arc<Filter>>,
}

impl Filter {
    /// A node that reduces the pod set with a selector function.
    pub fn selector(
        name: &'static str,
        f: impl Fn(&LlmRequest, &[Arc<PodMetrics>]) -> Result<PodSet> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            op: FilterOp::Selector(Box::new(f)),
            next_on_success: None,
            next_on_failure: None,
            next_on_success_or_failure: None,
        }
    }

    /// A node that keeps every pod matching a per-pod predicate. It succeeds
    /// iff at least one pod matches.
    pub fn predicate(
        name: &'static str,
        p: impl Fn(&LlmRequest, &PodMetrics) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            op: FilterOp::Predicate(Box::new(p)),
            next_on_success: None,
            next_on_failure: None,
            next_on_success_or_failure: None,
        }
    }

    /// Continue with `next` when this node succeeds.
    pub fn next_on_success(mut self, next: Arc<Filter>) -> Self {
        debug_assert!(self.next_on_success_or_failure.is_none());
        self.next_on_success = Some(next);
        self
    }

    /// Continue with `next` (on the original input) when this node fails.
    pub fn next_on_failure(mut self, next: Arc<Filter>) -> Self {
        debug_assert!(self.next_on_success_or_failure.is_none());
        self.next_on_failure = Some(next);
        self
    }

    /// Continue with `next` on either outcome: with the subset on success,
    /// with the original input on failure. Exclusive with the per-outcome
    /// continuations.
    pub fn next_on_success_or_failure(mut self, next: Arc<Filter>) -> Self {
        debug_assert!(self.next_on_success.is_none() && self.next_on_failure.is_none());
        self.next_on_success_or_failure = Some(next);
        self
    }

    /// Node name, for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Evaluate the tree rooted at this node.
    pub fn evaluate(&self, req: &LlmRequest, pods: &[Arc<PodMetrics>]) -> Result<PodSet> {
        debug!(filter = self.name, candidates = pods.len(), "Running filter");
        match self.apply(req, pods) {
            Ok(filtered) if !filtered.is_empty() => {
                let next = self
                    .next_on_success
                    .as_ref()
                    .or(self.next_on_success_or_failure.as_ref());
                match next {
                    Some(next) => next.evaluate(req, &filtered),
                    None => Ok(filtered),
                }
            }
            outcome => {
                debug!(filter = self.name, "Filter found no qualifying pods");
                let next = self
                    .next_on_failure
                    .as_ref()
                    .or(self.next_on_success_or_failure.as_ref());
                match next {
                    // The fallback sees the original input, not the empty result.
                    Some(next) => next.evaluate(req, pods),
                    None => outcome,
                }
            }
        }
    }

    fn apply(&self, req: &LlmRequest, pods: &[Arc<PodMetrics>]) -> Result<PodSet> {
        match &self.op {
            FilterOp::Selector(f) => f(req, pods),
            FilterOp::Predicate(p) => {
                Ok(pods.iter().filter(|pm| p(req, pm)).cloned().collect())
            }
        }
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter").field("name", &self.name).finish()
    }
}

/// Keep the pods in the lowest waiting-queue band: queue depth no greater
/// than the fleet minimum plus the spread divided by the pod count. With a
/// small spread this degenerates to the pods tied for the minimum.
pub fn least_queuing(_req: &LlmRequest, pods: &[Arc<PodMetrics>]) -> Result<PodSet> {
    if pods.is_empty() {
        return Ok(Vec::new());
    }
    let min = pods
        .iter()
        .map(|p| p.metrics.waiting_queue_size)
        .min()
        .unwrap_or(0);
    let max = pods
        .iter()
        .map(|p| p.metrics.waiting_queue_size)
        .max()
        .unwrap_or(0);
    let band = min + (max - min) / pods.len() as u32;
    Ok(pods
        .iter()
        .filter(|p| p.metrics.waiting_queue_size <= band)
        .cloned()
        .collect())
}

/// Keep the pods in the lowest KV-cache-utilization band, analogous to
/// [`least_queuing`].
pub fn least_kv_cache(_req: &LlmRequest, pods: &[Arc<PodMetrics>]) -> Result<PodSet> {
    if pods.is_empty() {
        return Ok(Vec::new());
    }
    let min = pods
        .iter()
        .map(|p| p.metrics.kv_cache_usage_percent)
        .fold(f64::MAX, f64::min);
    let max = pods
        .iter()
        .map(|p| p.metrics.kv_cache_usage_percent)
        .fold(f64::MIN, f64::max);
    let band = min + (max - min) / pods.len() as f64;
    Ok(pods
        .iter()
        .filter(|p| p.metrics.kv_cache_usage_percent <= band)
        .cloned()
        .collect())
}

/// Pod has the requested adapter already loaded.
pub fn lora_affinity_predicate() -> PredicateFn {
    Box::new(|req, pm| pm.metrics.active_models.contains(&req.resolved_target_model))
}

/// Pod has room to load another adapter.
pub fn can_accept_new_lora_predicate() -> PredicateFn {
    Box::new(|_req, pm| pm.metrics.has_adapter_capacity())
}

/// Pod either has the adapter loaded or has room to load it; serving the
/// request there avoids an eviction.
pub fn low_lora_cost_predicate() -> PredicateFn {
    Box::new(|req, pm| {
        pm.metrics.active_models.contains(&req.resolved_target_model)
            || pm.metrics.has_adapter_capacity()
    })
}

/// Pod is visibly idle enough that adapter affinity may take priority over
/// pure load balancing.
pub fn low_queueing_predicate(queueing_threshold_lora: u32) -> PredicateFn {
    Box::new(move |_req, pm| pm.metrics.waiting_queue_size < queueing_threshold_lora)
}

/// Pod has spare capacity for a sheddable request without impacting
/// critical traffic.
pub fn has_capacity_predicate(queue_threshold: u32, kv_threshold: f64) -> PredicateFn {
    Box::new(move |_req, pm| {
        pm.metrics.waiting_queue_size <= queue_threshold
            && pm.metrics.kv_cache_usage_percent < kv_threshold
    })
}

/// The request is classified critical.
pub fn critical_request_predicate() -> PredicateFn {
    Box::new(|req, _pm| req.critical)
}

/// Terminal drop: every pod is saturated, so the sheddable request is
/// rejected to keep room for critical traffic.
pub fn drop_request(req: &LlmRequest, _pods: &[Arc<PodMetrics>]) -> Result<PodSet> {
    debug!(model = %req.model, "Request dropped");
    Err(Error::resource_exhausted(
        "dropping request due to limited backend resources",
    ))
}
