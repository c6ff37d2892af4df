//! Background provider keeping pod telemetry and pool gauges fresh
//!
//! Each member pod gets its own scrape loop, created when the pod joins and
//! torn down when it departs. A coarser membership tick reconciles the loop
//! table against the datastore (cheap, because reconcilers also push
//! updates), and a third task publishes pool-wide gauge averages.

use crate::datastore::Datastore;
use crate::scrape::PodMetricsClient;
use dashmap::DashMap;
use gate_core::Pod;
use gate_sched::PodMetricsProvider;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Periodic tasks feeding the datastore.
pub struct Provider {
    datastore: Arc<Datastore>,
    client: Arc<dyn PodMetricsClient>,
    scrapers: DashMap<String, Scraper>,
}

/// One pod's scrape loop.
struct Scraper {
    pod: Pod,
    task: JoinHandle<()>,
}

/// Handle to the provider's running tasks.
pub struct ProviderHandle {
    provider: Arc<Provider>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProviderHandle {
    /// Signal the periodic tasks to stop, wait for them, and tear down the
    /// per-pod scrape loops.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        self.provider.scrapers.retain(|_, scraper| {
            scraper.task.abort();
            false
        });
    }
}

impl Provider {
    pub fn new(datastore: Arc<Datastore>, client: Arc<dyn PodMetricsClient>) -> Arc<Self> {
        Arc::new(Self {
            datastore,
            client,
            scrapers: DashMap::new(),
        })
    }

    /// Reconcile scrape loops once, then spawn the periodic tasks.
    pub async fn start(
        self: &Arc<Self>,
        refresh_pods_interval: Duration,
        refresh_metrics_interval: Duration,
        refresh_prometheus_interval: Duration,
    ) -> ProviderHandle {
        self.refresh_scrapers(refresh_metrics_interval);
        info!(pods = self.scrapers.len(), "Provider initialized");

        let (shutdown_tx, _) = watch::channel(false);

        let membership = {
            let provider = Arc::clone(self);
            let mut shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(refresh_pods_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            provider.datastore.sync_metrics_membership();
                            provider.refresh_scrapers(refresh_metrics_interval);
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let gauges = {
            let provider = Arc::clone(self);
            let mut shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(refresh_prometheus_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => provider.flush_pool_gauges(),
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        ProviderHandle {
            provider: Arc::clone(self),
            shutdown_tx,
            tasks: vec![membership, gauges],
        }
    }

    /// Compare current membership to the scrape-loop table: start loops for
    /// newcomers (and for pods whose address changed), stop loops for
    /// departed pods.
    fn refresh_scrapers(self: &Arc<Self>, interval: Duration) {
        let pods = self.datastore.list_pods();

        for pod in &pods {
            let stale = self
                .scrapers
                .get(&pod.name)
                .map(|s| s.pod != *pod)
                .unwrap_or(true);
            if stale {
                if let Some((_, old)) = self.scrapers.remove(&pod.name) {
                    old.task.abort();
                }
                self.scrapers.insert(
                    pod.name.clone(),
                    Scraper {
                        pod: pod.clone(),
                        task: self.spawn_scrape_loop(pod.clone(), interval),
                    },
                );
            }
        }

        self.scrapers.retain(|name, scraper| {
            let keep = pods.iter().any(|p| &p.name == name);
            if !keep {
                debug!(pod = name, "Stopping scrape loop for departed pod");
                scraper.task.abort();
            }
            keep
        });
    }

    /// One pod's loop: fetch, publish, repeat. The fetch is bounded by the
    /// scrape interval so a stuck pod only stalls itself. Errors keep the
    /// previous record; membership events alone remove a pod.
    fn spawn_scrape_loop(self: &Arc<Self>, pod: Pod, interval: Duration) -> JoinHandle<()> {
        let datastore = Arc::clone(&self.datastore);
        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match tokio::time::timeout(interval, client.fetch_metrics(&pod)).await {
                    Ok(Ok(metrics)) => datastore.update_pod_metrics(&pod.name, metrics),
                    Ok(Err(e)) => {
                        warn!(pod = %pod, error = %e, "Scrape failed; keeping previous metrics")
                    }
                    Err(_) => {
                        warn!(pod = %pod, "Scrape timed out; keeping previous metrics")
                    }
                }
            }
        })
    }

    /// Publish pool-wide averages of KV-cache utilization and queue depth.
    fn flush_pool_gauges(&self) {
        let Ok(pool) = self.datastore.get_pool() else {
            debug!("Skipping pool gauges; pool not yet known");
            return;
        };
        let snapshot = self.datastore.all_pod_metrics();
        if snapshot.is_empty() {
            return;
        }

        let count = snapshot.len() as f64;
        let kv_avg = snapshot
            .iter()
            .map(|p| p.metrics.kv_cache_usage_percent)
            .sum::<f64>()
            / count;
        let queue_avg = snapshot
            .iter()
            .map(|p| f64::from(p.metrics.waiting_queue_size))
            .sum::<f64>()
            / count;

        let metrics = gate_metrics::registered();
        metrics.record_pool_avg_kv_cache(&pool.name, kv_avg);
        metrics.record_pool_avg_queue_size(&pool.name, queue_avg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gate_core::{Error, Metrics, Result};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeClient {
        failing: AtomicBool,
        queue_sizes: HashMap<String, u32>,
    }

    #[async_trait]
    impl PodMetricsClient for FakeClient {
        async fn fetch_metrics(&self, pod: &Pod) -> Result<Metrics> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::network("connection refused"));
            }
            Ok(Metrics {
                waiting_queue_size: *self.queue_sizes.get(&pod.name).unwrap_or(&0),
                ..Metrics::default()
            })
        }
    }

    fn fixture(queues: &[(&str, u32)]) -> (Arc<Datastore>, Arc<Provider>, Arc<FakeClient>) {
        let datastore = Arc::new(Datastore::new());
        for (name, _) in queues {
            datastore.add_or_update_pod(Pod::new(*name, "10.0.0.1:8000"));
        }
        let client = Arc::new(FakeClient {
            failing: AtomicBool::new(false),
            queue_sizes: queues
                .iter()
                .map(|(name, q)| (name.to_string(), *q))
                .collect(),
        });
        let provider = Provider::new(datastore.clone(), client.clone());
        (datastore, provider, client)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_scrape_loops_publish_metrics() {
        let (datastore, provider, _client) = fixture(&[("p1", 4), ("p2", 9)]);
        let handle = provider
            .start(
                Duration::from_millis(500),
                Duration::from_millis(10),
                Duration::from_millis(500),
            )
            .await;
        settle().await;

        let mut queues: Vec<u32> = datastore
            .all_pod_metrics()
            .iter()
            .map(|p| p.metrics.waiting_queue_size)
            .collect();
        queues.sort_unstable();
        assert_eq!(queues, vec![4, 9]);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_failed_scrape_retains_previous_metrics() {
        let (datastore, provider, client) = fixture(&[("p1", 4)]);
        let handle = provider
            .start(
                Duration::from_millis(500),
                Duration::from_millis(10),
                Duration::from_millis(500),
            )
            .await;
        settle().await;
        assert_eq!(datastore.all_pod_metrics()[0].metrics.waiting_queue_size, 4);

        client.failing.store(true, Ordering::SeqCst);
        settle().await;

        let snapshot = datastore.all_pod_metrics();
        assert_eq!(snapshot.len(), 1, "failure must not evict the pod");
        assert_eq!(snapshot[0].metrics.waiting_queue_size, 4);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_departed_pod_loses_its_scrape_loop() {
        let (datastore, provider, _client) = fixture(&[("p1", 4), ("p2", 9)]);
        let handle = provider
            .start(
                Duration::from_millis(10),
                Duration::from_millis(10),
                Duration::from_millis(500),
            )
            .await;
        settle().await;
        assert_eq!(provider.scrapers.len(), 2);

        datastore.remove_pod("p2");
        settle().await;
        assert_eq!(provider.scrapers.len(), 1);
        assert_eq!(datastore.all_pod_metrics().len(), 1);

        // A newcomer gets a loop on the next membership tick
        datastore.add_or_update_pod(Pod::new("p3", "10.0.0.3:8000"));
        settle().await;
        assert_eq!(provider.scrapers.len(), 2);

        handle.stop().await;
    }
}
