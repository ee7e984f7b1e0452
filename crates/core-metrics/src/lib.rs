//! Per-tick metrics fan-out: Prometheus gauges/counters plus a structured
//! snapshot pushed to any registered [`MetricsSink`]. Naming follows the
//! same free-function-over-the-`metrics`-macros style and `_total`/prefix
//! conventions this workspace's metrics wrappers use, just with a
//! `core_*` prefix per crate instead of `fc_*`.

pub mod record;

use chrono::{DateTime, Utc};
use core_common::{CancelToken, HealthStatus, QueueMetrics};
use core_net::{HttpClientPoolManager, PoolMetrics};
use core_queue::EventQueue;
use core_registry::{HealthChangeObserver, InstanceRegistry, InstanceSnapshot};
use core_scale::ScaleDecision;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Installs the process-wide Prometheus recorder. Call once at startup;
/// the returned handle renders the exposition-format text for `/metrics`.
pub fn install_prometheus_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("prometheus recorder installs exactly once per process")
}

/// One tick's worth of published state, handed to every [`MetricsSink`].
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub queue: QueueMetrics,
    pub pools: Vec<PoolMetrics>,
    pub instances: Vec<InstanceSnapshot>,
    pub scaling: Option<ScaleDecisionRecord>,
    pub timestamp: DateTime<Utc>,
}

/// A JSON-friendly projection of [`ScaleDecision`] (the source enum has no
/// `Serialize` impl because it carries a `&'static str` variant).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleDecisionRecord {
    pub kind: &'static str,
    pub count: u32,
    pub reason: String,
}

impl From<&ScaleDecision> for ScaleDecisionRecord {
    fn from(decision: &ScaleDecision) -> Self {
        match decision {
            ScaleDecision::ScaleUp { count, reason } => {
                ScaleDecisionRecord { kind: "scale_up", count: *count, reason: reason.clone() }
            }
            ScaleDecision::ScaleDown { count, reason } => {
                ScaleDecisionRecord { kind: "scale_down", count: *count, reason: reason.clone() }
            }
            ScaleDecision::None { reason } => ScaleDecisionRecord { kind: "none", count: 0, reason: reason.to_string() },
        }
    }
}

/// Receives a [`MetricsSnapshot`] after every tick. Implementations must
/// not block; this is a synchronous fan-out, same contract as the queue's
/// and registry's observer callbacks.
pub trait MetricsSink: Send + Sync {
    fn publish(&self, snapshot: &MetricsSnapshot);
}

pub struct MetricsCollector {
    queue: Arc<EventQueue>,
    pool_manager: Arc<HttpClientPoolManager>,
    registry: Arc<InstanceRegistry>,
    last_scale_decision: Mutex<Option<ScaleDecisionRecord>>,
    sinks: Mutex<Vec<Arc<dyn MetricsSink>>>,
}

impl MetricsCollector {
    pub fn new(queue: Arc<EventQueue>, pool_manager: Arc<HttpClientPoolManager>, registry: Arc<InstanceRegistry>) -> Self {
        Self {
            queue,
            pool_manager,
            registry,
            last_scale_decision: Mutex::new(None),
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn register_sink(&self, sink: Arc<dyn MetricsSink>) {
        self.sinks.lock().push(sink);
    }

    /// Records a scaling decision both to Prometheus and for inclusion in
    /// the next tick's snapshot. Called by whatever drives the autoscaler's
    /// own evaluation loop, not by this collector's ticker.
    pub fn record_scale_decision(&self, decision: &ScaleDecision) {
        let record = ScaleDecisionRecord::from(decision);
        record::record_scale_decision(record.kind, record.count, &record.reason);
        *self.last_scale_decision.lock() = Some(record);
    }

    /// Gathers current queue, pool, and per-instance metrics, publishes
    /// them to Prometheus, fans the combined snapshot out to every sink,
    /// and returns it.
    pub fn tick(&self) -> MetricsSnapshot {
        let queue_metrics = self.queue.metrics();
        record::set_queue_metrics(&queue_metrics);

        let pool_metrics = self.pool_manager.all_metrics();
        for pool in &pool_metrics {
            record::set_pool_metrics(pool);
        }

        let instances: Vec<InstanceSnapshot> = self.registry.list().iter().map(|i| i.snapshot()).collect();
        for instance in &instances {
            record::set_instance_metrics(&instance.id, &instance.metrics);
        }

        let snapshot = MetricsSnapshot {
            queue: queue_metrics,
            pools: pool_metrics,
            instances,
            scaling: self.last_scale_decision.lock().clone(),
            timestamp: Utc::now(),
        };

        for sink in self.sinks.lock().iter() {
            sink.publish(&snapshot);
        }

        snapshot
    }

    /// Runs `tick` on a fixed interval until `cancel` is signalled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancelToken) {
        let mut ticker = tokio::time::interval(interval);
        info!(?interval, "metrics collector started");
        loop {
            tokio::select! {
                _ = ticker.tick() => { self.tick(); }
                _ = cancel.cancelled() => {
                    info!("metrics collector stopping");
                    break;
                }
            }
        }
    }
}

/// Registered with the registry's health-change fan-out (alongside the
/// autoscaler) so every transition is exported, not just the state a
/// later `tick()` happens to sample.
impl HealthChangeObserver for MetricsCollector {
    fn on_health_changed(&self, instance_id: &str, old: HealthStatus, new: HealthStatus) {
        record::record_health_transition(instance_id, &format!("{old:?}"), &format!("{new:?}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_config::{HttpPoolConfig, QueueConfig};

    fn collector() -> MetricsCollector {
        let queue = Arc::new(EventQueue::new(QueueConfig::default()));
        let pool_manager = Arc::new(HttpClientPoolManager::new(HttpPoolConfig::default()));
        let registry = Arc::new(InstanceRegistry::new());
        MetricsCollector::new(queue, pool_manager, registry)
    }

    struct RecordingSink(Mutex<Vec<MetricsSnapshot>>);
    impl MetricsSink for RecordingSink {
        fn publish(&self, snapshot: &MetricsSnapshot) {
            self.0.lock().push(snapshot.clone());
        }
    }

    #[test]
    fn tick_reports_current_queue_size() {
        use bytes::Bytes;
        use core_common::{Event, Priority};

        let metrics_collector = collector();
        metrics_collector.queue.enqueue(Event::new("e-1", Priority::Normal, Bytes::new()));

        let snapshot = metrics_collector.tick();
        assert_eq!(snapshot.queue.current_size, 1);
        assert!(snapshot.pools.is_empty());
        assert!(snapshot.scaling.is_none());
    }

    #[test]
    fn record_scale_decision_surfaces_in_next_tick() {
        let metrics_collector = collector();
        metrics_collector.record_scale_decision(&ScaleDecision::ScaleUp { count: 2, reason: "cpu".to_string() });

        let snapshot = metrics_collector.tick();
        let scaling = snapshot.scaling.expect("decision recorded before tick");
        assert_eq!(scaling.kind, "scale_up");
        assert_eq!(scaling.count, 2);
    }

    #[test]
    fn tick_reports_per_instance_metrics() {
        let queue = Arc::new(EventQueue::new(QueueConfig::default()));
        let pool_manager = Arc::new(HttpClientPoolManager::new(HttpPoolConfig::default()));
        let registry = Arc::new(InstanceRegistry::new());
        registry.create("instance-0", None);
        let metrics_collector = MetricsCollector::new(queue, pool_manager, registry);

        let snapshot = metrics_collector.tick();
        assert_eq!(snapshot.instances.len(), 1);
        assert_eq!(snapshot.instances[0].id, "instance-0");
    }

    #[test]
    fn health_transition_is_recorded_without_panicking() {
        let metrics_collector = collector();
        metrics_collector.on_health_changed("instance-0", HealthStatus::Unknown, HealthStatus::Healthy);
    }

    #[test]
    fn sinks_receive_every_tick() {
        let metrics_collector = collector();
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        metrics_collector.register_sink(sink.clone());

        metrics_collector.tick();
        metrics_collector.tick();

        assert_eq!(sink.0.lock().len(), 2);
    }
}
