//! Periodic capacity decisions over the instance registry and queue depth.
//!
//! `Autoscaler::evaluate` is the single dispatch point: it reads one metrics
//! snapshot, then matches on the configured [`AutoscalerPolicy`] to decide
//! whether to grow, one conservative rule to decide whether to shrink, and
//! serializes the whole decision behind one mutex so only one action is ever
//! in flight.

use chrono::{DateTime, Utc};
use core_common::InstanceStatus;
use core_config::{AutoscalerConfig, AutoscalerPolicy, InstanceConfig};
use core_queue::EventQueue;
use core_registry::{HealthChangeObserver, Instance, InstanceRegistry};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub avg_cpu: f64,
    pub avg_memory: f64,
    pub avg_response_time: f64,
    pub total_throughput: f64,
    pub queue_depth: u64,
    pub high_priority_queue_depth: u64,
    pub error_rate: f64,
    pub active_instances: u32,
    pub cpu_pressure: f64,
    pub memory_pressure: f64,
    pub queue_pressure: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScaleDecision {
    ScaleUp { count: u32, reason: String },
    ScaleDown { count: u32, reason: String },
    None { reason: &'static str },
}

fn linear_regression_slope(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let sum_x2: f64 = points.iter().map(|(x, _)| x * x).sum();
    let denom = n * sum_x2 - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denom
}

pub struct Autoscaler {
    registry: Arc<InstanceRegistry>,
    queue: Arc<EventQueue>,
    config: AutoscalerConfig,
    instance_limits: InstanceConfig,
    history: Mutex<VecDeque<MetricsSnapshot>>,
    ever_healthy: Mutex<HashSet<String>>,
    last_scale_up_at: Mutex<Option<Instant>>,
    last_scale_down_at: Mutex<Option<Instant>>,
    decision_lock: Mutex<()>,
    next_instance_seq: AtomicU64,
}

impl Autoscaler {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        queue: Arc<EventQueue>,
        config: AutoscalerConfig,
        instance_limits: InstanceConfig,
    ) -> Self {
        Self {
            registry,
            queue,
            config,
            instance_limits,
            history: Mutex::new(VecDeque::new()),
            ever_healthy: Mutex::new(HashSet::new()),
            last_scale_up_at: Mutex::new(None),
            last_scale_down_at: Mutex::new(None),
            decision_lock: Mutex::new(()),
            next_instance_seq: AtomicU64::new(0),
        }
    }

    fn current_count(&self) -> u32 {
        self.registry
            .list()
            .iter()
            .filter(|i| i.status() != InstanceStatus::Stopped)
            .count() as u32
    }

    /// An instance is only counted once it has reported at least one
    /// `Healthy` probe: capacity does not increment synchronously on
    /// instance creation.
    fn active_instances(&self) -> u32 {
        let ever_healthy = self.ever_healthy.lock();
        self.registry
            .list()
            .iter()
            .filter(|i| i.status() == InstanceStatus::Running && ever_healthy.contains(&i.id))
            .count() as u32
    }

    fn all_draining(&self) -> bool {
        let instances = self.registry.list();
        !instances.is_empty()
            && instances
                .iter()
                .all(|i| matches!(i.status(), InstanceStatus::Draining | InstanceStatus::Stopped))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let running: Vec<Arc<Instance>> = self
            .registry
            .list()
            .into_iter()
            .filter(|i| i.status() == InstanceStatus::Running)
            .collect();
        let n = running.len().max(1) as f64;

        let avg_cpu = running.iter().map(|i| i.metrics().cpu_percent).sum::<f64>() / n;
        let avg_memory = running.iter().map(|i| i.metrics().memory_percent).sum::<f64>() / n;
        let avg_response_time = running.iter().map(|i| i.metrics().avg_response_time_ms).sum::<f64>() / n;
        let error_rate = running.iter().map(|i| i.metrics().error_rate).sum::<f64>() / n;
        let total_throughput = running.iter().map(|i| i.metrics().events_processed_per_second).sum::<f64>();

        let queue_metrics = self.queue.metrics();
        let queue_depth = queue_metrics.current_size;
        let high_priority_queue_depth = self.queue.high_priority_depth();

        MetricsSnapshot {
            avg_cpu,
            avg_memory,
            avg_response_time,
            total_throughput,
            queue_depth,
            high_priority_queue_depth,
            error_rate,
            active_instances: self.active_instances(),
            cpu_pressure: avg_cpu / 100.0,
            memory_pressure: avg_memory / 100.0,
            queue_pressure: (queue_depth as f64 / 1000.0).min(1.0),
            timestamp: Utc::now(),
        }
    }

    fn record_history(&self, snapshot: MetricsSnapshot) {
        let mut history = self.history.lock();
        history.push_back(snapshot);
        let cutoff = Utc::now() - chrono::Duration::minutes(10);
        while history.front().map(|s| s.timestamp < cutoff).unwrap_or(false) {
            history.pop_front();
        }
    }

    fn in_cooldown(&self, last: &Mutex<Option<Instant>>, cooldown_secs: u64) -> bool {
        match *last.lock() {
            Some(at) => at.elapsed() < Duration::from_secs(cooldown_secs),
            None => false,
        }
    }

    /// Runs one evaluation: snapshot, history update, then at most one
    /// scaling decision. Serialized so only one evaluation computes and
    /// commits a decision at a time.
    pub fn evaluate(&self) -> ScaleDecision {
        let _serialize = self.decision_lock.lock();

        let snapshot = self.snapshot();
        let current = self.current_count();
        self.record_history(snapshot.clone());

        if self.all_draining() {
            return ScaleDecision::None { reason: "all_draining" };
        }

        if current < self.instance_limits.max_instances {
            if let Some((count, reason)) = self.decide_scale_up(&snapshot, current) {
                if self.in_cooldown(&self.last_scale_up_at, self.config.scale_up_cooldown_seconds) {
                    return ScaleDecision::None { reason: "cooldown" };
                }
                *self.last_scale_up_at.lock() = Some(Instant::now());
                info!(count, %reason, "autoscaler decided to scale up");
                return ScaleDecision::ScaleUp { count, reason };
            }
        }

        if current > self.instance_limits.min_instances {
            if let Some((count, reason)) = self.decide_scale_down(&snapshot, current) {
                if self.in_cooldown(&self.last_scale_down_at, self.config.scale_down_cooldown_seconds) {
                    return ScaleDecision::None { reason: "cooldown" };
                }
                *self.last_scale_down_at.lock() = Some(Instant::now());
                info!(count, %reason, "autoscaler decided to scale down");
                return ScaleDecision::ScaleDown { count, reason };
            }
        }

        ScaleDecision::None { reason: "no_action" }
    }

    fn decide_scale_up(&self, snapshot: &MetricsSnapshot, current: u32) -> Option<(u32, String)> {
        match self.config.policy {
            AutoscalerPolicy::TargetTracking => self.target_tracking_scale_up(snapshot, current),
            AutoscalerPolicy::StepScaling => self.step_scaling_scale_up(snapshot, current),
            AutoscalerPolicy::Predictive => self.predictive_scale_up(),
        }
    }

    fn target_tracking_scale_up(&self, s: &MetricsSnapshot, current: u32) -> Option<(u32, String)> {
        let mut breaches: Vec<(&'static str, f64)> = Vec::new();
        if s.avg_cpu > self.config.target_cpu_percent {
            breaches.push(("cpu", s.avg_cpu / self.config.target_cpu_percent));
        }
        if s.avg_memory > self.config.target_memory_percent {
            breaches.push(("memory", s.avg_memory / self.config.target_memory_percent));
        }
        if s.queue_depth as f64 > self.config.target_queue_depth as f64 {
            breaches.push(("queue_depth", s.queue_depth as f64 / self.config.target_queue_depth as f64));
        }
        if s.avg_response_time > self.config.target_response_time_ms {
            breaches.push(("response_time", s.avg_response_time / self.config.target_response_time_ms));
        }
        if breaches.is_empty() {
            return None;
        }
        let (metric, factor) = *breaches
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;

        let wanted = ((current as f64 * factor).ceil() as i64 - current as i64).max(1) as u32;
        let capped = wanted
            .min(self.config.max_scale_out_step)
            .min(self.instance_limits.max_instances.saturating_sub(current));
        if capped == 0 {
            return None;
        }
        Some((capped, format!("target_tracking: {metric} at {factor:.2}x target")))
    }

    fn step_scaling_scale_up(&self, s: &MetricsSnapshot, current: u32) -> Option<(u32, String)> {
        let cpu_breach = (s.avg_cpu - self.config.target_cpu_percent) / self.config.target_cpu_percent;
        let mem_breach = (s.avg_memory - self.config.target_memory_percent) / self.config.target_memory_percent;
        let queue_breach =
            (s.queue_depth as f64 - self.config.target_queue_depth as f64) / self.config.target_queue_depth as f64;
        let max_breach = cpu_breach.max(mem_breach).max(queue_breach);
        if max_breach <= 0.0 {
            return None;
        }

        let step = if max_breach > 0.5 {
            self.config.max_scale_out_step
        } else if max_breach > 0.2 {
            (self.config.max_scale_out_step / 2).max(2)
        } else {
            1
        };
        let capped = step.min(self.instance_limits.max_instances.saturating_sub(current));
        if capped == 0 {
            return None;
        }
        Some((capped, format!("step_scaling: max breach {max_breach:.2}")))
    }

    /// Requires at least 3 samples inside a 10 minute window; scales up by
    /// one instance when both queue depth and CPU are trending upward.
    fn predictive_scale_up(&self) -> Option<(u32, String)> {
        let history = self.history.lock();
        let cutoff = Utc::now() - chrono::Duration::minutes(10);
        let recent: Vec<&MetricsSnapshot> = history.iter().filter(|s| s.timestamp >= cutoff).collect();
        if recent.len() < 3 {
            return None;
        }

        let queue_points: Vec<(f64, f64)> = recent
            .iter()
            .enumerate()
            .map(|(i, s)| (i as f64, s.queue_depth as f64))
            .collect();
        let cpu_points: Vec<(f64, f64)> = recent.iter().enumerate().map(|(i, s)| (i as f64, s.avg_cpu)).collect();

        let queue_slope = linear_regression_slope(&queue_points);
        let cpu_slope = linear_regression_slope(&cpu_points);

        if queue_slope > 0.1 && cpu_slope > 0.05 {
            Some((1, format!("predictive: queue_slope={queue_slope:.3} cpu_slope={cpu_slope:.3}")))
        } else {
            None
        }
    }

    fn decide_scale_down(&self, s: &MetricsSnapshot, current: u32) -> Option<(u32, String)> {
        let mut conditions_met = 0u32;
        if s.avg_cpu < 0.7 * self.config.target_cpu_percent {
            conditions_met += 1;
        }
        if s.avg_memory < 0.7 * self.config.target_memory_percent {
            conditions_met += 1;
        }
        if (s.queue_depth as f64) < 0.5 * self.config.target_queue_depth as f64 {
            conditions_met += 1;
        }
        if conditions_met < 2 {
            return None;
        }

        let removable = current.saturating_sub(self.instance_limits.min_instances);
        let count = self.config.max_scale_in_step.min(removable);
        if count == 0 {
            return None;
        }
        Some((count, format!("scale_down: {conditions_met}/3 conditions met")))
    }

    /// Creates and starts `count` new instances. Callers wait for each
    /// instance's first `Healthy` probe before treating it as capacity.
    pub fn scale_up(&self, count: u32) -> Vec<Arc<Instance>> {
        (0..count)
            .map(|_| {
                let seq = self.next_instance_seq.fetch_add(1, Ordering::SeqCst);
                let id = format!("instance-{seq}");
                let instance = self.registry.create(&id, None);
                let _ = self.registry.start(&id);
                instance
            })
            .collect()
    }

    /// Picks `count` running instances to drain, least busy first.
    pub fn scale_down_candidates(&self, count: u32) -> Vec<Arc<Instance>> {
        let mut running: Vec<Arc<Instance>> = self
            .registry
            .list()
            .into_iter()
            .filter(|i| i.status() == InstanceStatus::Running)
            .collect();
        running.sort_by(|a, b| {
            a.metrics()
                .events_processed_per_second
                .partial_cmp(&b.metrics().events_processed_per_second)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        running.into_iter().take(count as usize).collect()
    }
}

impl HealthChangeObserver for Autoscaler {
    fn on_health_changed(&self, instance_id: &str, _old: core_common::HealthStatus, new: core_common::HealthStatus) {
        if new == core_common::HealthStatus::Healthy {
            self.ever_healthy.lock().insert(instance_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_common::InstanceMetrics;
    use core_config::QueueConfig;

    fn running_instance(registry: &InstanceRegistry, id: &str, cpu: f64, memory: f64) {
        registry.create(id, None);
        registry.start(id).unwrap();
        registry
            .update_metrics(id, InstanceMetrics { cpu_percent: cpu, memory_percent: memory, ..Default::default() })
            .unwrap();
        registry.update_health(id, core_common::HealthStatus::Healthy).unwrap();
    }

    fn scaler(policy: AutoscalerPolicy, min: u32, max: u32) -> (Arc<InstanceRegistry>, Arc<EventQueue>, Autoscaler) {
        let registry = Arc::new(InstanceRegistry::new());
        let queue = Arc::new(EventQueue::new(QueueConfig::default()));
        let instance_limits = InstanceConfig { min_instances: min, max_instances: max, ..Default::default() };
        let config = AutoscalerConfig { policy, max_scale_out_step: 2, ..Default::default() };
        let autoscaler = Autoscaler::new(registry.clone(), queue.clone(), config, instance_limits);
        (registry, queue, autoscaler)
    }

    #[test]
    fn target_tracking_scales_up_on_cpu_breach() {
        let (registry, _queue, autoscaler) = scaler(AutoscalerPolicy::TargetTracking, 2, 6);
        running_instance(&registry, "i-1", 140.0, 10.0);
        running_instance(&registry, "i-2", 140.0, 10.0);

        let decision = autoscaler.evaluate();
        assert_eq!(decision, ScaleDecision::ScaleUp { count: 2, reason: "target_tracking: cpu at 2.00x target".to_string() });
    }

    #[test]
    fn scale_up_decision_within_cooldown_returns_none() {
        let (registry, _queue, autoscaler) = scaler(AutoscalerPolicy::TargetTracking, 2, 6);
        running_instance(&registry, "i-1", 140.0, 10.0);
        running_instance(&registry, "i-2", 140.0, 10.0);

        let first = autoscaler.evaluate();
        assert!(matches!(first, ScaleDecision::ScaleUp { .. }));

        let second = autoscaler.evaluate();
        assert_eq!(second, ScaleDecision::None { reason: "cooldown" });
    }

    #[test]
    fn scale_up_never_exceeds_max_instances() {
        let (registry, _queue, autoscaler) = scaler(AutoscalerPolicy::TargetTracking, 2, 3);
        running_instance(&registry, "i-1", 200.0, 10.0);
        running_instance(&registry, "i-2", 200.0, 10.0);
        registry.create("i-3", None);
        registry.start("i-3").unwrap();
        registry.update_metrics("i-3", InstanceMetrics { cpu_percent: 200.0, ..Default::default() }).unwrap();
        registry.update_health("i-3", core_common::HealthStatus::Healthy).unwrap();

        let decision = autoscaler.evaluate();
        assert_eq!(decision, ScaleDecision::None { reason: "no_action" });
    }

    #[test]
    fn scale_down_requires_two_of_three_conditions() {
        let (registry, _queue, autoscaler) = scaler(AutoscalerPolicy::TargetTracking, 2, 6);
        for i in 0..4 {
            running_instance(&registry, &format!("i-{i}"), 5.0, 5.0);
        }

        let decision = autoscaler.evaluate();
        assert_eq!(decision, ScaleDecision::ScaleDown { count: 1, reason: "scale_down: 3/3 conditions met".to_string() });
    }

    #[test]
    fn predictive_requires_three_samples_with_upward_trend() {
        use bytes::Bytes;
        use core_common::{Event, Priority};

        let (registry, queue, autoscaler) = scaler(AutoscalerPolicy::Predictive, 2, 6);
        running_instance(&registry, "i-1", 10.0, 10.0);

        assert_eq!(autoscaler.evaluate(), ScaleDecision::None { reason: "no_action" });
        assert_eq!(autoscaler.evaluate(), ScaleDecision::None { reason: "no_action" });

        for (i, cpu) in [60.0, 70.0, 80.0].into_iter().enumerate() {
            registry.update_metrics("i-1", InstanceMetrics { cpu_percent: cpu, ..Default::default() }).unwrap();
            for _ in 0..((i + 1) * 5) {
                queue.enqueue(Event::new("e", Priority::Normal, Bytes::new()));
            }
            autoscaler.evaluate();
        }

        let decision = autoscaler.evaluate();
        assert!(matches!(decision, ScaleDecision::ScaleUp { .. }), "expected scale-up from rising cpu/queue trend, got {decision:?}");
    }
}
