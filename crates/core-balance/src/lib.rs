//! Picks a `Running + Healthy` instance for an event, per the configured
//! strategy. One dispatch point (`pick`) matches on `LoadBalancerStrategy`
//! the way `StandbyProcessor` matches on its own enum variants.

use chrono::Utc;
use core_config::{LoadBalancerConfig, LoadBalancerStrategy};
use core_registry::{Instance, InstanceRegistry};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceError {
    NoCapacity,
}

impl std::fmt::Display for BalanceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("no healthy instance available")
    }
}
impl std::error::Error for BalanceError {}

struct StickyEntry {
    instance_id: String,
    expires_at: chrono::DateTime<Utc>,
}

/// Selects instances for incoming events. Round-robin and least-busy need
/// no per-instance configuration; weighted round-robin reads weights set
/// via [`LoadBalancer::set_weight`] (default 1 for any instance not set);
/// sticky falls back to round-robin on a cold, expired, or unhealthy key.
pub struct LoadBalancer {
    registry: Arc<InstanceRegistry>,
    config: LoadBalancerConfig,
    round_robin_counter: AtomicU64,
    weights: DashMap<String, u32>,
    current_weights: Mutex<HashMap<String, i64>>,
    sticky_map: DashMap<String, StickyEntry>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<InstanceRegistry>, config: LoadBalancerConfig) -> Self {
        Self {
            registry,
            config,
            round_robin_counter: AtomicU64::new(0),
            weights: DashMap::new(),
            current_weights: Mutex::new(HashMap::new()),
            sticky_map: DashMap::new(),
        }
    }

    /// Sets the weight used by `WeightedRoundRobin` for `instance_id`.
    /// Instances with no weight set default to 1.
    pub fn set_weight(&self, instance_id: impl Into<String>, weight: u32) {
        self.weights.insert(instance_id.into(), weight.max(1));
    }

    fn weight_of(&self, instance_id: &str) -> i64 {
        self.weights.get(instance_id).map(|w| *w as i64).unwrap_or(1)
    }

    /// Picks an instance. `affinity_key` is only consulted by the `Sticky`
    /// strategy; other strategies ignore it.
    pub fn pick(&self, affinity_key: Option<&str>) -> Result<Arc<Instance>, BalanceError> {
        match self.config.strategy {
            LoadBalancerStrategy::RoundRobin => self.pick_round_robin(),
            LoadBalancerStrategy::WeightedRoundRobin => self.pick_weighted_round_robin(),
            LoadBalancerStrategy::LeastBusy => self.pick_least_busy(),
            LoadBalancerStrategy::Sticky => self.pick_sticky(affinity_key),
        }
    }

    fn candidates(&self) -> Result<Vec<Arc<Instance>>, BalanceError> {
        let candidates = self.registry.running_and_healthy();
        if candidates.is_empty() {
            Err(BalanceError::NoCapacity)
        } else {
            Ok(candidates)
        }
    }

    fn pick_round_robin(&self) -> Result<Arc<Instance>, BalanceError> {
        let candidates = self.candidates()?;
        let idx = self.round_robin_counter.fetch_add(1, AtomicOrdering::SeqCst) as usize % candidates.len();
        Ok(candidates[idx].clone())
    }

    /// Smooth weighted round-robin: every turn each candidate's running
    /// weight increases by its configured weight, the highest is picked,
    /// and the total weight is subtracted back from the winner.
    fn pick_weighted_round_robin(&self) -> Result<Arc<Instance>, BalanceError> {
        let candidates = self.candidates()?;
        let total_weight: i64 = candidates.iter().map(|c| self.weight_of(&c.id)).sum();

        let mut current = self.current_weights.lock();
        let mut best_idx = 0;
        let mut best_weight = i64::MIN;
        for (i, instance) in candidates.iter().enumerate() {
            let entry = current.entry(instance.id.clone()).or_insert(0);
            *entry += self.weight_of(&instance.id);
            if *entry > best_weight {
                best_weight = *entry;
                best_idx = i;
            }
        }
        if let Some(entry) = current.get_mut(&candidates[best_idx].id) {
            *entry -= total_weight;
        }
        Ok(candidates[best_idx].clone())
    }

    fn pick_least_busy(&self) -> Result<Arc<Instance>, BalanceError> {
        let candidates = self.candidates()?;
        candidates
            .into_iter()
            .min_by(|a, b| {
                let ma = a.metrics();
                let mb = b.metrics();
                ma.queue_depth
                    .cmp(&mb.queue_depth)
                    .then_with(|| ma.avg_response_time_ms.partial_cmp(&mb.avg_response_time_ms).unwrap_or(Ordering::Equal))
            })
            .ok_or(BalanceError::NoCapacity)
    }

    fn sticky_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.config.sticky_timeout_minutes as i64)
    }

    fn pick_sticky(&self, affinity_key: Option<&str>) -> Result<Arc<Instance>, BalanceError> {
        let key = match affinity_key {
            Some(key) => key,
            None => return self.pick_round_robin(),
        };

        let now = Utc::now();
        if let Some(entry) = self.sticky_map.get(key) {
            if entry.expires_at > now {
                if let Some(instance) = self.registry.get(&entry.instance_id) {
                    if instance.is_running_and_healthy() {
                        drop(entry);
                        self.sticky_map.insert(
                            key.to_string(),
                            StickyEntry {
                                instance_id: instance.id.clone(),
                                expires_at: now + self.sticky_timeout(),
                            },
                        );
                        return Ok(instance);
                    }
                }
            }
        }

        let chosen = self.pick_round_robin()?;
        self.sticky_map.insert(
            key.to_string(),
            StickyEntry {
                instance_id: chosen.id.clone(),
                expires_at: now + self.sticky_timeout(),
            },
        );
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_common::{HealthStatus, InstanceMetrics};

    fn healthy_registry(ids: &[&str]) -> Arc<InstanceRegistry> {
        let registry = Arc::new(InstanceRegistry::new());
        for id in ids {
            registry.create(*id, None);
            registry.start(id).unwrap();
            registry.update_health(id, HealthStatus::Healthy).unwrap();
        }
        registry
    }

    #[test]
    fn round_robin_cycles_through_candidates() {
        let registry = healthy_registry(&["i-1", "i-2", "i-3"]);
        let balancer = LoadBalancer::new(registry, LoadBalancerConfig {
            strategy: LoadBalancerStrategy::RoundRobin,
            ..Default::default()
        });

        let picks: Vec<String> = (0..6).map(|_| balancer.pick(None).unwrap().id.clone()).collect();
        assert_eq!(picks, vec!["i-1", "i-2", "i-3", "i-1", "i-2", "i-3"]);
    }

    #[test]
    fn weighted_round_robin_respects_weights() {
        let registry = healthy_registry(&["heavy", "light"]);
        let balancer = LoadBalancer::new(registry, LoadBalancerConfig {
            strategy: LoadBalancerStrategy::WeightedRoundRobin,
            ..Default::default()
        });
        balancer.set_weight("heavy", 3);
        balancer.set_weight("light", 1);

        let mut counts = HashMap::new();
        for _ in 0..8 {
            *counts.entry(balancer.pick(None).unwrap().id.clone()).or_insert(0) += 1;
        }
        assert_eq!(counts.get("heavy").copied().unwrap_or(0), 6);
        assert_eq!(counts.get("light").copied().unwrap_or(0), 2);
    }

    #[test]
    fn least_busy_picks_lowest_queue_depth_then_response_time() {
        let registry = healthy_registry(&["busy", "idle", "idler"]);
        registry.update_metrics("busy", InstanceMetrics { queue_depth: 50, ..Default::default() }).unwrap();
        registry.update_metrics("idle", InstanceMetrics { queue_depth: 2, avg_response_time_ms: 80.0, ..Default::default() }).unwrap();
        registry.update_metrics("idler", InstanceMetrics { queue_depth: 2, avg_response_time_ms: 20.0, ..Default::default() }).unwrap();

        let balancer = LoadBalancer::new(registry, LoadBalancerConfig {
            strategy: LoadBalancerStrategy::LeastBusy,
            ..Default::default()
        });
        assert_eq!(balancer.pick(None).unwrap().id, "idler");
    }

    #[test]
    fn sticky_returns_same_instance_until_unhealthy() {
        let registry = healthy_registry(&["i-1", "i-2"]);
        let balancer = LoadBalancer::new(registry.clone(), LoadBalancerConfig {
            strategy: LoadBalancerStrategy::Sticky,
            sticky_timeout_minutes: 30,
        });

        let first = balancer.pick(Some("caller-a")).unwrap().id.clone();
        for _ in 0..5 {
            assert_eq!(balancer.pick(Some("caller-a")).unwrap().id, first);
        }

        registry.update_health(&first, HealthStatus::Unhealthy).unwrap();
        let fallback = balancer.pick(Some("caller-a")).unwrap();
        assert_ne!(fallback.id, first);
    }

    #[test]
    fn no_capacity_when_no_healthy_instances() {
        let registry = Arc::new(InstanceRegistry::new());
        registry.create("i-1", None);
        let balancer = LoadBalancer::new(registry, LoadBalancerConfig::default());
        assert!(matches!(balancer.pick(None), Err(BalanceError::NoCapacity)));
    }
}
