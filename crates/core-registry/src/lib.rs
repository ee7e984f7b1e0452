//! Authoritative table of processing instances, keyed by id.
//!
//! All mutations go through the registry so health-change observers see a
//! consistent total order; readers get copy-out snapshots rather than live
//! references into the table.

use chrono::{DateTime, Utc};
use core_common::{HealthStatus, InstanceMetrics, InstanceStatus};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// One entry in the registry. Cheap to clone (`Arc`-backed internals);
/// `snapshot()` is the copy-out view handed to callers outside the registry.
pub struct Instance {
    pub id: String,
    pub health_endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
    status: RwLock<InstanceStatus>,
    health: RwLock<HealthStatus>,
    metrics: RwLock<InstanceMetrics>,
}

impl Instance {
    fn new(id: String, health_endpoint: Option<String>) -> Self {
        Self {
            id,
            health_endpoint,
            created_at: Utc::now(),
            status: RwLock::new(InstanceStatus::Starting),
            health: RwLock::new(HealthStatus::Unknown),
            metrics: RwLock::new(InstanceMetrics::default()),
        }
    }

    pub fn status(&self) -> InstanceStatus {
        *self.status.read()
    }

    pub fn health(&self) -> HealthStatus {
        *self.health.read()
    }

    pub fn metrics(&self) -> InstanceMetrics {
        self.metrics.read().clone()
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id.clone(),
            health_endpoint: self.health_endpoint.clone(),
            created_at: self.created_at,
            status: self.status(),
            health: self.health(),
            metrics: self.metrics(),
        }
    }

    pub fn is_running_and_healthy(&self) -> bool {
        self.status() == InstanceStatus::Running && self.health() == HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub id: String,
    pub health_endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: InstanceStatus,
    pub health: HealthStatus,
    pub metrics: InstanceMetrics,
}

pub trait HealthChangeObserver: Send + Sync {
    fn on_health_changed(&self, instance_id: &str, old: HealthStatus, new: HealthStatus);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    NotFound(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::NotFound(id) => write!(f, "instance not found: {id}"),
        }
    }
}
impl std::error::Error for RegistryError {}

pub struct InstanceRegistry {
    instances: DashMap<String, Arc<Instance>>,
    health_observers: RwLock<Vec<Arc<dyn HealthChangeObserver>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
            health_observers: RwLock::new(Vec::new()),
        }
    }

    pub fn on_health_changed(&self, observer: Arc<dyn HealthChangeObserver>) {
        self.health_observers.write().push(observer);
    }

    pub fn create(&self, id: impl Into<String>, health_endpoint: Option<String>) -> Arc<Instance> {
        let id = id.into();
        let instance = Arc::new(Instance::new(id.clone(), health_endpoint));
        self.instances.insert(id.clone(), instance.clone());
        info!(instance_id = %id, "instance created");
        instance
    }

    pub fn start(&self, id: &str) -> Result<(), RegistryError> {
        let instance = self.get(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        *instance.status.write() = InstanceStatus::Running;
        info!(instance_id = %id, "instance started");
        Ok(())
    }

    pub fn drain(&self, id: &str) -> Result<(), RegistryError> {
        let instance = self.get(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        *instance.status.write() = InstanceStatus::Draining;
        info!(instance_id = %id, "instance draining");
        Ok(())
    }

    pub fn stop(&self, id: &str) -> Result<(), RegistryError> {
        let instance = self.get(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        *instance.status.write() = InstanceStatus::Stopped;
        info!(instance_id = %id, "instance stopped");
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<(), RegistryError> {
        self.instances
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        info!(instance_id = %id, "instance removed");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Instance>> {
        self.instances.get(id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<Arc<Instance>> {
        self.instances.iter().map(|e| e.value().clone()).collect()
    }

    pub fn running_and_healthy(&self) -> Vec<Arc<Instance>> {
        self.instances
            .iter()
            .filter(|e| e.value().is_running_and_healthy())
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn update_health(&self, id: &str, new_health: HealthStatus) -> Result<(), RegistryError> {
        let instance = self.get(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let old_health = {
            let mut guard = instance.health.write();
            let old = *guard;
            *guard = new_health;
            old
        };
        if old_health != new_health {
            info!(instance_id = %id, ?old_health, ?new_health, "instance health changed");
            for observer in self.health_observers.read().iter() {
                observer.on_health_changed(id, old_health, new_health);
            }
        }
        Ok(())
    }

    pub fn update_metrics(&self, id: &str, metrics: InstanceMetrics) -> Result<(), RegistryError> {
        let instance = self.get(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        *instance.metrics.write() = metrics;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver(Arc<AtomicUsize>);
    impl HealthChangeObserver for CountingObserver {
        fn on_health_changed(&self, _id: &str, _old: HealthStatus, _new: HealthStatus) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn create_start_drives_through_lifecycle() {
        let registry = InstanceRegistry::new();
        registry.create("i-1", None);
        assert_eq!(registry.get("i-1").unwrap().status(), InstanceStatus::Starting);
        registry.start("i-1").unwrap();
        assert_eq!(registry.get("i-1").unwrap().status(), InstanceStatus::Running);
        registry.drain("i-1").unwrap();
        assert_eq!(registry.get("i-1").unwrap().status(), InstanceStatus::Draining);
        registry.stop("i-1").unwrap();
        assert_eq!(registry.get("i-1").unwrap().status(), InstanceStatus::Stopped);
        registry.remove("i-1").unwrap();
        assert!(registry.get("i-1").is_none());
    }

    #[test]
    fn update_health_fires_observer_only_on_change() {
        let registry = InstanceRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.on_health_changed(Arc::new(CountingObserver(counter.clone())));
        registry.create("i-1", None);

        registry.update_health("i-1", HealthStatus::Healthy).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        registry.update_health("i-1", HealthStatus::Healthy).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1, "no-op transition must not notify");

        registry.update_health("i-1", HealthStatus::Unhealthy).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn running_and_healthy_filters_correctly() {
        let registry = InstanceRegistry::new();
        registry.create("i-1", None);
        registry.start("i-1").unwrap();
        registry.update_health("i-1", HealthStatus::Healthy).unwrap();

        registry.create("i-2", None);
        registry.start("i-2").unwrap();
        registry.update_health("i-2", HealthStatus::Degraded).unwrap();

        let candidates = registry.running_and_healthy();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "i-1");
    }

    #[test]
    fn operations_on_unknown_instance_error() {
        let registry = InstanceRegistry::new();
        assert_eq!(registry.start("ghost"), Err(RegistryError::NotFound("ghost".to_string())));
    }
}
