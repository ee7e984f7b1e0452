//! Periodic per-instance health probing and overall health determination.

use chrono::{DateTime, Utc};
use core_common::{CancelToken, HealthStatus, InstanceMetrics};
use core_config::HealthConfig;
use core_registry::InstanceRegistry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One probe result, appended to an instance's rolling history.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSample {
    pub timestamp: DateTime<Utc>,
    pub healthy: bool,
    pub response_time_ms: Option<u64>,
    pub status_code: Option<u16>,
    pub details: Option<serde_json::Value>,
    pub error: Option<String>,
    pub breached_metrics: Vec<&'static str>,
}

struct InstanceHealthState {
    samples: Mutex<VecDeque<HealthSample>>,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
}

impl InstanceHealthState {
    fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
        }
    }
}

/// Compares live instance metrics against the configured alert thresholds.
fn breached_metrics(metrics: &InstanceMetrics, config: &HealthConfig) -> Vec<&'static str> {
    let mut breached = Vec::new();
    if metrics.cpu_percent > config.cpu_alert_percent {
        breached.push("cpu");
    }
    if metrics.memory_percent > config.memory_alert_percent {
        breached.push("memory");
    }
    if metrics.error_rate > config.error_rate_alert {
        breached.push("error_rate");
    }
    if metrics.avg_response_time_ms > config.response_time_alert_ms {
        breached.push("response_time");
    }
    if metrics.queue_depth > config.queue_depth_alert {
        breached.push("queue_depth");
    }
    breached
}

pub struct HealthMonitor {
    registry: std::sync::Arc<InstanceRegistry>,
    config: HealthConfig,
    client: reqwest::Client,
    states: DashMap<String, InstanceHealthState>,
}

impl HealthMonitor {
    pub fn new(registry: std::sync::Arc<InstanceRegistry>, config: HealthConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .expect("reqwest client configuration is always valid");
        Self {
            registry,
            config,
            client,
            states: DashMap::new(),
        }
    }

    /// Probes every instance once and updates the registry's recorded
    /// health for any instance whose overall verdict changed.
    pub async fn run_once(&self) {
        for instance in self.registry.list() {
            let sample = self.probe(&instance).await;
            let overall = self.record_and_recompute(&instance.id, sample);
            if let Err(err) = self.registry.update_health(&instance.id, overall) {
                warn!(instance_id = %instance.id, %err, "health update for vanished instance");
            }
        }
    }

    async fn probe(&self, instance: &core_registry::Instance) -> HealthSample {
        let metrics = instance.metrics();
        let mut breached = breached_metrics(&metrics, &self.config);

        let (response_time_ms, status_code, details, error) = match &instance.health_endpoint {
            Some(endpoint) => {
                let started = std::time::Instant::now();
                match self.client.get(endpoint).send().await {
                    Ok(response) => {
                        let status = response.status();
                        let elapsed_ms = Some(started.elapsed().as_millis() as u64);
                        let body = response.json::<serde_json::Value>().await.ok();
                        if !status.is_success() {
                            breached.push("probe_status");
                        }
                        (elapsed_ms, Some(status.as_u16()), body, None)
                    }
                    Err(err) => (Some(started.elapsed().as_millis() as u64), None, None, Some(err.to_string())),
                }
            }
            None => (None, None, None, None),
        };

        let healthy = error.is_none() && breached.is_empty();

        if !healthy {
            debug!(
                instance_id = %instance.id,
                ?breached,
                ?error,
                "health probe recorded unhealthy sample"
            );
        }

        HealthSample {
            timestamp: Utc::now(),
            healthy,
            response_time_ms,
            status_code,
            details,
            error,
            breached_metrics: breached,
        }
    }

    fn record_and_recompute(&self, instance_id: &str, sample: HealthSample) -> HealthStatus {
        let state = self
            .states
            .entry(instance_id.to_string())
            .or_insert_with(InstanceHealthState::new);

        if sample.healthy {
            state.consecutive_successes.fetch_add(1, Ordering::SeqCst);
            state.consecutive_failures.store(0, Ordering::SeqCst);
        } else {
            state.consecutive_failures.fetch_add(1, Ordering::SeqCst);
            state.consecutive_successes.store(0, Ordering::SeqCst);
        }

        let cutoff = Utc::now() - chrono::Duration::minutes(self.config.history_minutes as i64);
        let mut samples = state.samples.lock();
        samples.push_back(sample);
        while samples.front().map(|s| s.timestamp < cutoff).unwrap_or(false) {
            samples.pop_front();
        }

        let consecutive_failures = state.consecutive_failures.load(Ordering::SeqCst);
        let consecutive_successes = state.consecutive_successes.load(Ordering::SeqCst);

        if consecutive_failures >= self.config.failure_threshold {
            return HealthStatus::Unhealthy;
        }
        if consecutive_successes >= self.config.success_threshold {
            return HealthStatus::Healthy;
        }

        let recent_cutoff = Utc::now() - chrono::Duration::minutes(5);
        let recent: Vec<&HealthSample> = samples.iter().filter(|s| s.timestamp >= recent_cutoff).collect();
        if recent.is_empty() {
            return HealthStatus::Unknown;
        }

        let healthy_count = recent.iter().filter(|s| s.healthy).count();
        let ratio = healthy_count as f64 / recent.len() as f64;
        if ratio >= 0.8 {
            HealthStatus::Healthy
        } else if ratio >= 0.5 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// Runs the probe loop on `config.check_interval_seconds`, until
    /// `cancel` is signalled.
    pub async fn run(self: std::sync::Arc<Self>, cancel: CancelToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.check_interval_seconds));
        info!(interval_seconds = self.config.check_interval_seconds, "health monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_once().await,
                _ = cancel.cancelled() => {
                    info!("health monitor stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_common::Priority;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> HealthConfig {
        HealthConfig {
            check_interval_seconds: 30,
            timeout_seconds: 2,
            history_minutes: 30,
            failure_threshold: 3,
            success_threshold: 2,
            cpu_alert_percent: 85.0,
            memory_alert_percent: 90.0,
            error_rate_alert: 0.10,
            response_time_alert_ms: 2_000.0,
            queue_depth_alert: 5_000,
        }
    }

    #[tokio::test]
    async fn three_consecutive_failures_marks_unhealthy() {
        let registry = std::sync::Arc::new(InstanceRegistry::new());
        registry.create("i-1", None);
        registry.update_metrics(
            "i-1",
            InstanceMetrics {
                cpu_percent: 99.0,
                ..Default::default()
            },
        )
        .unwrap();

        let monitor = HealthMonitor::new(registry.clone(), test_config());
        for _ in 0..3 {
            monitor.run_once().await;
        }

        assert_eq!(registry.get("i-1").unwrap().health(), HealthStatus::Unhealthy);
        let _ = Priority::Normal;
    }

    #[tokio::test]
    async fn two_consecutive_successes_marks_healthy() {
        let registry = std::sync::Arc::new(InstanceRegistry::new());
        registry.create("i-1", None);

        let monitor = HealthMonitor::new(registry.clone(), test_config());
        for _ in 0..2 {
            monitor.run_once().await;
        }

        assert_eq!(registry.get("i-1").unwrap().health(), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn probe_endpoint_failure_counts_as_unhealthy_sample() {
        let registry = std::sync::Arc::new(InstanceRegistry::new());
        registry.create("i-1", Some("http://127.0.0.1:1/no-such-server".to_string()));

        let monitor = HealthMonitor::new(registry.clone(), test_config());
        monitor.run_once().await;
        monitor.run_once().await;
        monitor.run_once().await;

        assert_eq!(registry.get("i-1").unwrap().health(), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn healthy_endpoint_keeps_instance_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let registry = std::sync::Arc::new(InstanceRegistry::new());
        registry.create("i-1", Some(format!("{}/health", server.uri())));

        let monitor = HealthMonitor::new(registry.clone(), test_config());
        monitor.run_once().await;
        monitor.run_once().await;

        assert_eq!(registry.get("i-1").unwrap().health(), HealthStatus::Healthy);
    }
}
