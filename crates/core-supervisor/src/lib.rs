//! Composition root: wires every other crate together, owns the background
//! tasks, and exposes the two calls an ingestion adapter needs —
//! [`Supervisor::submit`] and [`Supervisor::shutdown`]. Modeled on
//! `QueueManager`'s role as the single place that owns pools/consumers and
//! drains them on shutdown, and `LifecycleManager`'s pattern of one
//! `tokio::spawn` per independent background loop, each racing its own
//! ticker against a shared cancellation signal.

use async_trait::async_trait;
use chrono::Utc;
use core_balance::{BalanceError, LoadBalancer};
use core_common::{CancelToken, Event, FailureReason, ProcessingOutcome};
use core_config::AppConfig;
use core_health::HealthMonitor;
use core_metrics::MetricsCollector;
use core_net::HttpClientPoolManager;
use core_queue::{DequeueOutcome, EnqueueOutcome, EventQueue};
use core_registry::{Instance, InstanceRegistry};
use core_scale::{Autoscaler, ScaleDecision};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The pluggable egress contract. Implementations are out of scope here —
/// the core only requires idempotence under retry and one of the three
/// reported outcomes.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, event: &Event) -> ProcessingOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(FailureReason),
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),
}

/// Owns every component and every background task. Tests (and `bin/core-server`)
/// instantiate one of these per run; there is no process-wide singleton state.
pub struct Supervisor {
    queue: Arc<EventQueue>,
    registry: Arc<InstanceRegistry>,
    pool_manager: Arc<HttpClientPoolManager>,
    health_monitor: Arc<HealthMonitor>,
    balancer: Arc<LoadBalancer>,
    autoscaler: Arc<Autoscaler>,
    metrics: Arc<MetricsCollector>,
    processor: Arc<dyn Processor>,
    config: AppConfig,
    cancel: CancelToken,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// No config knob names a metrics-publish cadence; ten seconds is a
/// reasonable default independent of the autoscaler's own evaluation
/// interval.
const METRICS_TICK_INTERVAL: Duration = Duration::from_secs(10);

impl Supervisor {
    pub fn new(config: AppConfig, processor: Arc<dyn Processor>) -> Result<Arc<Self>, SupervisorError> {
        config
            .validate()
            .map_err(|err| SupervisorError::ConfigurationInvalid(err.to_string()))?;

        let queue = Arc::new(EventQueue::new(config.queue.clone()));
        let registry = Arc::new(InstanceRegistry::new());
        let pool_manager = Arc::new(HttpClientPoolManager::new(config.http_pool.clone()));
        let health_monitor = Arc::new(HealthMonitor::new(registry.clone(), config.health.clone()));
        let balancer = Arc::new(LoadBalancer::new(registry.clone(), config.load_balancer.clone()));
        let autoscaler = Arc::new(Autoscaler::new(
            registry.clone(),
            queue.clone(),
            config.autoscaler.clone(),
            config.instances.clone(),
        ));
        registry.on_health_changed(autoscaler.clone());
        let metrics = Arc::new(MetricsCollector::new(queue.clone(), pool_manager.clone(), registry.clone()));
        registry.on_health_changed(metrics.clone());

        Ok(Arc::new(Self {
            queue,
            registry,
            pool_manager,
            health_monitor,
            balancer,
            autoscaler,
            metrics,
            processor,
            config,
            cancel: CancelToken::new(),
            workers: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
        }))
    }

    /// Spins up `instances.defaultInstances` workers plus the health,
    /// metrics, and autoscaler background loops.
    pub async fn start(self: &Arc<Self>) {
        info!(count = self.config.instances.default_instances, "supervisor starting");
        for instance in self.autoscaler.scale_up(self.config.instances.default_instances) {
            spawn_worker(self, instance.id.clone());
        }

        let health = self.health_monitor.clone();
        let cancel = self.cancel.clone();
        self.background.lock().push(tokio::spawn(async move { health.run(cancel).await }));

        let metrics = self.metrics.clone();
        let cancel = self.cancel.clone();
        self.background
            .lock()
            .push(tokio::spawn(async move { metrics.run(METRICS_TICK_INTERVAL, cancel).await }));

        let supervisor = self.clone();
        self.background.lock().push(tokio::spawn(run_autoscaler_loop(supervisor)));
    }

    /// Delegates straight to the queue; rejection only ever carries
    /// `QueueFull`, per the contract.
    pub fn submit(&self, event: Event) -> SubmitOutcome {
        match self.queue.enqueue(event) {
            EnqueueOutcome::Accepted => SubmitOutcome::Accepted,
            EnqueueOutcome::QueueFull => SubmitOutcome::Rejected(FailureReason::QueueFull),
        }
    }

    /// Exposed for a `Processor` implementation that needs to address a
    /// specific running instance (e.g. one backed by its own HTTP
    /// endpoint) rather than rely on the shared-queue worker pool alone.
    pub fn pick_instance(&self, affinity_key: Option<&str>) -> Result<Arc<Instance>, BalanceError> {
        self.balancer.pick(affinity_key)
    }

    /// Feeds externally-observed system metrics (CPU, memory) for an
    /// instance into the registry. The core has no process/OS introspection
    /// of its own; a real deployment wires this to whatever reports it.
    pub fn report_instance_system_metrics(&self, instance_id: &str, cpu_percent: f64, memory_percent: f64) {
        if let Some(instance) = self.registry.get(instance_id) {
            let mut metrics = instance.metrics();
            metrics.cpu_percent = cpu_percent;
            metrics.memory_percent = memory_percent;
            metrics.timestamp = Utc::now();
            let _ = self.registry.update_metrics(instance_id, metrics);
        }
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn pool_manager(&self) -> &Arc<HttpClientPoolManager> {
        &self.pool_manager
    }

    pub fn metrics_collector(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Stops the autoscaler and health/metrics loops, drains every
    /// instance, and closes the queue to further dequeues. Returns once
    /// every in-flight event has finished or `deadline` elapses, whichever
    /// is first; events still sitting in the queue are left there for
    /// external inspection.
    pub async fn shutdown(&self, deadline: Duration) {
        info!("supervisor shutdown initiated");
        self.cancel.cancel();

        for instance in self.registry.list() {
            let _ = self.registry.drain(&instance.id);
        }

        let worker_handles: Vec<(String, JoinHandle<()>)> = self.workers.lock().drain().collect();
        let background_handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();

        let wait_all = async {
            for (_, handle) in worker_handles {
                let _ = handle.await;
            }
            for handle in background_handles {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(deadline, wait_all).await.is_err() {
            warn!("shutdown deadline elapsed before every task finished; remaining events stay queued");
        }
        info!(queue_depth = self.queue.metrics().current_size, "supervisor shutdown complete");
    }

    async fn process_event(&self, instance_id: &str, event: Event) {
        let started = Instant::now();
        let retry_count = event.retry_count;
        let event_id = event.id.clone();

        tokio::select! {
            outcome = self.processor.process(&event) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.record_instance_activity(instance_id, elapsed_ms, outcome == ProcessingOutcome::Success);
                match outcome {
                    ProcessingOutcome::Success => self.queue.complete_processing(),
                    ProcessingOutcome::RetryableFailure(reason) => {
                        if retry_count >= self.queue.max_retries() {
                            warn!(event_id = %event_id, reason, "retries exhausted, dead-lettering");
                            self.queue.dead_letter(event, FailureReason::ProcessingRetryable);
                        } else {
                            debug!(event_id = %event_id, reason, "requeueing retryable failure");
                            self.queue.requeue(event);
                        }
                    }
                    ProcessingOutcome::PermanentFailure(reason) => {
                        warn!(event_id = %event_id, reason, "permanent failure, dead-lettering");
                        self.queue.dead_letter(event, FailureReason::ProcessingPermanent);
                    }
                }
            }
            _ = self.cancel.cancelled() => {
                warn!(event_id = %event_id, "processing cancelled mid-flight");
                if retry_count >= self.queue.max_retries() {
                    self.queue.dead_letter(event, FailureReason::Cancelled);
                } else {
                    self.queue.requeue(event);
                }
            }
        }
    }

    /// An instance stops accepting work as soon as the health monitor
    /// marks it `Unhealthy`, even if its worker is still running. Starting
    /// states (`Unknown`/`Degraded`) are left eligible so a freshly
    /// scaled-up instance isn't starved before its first health sample.
    fn instance_accepts_traffic(&self, instance_id: &str) -> bool {
        self.registry
            .get(instance_id)
            .map(|instance| {
                instance.status() == core_common::InstanceStatus::Running
                    && instance.health() != core_common::HealthStatus::Unhealthy
            })
            .unwrap_or(false)
    }

    /// Applies the same retry/dead-letter rule as a processing failure,
    /// for an event that was never handed to the processor because its
    /// instance stopped accepting traffic.
    fn reject_no_capacity(&self, event: Event) {
        let event_id = event.id.clone();
        if event.retry_count >= self.queue.max_retries() {
            warn!(event_id = %event_id, "instance unhealthy and retries exhausted, dead-lettering");
            self.queue.dead_letter(event, FailureReason::NoCapacity);
        } else {
            debug!(event_id = %event_id, "instance unhealthy, re-enqueueing event");
            self.queue.requeue(event);
        }
    }

    fn record_instance_activity(&self, instance_id: &str, elapsed_ms: u64, success: bool) {
        let Some(instance) = self.registry.get(instance_id) else {
            return;
        };
        let mut metrics = instance.metrics();
        const ALPHA: f64 = 0.2;
        metrics.avg_response_time_ms = if metrics.avg_response_time_ms == 0.0 {
            elapsed_ms as f64
        } else {
            metrics.avg_response_time_ms * (1.0 - ALPHA) + elapsed_ms as f64 * ALPHA
        };
        metrics.error_rate = if success {
            metrics.error_rate * (1.0 - ALPHA)
        } else {
            metrics.error_rate * (1.0 - ALPHA) + ALPHA
        };
        metrics.queue_depth = self.queue.metrics().current_size;
        metrics.timestamp = Utc::now();
        let _ = self.registry.update_metrics(instance_id, metrics);
    }
}

fn spawn_worker(supervisor: &Arc<Supervisor>, instance_id: String) {
    let handle = tokio::spawn(run_worker(supervisor.clone(), instance_id.clone()));
    supervisor.workers.lock().insert(instance_id, handle);
}

/// `Dequeue -> process -> record`, in an infinite loop, until the instance
/// is drained or the supervisor is cancelled.
async fn run_worker(supervisor: Arc<Supervisor>, instance_id: String) {
    info!(instance_id = %instance_id, "worker started");
    let timeout = Duration::from_millis(supervisor.config.queue.dequeue_timeout_ms);

    loop {
        match supervisor.registry.get(&instance_id) {
            Some(instance) if instance.status() == core_common::InstanceStatus::Draining => {
                info!(instance_id = %instance_id, "worker draining, stopping");
                break;
            }
            None => break,
            _ => {}
        }

        match supervisor.queue.dequeue_cancellable(timeout, &supervisor.cancel).await {
            DequeueOutcome::Event(event) => {
                if supervisor.instance_accepts_traffic(&instance_id) {
                    supervisor.process_event(&instance_id, event).await;
                } else {
                    supervisor.reject_no_capacity(event);
                    tokio::time::sleep(timeout).await;
                }
            }
            DequeueOutcome::Timeout => continue,
            DequeueOutcome::Cancelled => break,
        }
    }

    let _ = supervisor.registry.stop(&instance_id);
    let _ = supervisor.registry.remove(&instance_id);
    info!(instance_id = %instance_id, "worker stopped");
}

async fn run_autoscaler_loop(supervisor: Arc<Supervisor>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(supervisor.config.autoscaler.evaluation_interval_seconds));
    info!("autoscaler loop started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let decision = supervisor.autoscaler.evaluate();
                apply_scale_decision(&supervisor, decision);
            }
            _ = supervisor.cancel.cancelled() => {
                info!("autoscaler loop stopping");
                break;
            }
        }
    }
}

fn apply_scale_decision(supervisor: &Arc<Supervisor>, decision: ScaleDecision) {
    supervisor.metrics.record_scale_decision(&decision);
    match decision {
        ScaleDecision::ScaleUp { count, reason } => {
            info!(count, reason = %reason, "autoscaler scaling up");
            for instance in supervisor.autoscaler.scale_up(count) {
                spawn_worker(supervisor, instance.id.clone());
            }
        }
        ScaleDecision::ScaleDown { count, reason } => {
            info!(count, reason = %reason, "autoscaler scaling down");
            for instance in supervisor.autoscaler.scale_down_candidates(count) {
                let _ = supervisor.registry.drain(&instance.id);
            }
        }
        ScaleDecision::None { reason } => {
            debug!(reason, "autoscaler took no action");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use core_common::Priority;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::sleep;

    struct AlwaysSucceeds;
    #[async_trait]
    impl Processor for AlwaysSucceeds {
        async fn process(&self, _event: &Event) -> ProcessingOutcome {
            ProcessingOutcome::Success
        }
    }

    struct AlwaysRetryable;
    #[async_trait]
    impl Processor for AlwaysRetryable {
        async fn process(&self, _event: &Event) -> ProcessingOutcome {
            ProcessingOutcome::RetryableFailure("downstream unavailable".to_string())
        }
    }

    struct FailsNTimesThenSucceeds(AtomicU32);
    #[async_trait]
    impl Processor for FailsNTimesThenSucceeds {
        async fn process(&self, _event: &Event) -> ProcessingOutcome {
            if self.0.fetch_add(1, Ordering::SeqCst) < 2 {
                ProcessingOutcome::RetryableFailure("not yet".to_string())
            } else {
                ProcessingOutcome::Success
            }
        }
    }

    fn small_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.queue.max_queue_size = 3;
        config.queue.dequeue_timeout_ms = 20;
        config.instances.min_instances = 1;
        config.instances.max_instances = 2;
        config.instances.default_instances = 1;
        config
    }

    #[tokio::test]
    async fn submit_then_process_completes_successfully() {
        let supervisor = Supervisor::new(small_config(), Arc::new(AlwaysSucceeds)).unwrap();
        supervisor.start().await;

        let outcome = supervisor.submit(Event::new("e-1", Priority::Normal, Bytes::new()));
        assert_eq!(outcome, SubmitOutcome::Accepted);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(supervisor.queue().metrics().total_dequeued, 1);

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn submit_rejects_once_queue_is_full() {
        let mut config = small_config();
        config.instances.default_instances = 0;
        config.instances.min_instances = 1;
        let supervisor = Supervisor::new(config, Arc::new(AlwaysSucceeds)).unwrap();

        for i in 0..3 {
            assert_eq!(
                supervisor.submit(Event::new(format!("e-{i}"), Priority::Normal, Bytes::new())),
                SubmitOutcome::Accepted
            );
        }
        assert_eq!(
            supervisor.submit(Event::new("overflow", Priority::Normal, Bytes::new())),
            SubmitOutcome::Rejected(FailureReason::QueueFull)
        );
    }

    #[tokio::test]
    async fn retryable_failure_is_retried_then_succeeds() {
        let supervisor = Supervisor::new(small_config(), Arc::new(FailsNTimesThenSucceeds(AtomicU32::new(0)))).unwrap();
        supervisor.start().await;

        supervisor.submit(Event::new("flaky", Priority::Normal, Bytes::new()));
        sleep(Duration::from_millis(300)).await;

        let metrics = supervisor.queue().metrics();
        assert_eq!(metrics.total_dead_lettered, 0);
        assert!(metrics.total_dequeued >= 3, "expected at least 2 retries plus the final success");

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn retries_exhausted_lands_in_dead_letter() {
        let mut config = small_config();
        config.queue.max_retries = 1;
        let supervisor = Supervisor::new(config, Arc::new(AlwaysRetryable)).unwrap();
        supervisor.start().await;

        supervisor.submit(Event::new("doomed", Priority::Normal, Bytes::new()));
        sleep(Duration::from_millis(300)).await;

        let dead = supervisor.queue().dead_letter_entries();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, FailureReason::ProcessingRetryable);

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_returns_once_workers_stop() {
        let supervisor = Supervisor::new(small_config(), Arc::new(AlwaysSucceeds)).unwrap();
        supervisor.start().await;
        assert_eq!(supervisor.registry().len(), 1);

        supervisor.shutdown(Duration::from_secs(2)).await;
        assert_eq!(supervisor.registry().len(), 0);
    }

    #[tokio::test]
    async fn unhealthy_instance_stops_receiving_traffic() {
        let mut config = small_config();
        config.queue.max_retries = 0;
        let supervisor = Supervisor::new(config, Arc::new(AlwaysSucceeds)).unwrap();
        supervisor.start().await;

        let instance_id = supervisor.registry().list()[0].id.clone();
        supervisor
            .registry()
            .update_health(&instance_id, core_common::HealthStatus::Unhealthy)
            .unwrap();

        supervisor.submit(Event::new("blocked", Priority::Normal, Bytes::new()));
        sleep(Duration::from_millis(200)).await;

        let dead = supervisor.queue().dead_letter_entries();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, FailureReason::NoCapacity);

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn scale_up_under_sustained_load_adds_instances() {
        let mut config = small_config();
        config.instances.min_instances = 1;
        config.instances.max_instances = 4;
        config.instances.default_instances = 1;
        config.autoscaler.evaluation_interval_seconds = 1;
        config.autoscaler.target_queue_depth = 1;
        config.autoscaler.max_scale_out_step = 2;
        config.queue.max_queue_size = 100;

        let supervisor = Supervisor::new(config, Arc::new(AlwaysRetryable)).unwrap();
        supervisor.start().await;

        for i in 0..20 {
            supervisor.submit(Event::new(format!("e-{i}"), Priority::Normal, Bytes::new()));
        }

        sleep(Duration::from_millis(1_500)).await;
        assert!(supervisor.registry().len() > 1, "expected the autoscaler to add capacity under load");

        supervisor.shutdown(Duration::from_secs(1)).await;
    }
}
