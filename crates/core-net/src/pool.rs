//! Pooled, circuit-breaker-guarded HTTP clients keyed by logical pool name.

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::retry::{backoff_delay, is_retryable_status, is_retryable_transport_error};
use core_common::{HealthStatus, Priority};
use core_config::HttpPoolConfig;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, OwnedSemaphorePermit};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no client became available within the timeout")]
    TimedOut,
    #[error("circuit is open for this pool")]
    CircuitOpen,
    #[error("unknown pool: {0}")]
    UnknownPool(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

struct Slot {
    id: u64,
    client: reqwest::Client,
    created_at: Instant,
    last_used_at: parking_lot::RwLock<Instant>,
    request_count: AtomicU64,
    error_count: AtomicU64,
    healthy: AtomicBool,
}

struct PoolInner {
    name: String,
    config: HttpPoolConfig,
    semaphore: Arc<Semaphore>,
    idle: parking_lot::Mutex<VecDeque<Arc<Slot>>>,
    created_count: AtomicU64,
    next_slot_id: AtomicU64,
    breaker: CircuitBreaker,
}

impl PoolInner {
    fn build_client(&self) -> reqwest::Client {
        let mut headers = reqwest::header::HeaderMap::with_capacity(self.config.default_headers.len());
        for (name, value) in &self.config.default_headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .expect("default header name must be a valid HTTP header name");
            let value = reqwest::header::HeaderValue::from_str(value)
                .expect("default header value must be valid ASCII visible characters");
            headers.insert(name, value);
        }
        reqwest::Client::builder()
            .timeout(Duration::from_millis(self.config.request_timeout_ms))
            .gzip(self.config.enable_compression)
            .default_headers(headers)
            .build()
            .expect("reqwest client configuration is always valid")
    }

    fn new_slot(&self) -> Arc<Slot> {
        let id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        self.created_count.fetch_add(1, Ordering::Relaxed);
        Arc::new(Slot {
            id,
            client: self.build_client(),
            created_at: Instant::now(),
            last_used_at: parking_lot::RwLock::new(Instant::now()),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
        })
    }
}

/// Exclusive loan of one underlying client. Returned to the pool's idle
/// list on drop unless marked unhealthy, so `Return` is implicit and
/// guaranteed on every exit path including a panicking caller.
pub struct ClientHandle {
    pool: Arc<PoolInner>,
    slot: Option<Arc<Slot>>,
    _permit: OwnedSemaphorePermit,
}

impl ClientHandle {
    pub fn client(&self) -> &reqwest::Client {
        &self.slot.as_ref().expect("slot present until drop").client
    }

    pub fn mark_unhealthy(&self) {
        self.slot
            .as_ref()
            .expect("slot present until drop")
            .healthy
            .store(false, Ordering::SeqCst);
    }

    /// Executes `request`, retrying per the pool's policy and recording
    /// the outcome against the pool's circuit breaker.
    pub async fn execute_with_retry(
        &self,
        request: reqwest::Request,
        priority: Priority,
    ) -> Result<reqwest::Response, PoolError> {
        let slot = self.slot.as_ref().expect("slot present until drop");
        let mut attempt = 0u32;

        loop {
            let attempt_request = request
                .try_clone()
                .expect("request body must be clonable for retry");

            slot.request_count.fetch_add(1, Ordering::Relaxed);
            *slot.last_used_at.write() = Instant::now();

            let outcome = slot.client.execute(attempt_request).await;

            match outcome {
                Ok(response) if response.status().is_success() || !is_retryable_status(response.status()) => {
                    if response.status().is_success() {
                        self.pool.breaker.record_success();
                    } else {
                        slot.error_count.fetch_add(1, Ordering::Relaxed);
                        self.pool.breaker.record_failure();
                    }
                    return Ok(response);
                }
                Ok(response) => {
                    slot.error_count.fetch_add(1, Ordering::Relaxed);
                    if attempt >= self.pool.config.max_retries {
                        self.pool.breaker.record_failure();
                        return Ok(response);
                    }
                    debug!(pool = %self.pool.name, attempt, status = %response.status(), "retrying request");
                }
                Err(err) if is_retryable_transport_error(&err) && attempt < self.pool.config.max_retries => {
                    slot.error_count.fetch_add(1, Ordering::Relaxed);
                    debug!(pool = %self.pool.name, attempt, error = %err, "retrying after transport error");
                }
                Err(err) => {
                    slot.error_count.fetch_add(1, Ordering::Relaxed);
                    self.pool.breaker.record_failure();
                    return Err(PoolError::Request(err));
                }
            }

            tokio::time::sleep(backoff_delay(priority, attempt)).await;
            attempt += 1;
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if slot.healthy.load(Ordering::SeqCst) {
                self.pool.idle.lock().push_back(slot);
            } else {
                warn!(pool = %self.pool.name, slot_id = slot.id, "discarding unhealthy client");
            }
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub pool_name: String,
    pub created_clients: u64,
    pub idle_clients: u64,
    pub max_connections: u32,
    pub in_use: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub circuit_state: CircuitState,
}

/// A single named pool of clients, each guarded by one circuit breaker.
pub struct HttpClientPool {
    inner: Arc<PoolInner>,
}

impl HttpClientPool {
    fn new(name: String, config: HttpPoolConfig) -> Self {
        let breaker = CircuitBreaker::new(
            config.circuit_breaker_threshold,
            Duration::from_secs(config.circuit_breaker_timeout_seconds),
        );
        let semaphore = Arc::new(Semaphore::new(config.max_connections as usize));
        Self {
            inner: Arc::new(PoolInner {
                name,
                config,
                semaphore,
                idle: parking_lot::Mutex::new(VecDeque::new()),
                created_count: AtomicU64::new(0),
                next_slot_id: AtomicU64::new(0),
                breaker,
            }),
        }
    }

    pub async fn get(&self, timeout: Duration) -> Result<ClientHandle, PoolError> {
        if !self.inner.breaker.can_execute() {
            return Err(PoolError::CircuitOpen);
        }

        let permit = tokio::time::timeout(timeout, self.inner.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| PoolError::TimedOut)?
            .expect("semaphore is never closed");

        let slot = self
            .inner
            .idle
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.inner.new_slot());

        Ok(ClientHandle {
            pool: self.inner.clone(),
            slot: Some(slot),
            _permit: permit,
        })
    }

    pub fn warm_up(&self, n: u32) {
        let target = n.min(self.inner.config.max_connections / 2);
        let mut idle = self.inner.idle.lock();
        while (idle.len() as u32) < target {
            idle.push_back(self.inner.new_slot());
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        let idle = self.inner.idle.lock();
        let idle_count = idle.len() as u64;
        let created = self.inner.created_count.load(Ordering::Relaxed);
        let in_use = self.inner.semaphore.available_permits() as u64;
        let in_use = (self.inner.config.max_connections as u64).saturating_sub(in_use);

        let (total_requests, total_errors) = idle
            .iter()
            .map(|s| {
                (
                    s.request_count.load(Ordering::Relaxed),
                    s.error_count.load(Ordering::Relaxed),
                )
            })
            .fold((0u64, 0u64), |acc, v| (acc.0 + v.0, acc.1 + v.1));

        PoolMetrics {
            pool_name: self.inner.name.clone(),
            created_clients: created,
            idle_clients: idle_count,
            max_connections: self.inner.config.max_connections,
            in_use,
            total_requests,
            total_errors,
            circuit_state: self.inner.breaker.state(),
        }
    }

    pub fn health(&self) -> HealthStatus {
        let m = self.metrics();
        let utilization = if m.max_connections == 0 {
            0.0
        } else {
            m.in_use as f64 / m.max_connections as f64
        };
        if m.circuit_state == CircuitState::Open || utilization > 0.90 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }
}

/// Named collection of [`HttpClientPool`]s, keyed by logical destination.
pub struct HttpClientPoolManager {
    pools: DashMap<String, Arc<HttpClientPool>>,
    default_config: HttpPoolConfig,
}

impl HttpClientPoolManager {
    pub fn new(default_config: HttpPoolConfig) -> Self {
        Self {
            pools: DashMap::new(),
            default_config,
        }
    }

    pub fn create_pool(&self, name: impl Into<String>, config: HttpPoolConfig) {
        let name = name.into();
        self.pools
            .insert(name.clone(), Arc::new(HttpClientPool::new(name, config)));
    }

    fn resolve(&self, pool_name: &str) -> Result<Arc<HttpClientPool>, PoolError> {
        if let Some(pool) = self.pools.get(pool_name) {
            return Ok(pool.clone());
        }
        if self.default_config.enable_auto_pool_creation {
            self.create_pool(pool_name, self.default_config.clone());
            return Ok(self.pools.get(pool_name).unwrap().clone());
        }
        Err(PoolError::UnknownPool(pool_name.to_string()))
    }

    pub async fn get(&self, pool_name: &str, timeout: Duration) -> Result<ClientHandle, PoolError> {
        self.resolve(pool_name)?.get(timeout).await
    }

    pub fn warm_up(&self, pool_name: &str, n: u32) -> Result<(), PoolError> {
        self.resolve(pool_name)?.warm_up(n);
        Ok(())
    }

    pub fn metrics(&self, pool_name: &str) -> Result<PoolMetrics, PoolError> {
        Ok(self.resolve(pool_name)?.metrics())
    }

    pub fn all_metrics(&self) -> Vec<PoolMetrics> {
        self.pools.iter().map(|p| p.metrics()).collect()
    }

    pub fn health(&self, pool_name: &str) -> Result<HealthStatus, PoolError> {
        Ok(self.resolve(pool_name)?.health())
    }

    pub fn check_health(&self) -> Vec<(String, HealthStatus)> {
        self.pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().health()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_pool_config() -> HttpPoolConfig {
        HttpPoolConfig {
            max_connections: 2,
            request_timeout_ms: 2_000,
            max_retries: 2,
            circuit_breaker_threshold: 3,
            circuit_breaker_timeout_seconds: 30,
            enable_compression: true,
            enable_auto_pool_creation: false,
            default_headers: Default::default(),
        }
    }

    #[tokio::test]
    async fn get_respects_max_connections_and_timeout() {
        let pool = HttpClientPool::new("test".into(), test_pool_config());
        let h1 = pool.get(Duration::from_millis(50)).await.unwrap();
        let h2 = pool.get(Duration::from_millis(50)).await.unwrap();
        let timed_out = pool.get(Duration::from_millis(20)).await;
        assert!(matches!(timed_out, Err(PoolError::TimedOut)));
        drop(h1);
        drop(h2);
    }

    #[tokio::test]
    async fn unhealthy_handle_is_not_returned_to_idle() {
        let pool = HttpClientPool::new("test".into(), test_pool_config());
        let handle = pool.get(Duration::from_millis(50)).await.unwrap();
        handle.mark_unhealthy();
        drop(handle);
        assert_eq!(pool.metrics().idle_clients, 0);
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let pool = HttpClientPool::new("test".into(), test_pool_config());
        let handle = pool.get(Duration::from_millis(50)).await.unwrap();
        let req = handle
            .client()
            .get(format!("{}/flaky", server.uri()))
            .build()
            .unwrap();
        let response = handle
            .execute_with_retry(req, Priority::Critical)
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn manager_rejects_unknown_pool_without_auto_creation() {
        let manager = HttpClientPoolManager::new(test_pool_config());
        let result = manager.get("missing", Duration::from_millis(10)).await;
        assert!(matches!(result, Err(PoolError::UnknownPool(_))));
    }

    #[tokio::test]
    async fn manager_auto_creates_pool_when_enabled() {
        let mut config = test_pool_config();
        config.enable_auto_pool_creation = true;
        let manager = HttpClientPoolManager::new(config);
        let handle = manager.get("auto", Duration::from_millis(50)).await;
        assert!(handle.is_ok());
    }
}
