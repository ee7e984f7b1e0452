//! Shared domain types for the event-processing runtime.
//!
//! Every other crate in the workspace depends on this one for the handful of
//! types that cross component boundaries: the `Event` itself, its `Priority`,
//! the snapshot types each component publishes, and structured logging setup.

pub mod logging;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Event priority. Higher numeric value sorts first in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    Low = 25,
    Normal = 50,
    High = 75,
    Critical = 100,
}

impl Priority {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// The immutable unit flowing through the pipeline.
///
/// `payload` is opaque to the core; only `id`, `priority`, and the
/// timestamps are inspected by the queue and balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub priority: Priority,
    pub payload: bytes::Bytes,
    #[serde(default)]
    pub retry_count: u32,
}

impl Event {
    pub fn new(id: impl Into<String>, priority: Priority, payload: bytes::Bytes) -> Self {
        Self {
            id: id.into(),
            enqueued_at: chrono::Utc::now(),
            priority,
            payload,
            retry_count: 0,
        }
    }

    pub fn age(&self) -> chrono::Duration {
        chrono::Utc::now() - self.enqueued_at
    }
}

/// Outcome of handing an event to a `Processor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Success,
    RetryableFailure(String),
    PermanentFailure(String),
}

/// Snapshot of `EventQueue` state, recomputed on demand.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub current_size: u64,
    pub max_size: u64,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_dead_lettered: u64,
    pub total_dropped: u64,
    pub avg_wait_time_ms: f64,
    pub enqueue_rate: f64,
    pub dequeue_rate: f64,
    pub events_being_processed: u64,
    pub dead_letter_size: u64,
    pub utilization_percent: f64,
}

/// Lifecycle status of a processing instance, independent of its health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Health verdict assigned by the `HealthMonitor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus::Unknown
    }
}

/// Live metrics reported by or about a processing instance.
///
/// All rates are computed over a rolling window (default 60s, see
/// `core-health`'s probe loop for the producer of this type).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    pub queue_depth: u64,
    pub events_processed_per_second: f64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Default for InstanceMetrics {
    fn default() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            error_rate: 0.0,
            avg_response_time_ms: 0.0,
            queue_depth: 0,
            events_processed_per_second: 0.0,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Percentile/avg/min/max summary over a window of duration samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingTimeMetrics {
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub sample_count: u64,
}

impl Default for ProcessingTimeMetrics {
    fn default() -> Self {
        Self {
            avg_ms: 0.0,
            min_ms: 0,
            max_ms: 0,
            p50_ms: 0,
            p95_ms: 0,
            p99_ms: 0,
            sample_count: 0,
        }
    }
}

impl ProcessingTimeMetrics {
    /// Compute avg/min/max/percentiles from raw millisecond durations.
    /// `durations` need not be pre-sorted.
    pub fn from_durations(durations: &[u64]) -> Self {
        if durations.is_empty() {
            return Self::default();
        }
        let mut sorted = durations.to_vec();
        sorted.sort_unstable();

        let sum: u64 = sorted.iter().sum();
        let count = sorted.len() as u64;

        Self {
            avg_ms: sum as f64 / count as f64,
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
            p50_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
            sample_count: count,
        }
    }
}

/// Nearest-rank percentile over already-sorted data.
pub fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let idx = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Reason an event was moved to the dead letter area, or a circuit/queue
/// rejection surfaced to a caller. Named by kind rather than by the type
/// that raised it, so components can log/count them uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Expired,
    QueueFull,
    NoCapacity,
    ProcessingRetryable,
    ProcessingPermanent,
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::Expired => "expired",
            FailureReason::QueueFull => "queue_full",
            FailureReason::NoCapacity => "no_capacity",
            FailureReason::ProcessingRetryable => "processing_retryable",
            FailureReason::ProcessingPermanent => "processing_permanent",
            FailureReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Convert a millisecond count to a `Duration`, saturating rather than
/// panicking on overflow (config values are operator-supplied).
pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// A cooperative cancellation signal shared between a caller and whatever
/// blocking call it hands the token to (queue dequeue, pool handle
/// acquisition, health probes). Cloning shares the same underlying signal.
#[derive(Clone)]
pub struct CancelToken {
    notify: std::sync::Arc<tokio::sync::Notify>,
    cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            notify: std::sync::Arc::new(tokio::sync::Notify::new()),
            cancelled: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called. Resolves immediately if
    /// already cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_is_numeric() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn percentile_matches_known_values() {
        let sorted: Vec<u64> = (1..=10).collect();
        assert_eq!(percentile(&sorted, 50.0), 6);
        assert_eq!(percentile(&sorted, 0.0), 1);
        assert_eq!(percentile(&sorted, 100.0), 10);
    }

    #[test]
    fn processing_time_metrics_from_empty_is_default() {
        let m = ProcessingTimeMetrics::from_durations(&[]);
        assert_eq!(m.sample_count, 0);
    }
}
