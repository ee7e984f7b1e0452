//! Bounded priority queue with dead-letter overflow and age expiry.
//!
//! Entries sort by `(priority desc, enqueuedAt asc)`; ties are never broken
//! by identity. A blocking [`EventQueue::dequeue`] drains expired entries to
//! the dead-letter ring before serving the next event. See `core-config`'s
//! `QueueConfig` for the tunables referenced below.

use chrono::Utc;
use core_common::{CancelToken, Event, FailureReason, Priority, QueueMetrics};
use core_config::QueueConfig;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

/// A dead-lettered event: why it left the live queue, and when.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub event: Event,
    pub reason: FailureReason,
    pub dead_lettered_at: chrono::DateTime<Utc>,
}

#[derive(Debug)]
struct QueueEntry {
    event: Event,
    sequence: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    /// Higher priority sorts greater (popped first). Within the same
    /// priority, the *earlier* `enqueued_at` sorts greater, so `BinaryHeap`
    /// (a max-heap) yields strict `(priority desc, enqueuedAt asc)` order.
    fn cmp(&self, other: &Self) -> Ordering {
        self.event
            .priority
            .cmp(&other.event.priority)
            .then_with(|| other.event.enqueued_at.cmp(&self.event.enqueued_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Synchronous observer fan-out, invoked after state commit and never while
/// holding the queue's internal lock. Handlers must not block.
pub trait QueueObserver: Send + Sync {
    fn on_event_enqueued(&self, _event: &Event) {}
    fn on_event_dequeued(&self, _event: &Event) {}
    fn on_queue_size_changed(&self, _old_size: u64, _new_size: u64) {}
}

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    QueueFull,
}

#[derive(Debug)]
pub enum DequeueOutcome {
    Event(Event),
    Timeout,
    Cancelled,
}

struct Inner {
    heap: BinaryHeap<QueueEntry>,
    dead_letter: VecDeque<DeadLetterEntry>,
}

pub struct EventQueue {
    config: QueueConfig,
    inner: Mutex<Inner>,
    notify: Notify,
    sequence: AtomicU64,

    total_enqueued: AtomicU64,
    total_dequeued: AtomicU64,
    total_dead_lettered: AtomicU64,
    total_dropped: AtomicU64,
    events_being_processed: AtomicU64,

    enqueue_timestamps: Mutex<VecDeque<Instant>>,
    dequeue_timestamps: Mutex<VecDeque<Instant>>,
    wait_time_samples_ms: Mutex<VecDeque<u64>>,
    last_size_band: AtomicU64,

    observers: Mutex<Vec<Arc<dyn QueueObserver>>>,
}

const RATE_WINDOW: Duration = Duration::from_secs(60);
const WAIT_TIME_SAMPLE_CAP: usize = 1_000;

impl EventQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                dead_letter: VecDeque::new(),
            }),
            notify: Notify::new(),
            sequence: AtomicU64::new(0),
            total_enqueued: AtomicU64::new(0),
            total_dequeued: AtomicU64::new(0),
            total_dead_lettered: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            events_being_processed: AtomicU64::new(0),
            enqueue_timestamps: Mutex::new(VecDeque::new()),
            dequeue_timestamps: Mutex::new(VecDeque::new()),
            wait_time_samples_ms: Mutex::new(VecDeque::new()),
            last_size_band: AtomicU64::new(0),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn register_observer(&self, observer: Arc<dyn QueueObserver>) {
        self.observers.lock().push(observer);
    }

    fn max_event_age(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.config.max_event_age_minutes as i64)
    }

    /// Non-blocking. Drops the event and returns `QueueFull` when the queue
    /// is at `maxQueueSize`.
    pub fn enqueue(&self, event: Event) -> EnqueueOutcome {
        let (old_size, new_size) = {
            let mut inner = self.inner.lock();
            if inner.heap.len() as u64 >= self.config.max_queue_size {
                self.total_dropped.fetch_add(1, AtomicOrdering::Relaxed);
                return EnqueueOutcome::QueueFull;
            }
            let old_size = inner.heap.len() as u64;
            let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
            inner.heap.push(QueueEntry {
                event: event.clone(),
                sequence,
            });
            (old_size, inner.heap.len() as u64)
        };

        self.total_enqueued.fetch_add(1, AtomicOrdering::Relaxed);
        self.record_timestamp(&self.enqueue_timestamps);
        self.notify.notify_one();

        for observer in self.observers.lock().iter() {
            observer.on_event_enqueued(&event);
        }
        self.maybe_fire_size_changed(old_size, new_size);

        EnqueueOutcome::Accepted
    }

    /// Blocks up to `timeout` waiting for an event. Ages out expired
    /// entries to the dead-letter ring before serving the next one.
    pub async fn dequeue(&self, timeout: Duration) -> DequeueOutcome {
        self.dequeue_cancellable(timeout, &CancelToken::new()).await
    }

    pub async fn dequeue_cancellable(&self, timeout: Duration, cancel: &CancelToken) -> DequeueOutcome {
        let deadline = Instant::now() + timeout;

        loop {
            if cancel.is_cancelled() {
                return DequeueOutcome::Cancelled;
            }

            let popped = {
                let mut inner = self.inner.lock();
                self.expire_locked(&mut inner);
                inner.heap.pop()
            };

            if let Some(entry) = popped {
                return self.finish_dequeue(entry.event);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return DequeueOutcome::Timeout;
            }

            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => continue,
                _ = cancel.cancelled() => return DequeueOutcome::Cancelled,
                _ = tokio::time::sleep(remaining) => return DequeueOutcome::Timeout,
            }
        }
    }

    fn finish_dequeue(&self, event: Event) -> DequeueOutcome {
        self.total_dequeued.fetch_add(1, AtomicOrdering::Relaxed);
        self.events_being_processed.fetch_add(1, AtomicOrdering::Relaxed);
        self.record_timestamp(&self.dequeue_timestamps);

        let wait_ms = event.age().num_milliseconds().max(0) as u64;
        {
            let mut samples = self.wait_time_samples_ms.lock();
            samples.push_back(wait_ms);
            while samples.len() > WAIT_TIME_SAMPLE_CAP {
                samples.pop_front();
            }
        }

        for observer in self.observers.lock().iter() {
            observer.on_event_dequeued(&event);
        }

        DequeueOutcome::Event(event)
    }

    /// Non-destructive peek at the highest-priority event, if any.
    pub fn peek(&self) -> Option<Event> {
        let inner = self.inner.lock();
        inner.heap.peek().map(|entry| entry.event.clone())
    }

    /// Called by a worker once an event completes successfully.
    pub fn complete_processing(&self) {
        self.events_being_processed.fetch_sub(1, AtomicOrdering::Relaxed);
    }

    /// Moves an event out of processing into the dead-letter ring.
    /// Decrements `eventsBeingProcessed` (the event was dequeued).
    pub fn dead_letter(&self, event: Event, reason: FailureReason) {
        self.events_being_processed.fetch_sub(1, AtomicOrdering::Relaxed);
        let mut inner = self.inner.lock();
        self.push_dead_letter_locked(&mut inner, event, reason);
    }

    /// Returns a retryable event to the queue with its `retryCount`
    /// incremented, keeping the same priority. The caller is responsible
    /// for the `retryCount > maxRetries` decision (see `max_retries`).
    pub fn requeue(&self, mut event: Event) -> EnqueueOutcome {
        self.events_being_processed.fetch_sub(1, AtomicOrdering::Relaxed);
        event.retry_count += 1;
        self.enqueue(event)
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    fn push_dead_letter_locked(&self, inner: &mut Inner, event: Event, reason: FailureReason) {
        if !self.config.dead_letter_enabled {
            self.total_dead_lettered.fetch_add(1, AtomicOrdering::Relaxed);
            return;
        }
        inner.dead_letter.push_back(DeadLetterEntry {
            event,
            reason,
            dead_lettered_at: Utc::now(),
        });
        while inner.dead_letter.len() as u64 > self.config.dead_letter_capacity {
            inner.dead_letter.pop_front();
        }
        self.total_dead_lettered.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Drains entries older than `maxEventAge` to the dead-letter ring.
    /// Called with the lock already held, at the start of every dequeue.
    fn expire_locked(&self, inner: &mut Inner) {
        if inner.heap.is_empty() {
            return;
        }
        let cutoff = Utc::now() - self.max_event_age();
        let mut expired = Vec::new();
        let remaining: BinaryHeap<QueueEntry> = inner
            .heap
            .drain()
            .filter_map(|entry| {
                if entry.event.enqueued_at < cutoff {
                    expired.push(entry.event);
                    None
                } else {
                    Some(entry)
                }
            })
            .collect();
        inner.heap = remaining;

        for event in expired {
            debug!(event_id = %event.id, "event expired before dequeue");
            self.push_dead_letter_locked(inner, event, FailureReason::Expired);
        }
    }

    /// Empties the live queue; dead-letter ring is untouched.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.heap.clear();
    }

    fn record_timestamp(&self, store: &Mutex<VecDeque<Instant>>) {
        let now = Instant::now();
        let mut timestamps = store.lock();
        timestamps.push_back(now);
        while timestamps
            .front()
            .map(|t| now.duration_since(*t) > RATE_WINDOW)
            .unwrap_or(false)
        {
            timestamps.pop_front();
        }
    }

    fn rate_per_second(&self, store: &Mutex<VecDeque<Instant>>) -> f64 {
        let now = Instant::now();
        let mut timestamps = store.lock();
        while timestamps
            .front()
            .map(|t| now.duration_since(*t) > RATE_WINDOW)
            .unwrap_or(false)
        {
            timestamps.pop_front();
        }
        timestamps.len() as f64 / RATE_WINDOW.as_secs_f64()
    }

    fn maybe_fire_size_changed(&self, old_size: u64, new_size: u64) {
        if self.config.max_queue_size == 0 {
            return;
        }
        let band = |size: u64| (size * 10 / self.config.max_queue_size).min(10);
        let new_band = band(new_size);
        let old_band = self.last_size_band.swap(new_band, AtomicOrdering::Relaxed);
        if new_band != old_band {
            for observer in self.observers.lock().iter() {
                observer.on_queue_size_changed(old_size, new_size);
            }
        }
    }

    pub fn metrics(&self) -> QueueMetrics {
        let (current_size, dead_letter_size) = {
            let inner = self.inner.lock();
            (inner.heap.len() as u64, inner.dead_letter.len() as u64)
        };

        let avg_wait_time_ms = {
            let samples = self.wait_time_samples_ms.lock();
            if samples.is_empty() {
                0.0
            } else {
                samples.iter().sum::<u64>() as f64 / samples.len() as f64
            }
        };

        QueueMetrics {
            current_size,
            max_size: self.config.max_queue_size,
            total_enqueued: self.total_enqueued.load(AtomicOrdering::Relaxed),
            total_dequeued: self.total_dequeued.load(AtomicOrdering::Relaxed),
            total_dead_lettered: self.total_dead_lettered.load(AtomicOrdering::Relaxed),
            total_dropped: self.total_dropped.load(AtomicOrdering::Relaxed),
            avg_wait_time_ms,
            enqueue_rate: self.rate_per_second(&self.enqueue_timestamps),
            dequeue_rate: self.rate_per_second(&self.dequeue_timestamps),
            events_being_processed: self.events_being_processed.load(AtomicOrdering::Relaxed),
            dead_letter_size,
            utilization_percent: current_size as f64 / self.config.max_queue_size as f64 * 100.0,
        }
    }

    pub fn dead_letter_entries(&self) -> Vec<DeadLetterEntry> {
        self.inner.lock().dead_letter.iter().cloned().collect()
    }

    /// Count of live entries at `Priority::High` or above.
    pub fn high_priority_depth(&self) -> u64 {
        self.inner
            .lock()
            .heap
            .iter()
            .filter(|entry| entry.event.priority >= Priority::High)
            .count() as u64
    }
}

fn _assert_priority_values() {
    let _ = Priority::Critical;
}
