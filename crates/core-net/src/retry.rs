//! Per-request retry policy applied inside a pooled client.

use core_common::Priority;
use rand::Rng;
use reqwest::StatusCode;
use std::time::Duration;

/// `(base, cap)` for exponential backoff, keyed by event priority.
fn backoff_bounds(priority: Priority) -> (Duration, Duration) {
    match priority {
        Priority::Critical => (Duration::from_millis(100), Duration::from_secs(1)),
        Priority::High => (Duration::from_millis(250), Duration::from_secs(3)),
        Priority::Normal => (Duration::from_millis(500), Duration::from_secs(5)),
        Priority::Low => (Duration::from_secs(1), Duration::from_secs(10)),
    }
}

/// `base * 2^attempt`, capped, with up to 10% jitter added.
pub fn backoff_delay(priority: Priority, attempt: u32) -> Duration {
    let (base, cap) = backoff_bounds(priority);
    let exp = 2u32.saturating_pow(attempt.min(20));
    let scaled = base.saturating_mul(exp).min(cap);

    let jitter_frac: f64 = rand::thread_rng().gen_range(0.0..0.10);
    let jitter = Duration::from_secs_f64(scaled.as_secs_f64() * jitter_frac);
    scaled + jitter
}

/// Whether a response status warrants a retry. 4xx other than 408/429 is
/// always terminal.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// Transport-level failures (connect refused, timeout, DNS) are always
/// retryable; a `reqwest::Error` carrying a status is handled by the
/// caller via [`is_retryable_status`] instead.
pub fn is_retryable_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || (err.is_request() && err.status().is_none())
}
