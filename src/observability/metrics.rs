//! Metric names and recording helpers.
//!
//! Recording goes through the `metrics` facade; the binary decides whether an
//! exporter is installed. Without one every call is a no-op.

use std::time::Duration;

pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
pub const BREAKER_TRANSITIONS_TOTAL: &str = "gateway_breaker_transitions_total";
pub const FALLBACKS_TOTAL: &str = "gateway_fallbacks_total";
pub const UPSTREAM_RETRIES_TOTAL: &str = "gateway_upstream_retries_total";

pub fn record_request(status: u16, duration: Duration) {
    metrics::counter!(REQUESTS_TOTAL, "status" => status.to_string()).increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS).record(duration.as_secs_f64());
}

pub fn record_fallback(kind: &str) {
    metrics::counter!(FALLBACKS_TOTAL, "kind" => kind.to_string()).increment(1);
}

pub fn record_retry(backend: &str) {
    metrics::counter!(UPSTREAM_RETRIES_TOTAL, "backend" => backend.to_string()).increment(1);
}
