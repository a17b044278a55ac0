//! # Retry Policy
//!
//! Which backend responses are worth another attempt, and how long to wait
//! between attempts. Only methods listed in `methods` are retried; everything
//! else gets exactly one attempt.

use axum::http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub retries: u32,

    /// Backend statuses treated as transient
    pub statuses: Vec<u16>,

    /// Methods eligible for retry (upper case)
    pub methods: Vec<String>,

    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            statuses: vec![
                StatusCode::BAD_GATEWAY.as_u16(),
                StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            ],
            methods: vec![Method::GET.to_string()],
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, never retried
    pub fn disabled() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Total attempts allowed for `method`
    pub fn max_attempts(&self, method: &Method) -> u32 {
        if self.allows_method(method) {
            self.retries + 1
        } else {
            1
        }
    }

    pub fn allows_method(&self, method: &Method) -> bool {
        self.methods
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(method.as_str()))
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.statuses.contains(&status.as_u16())
    }

    /// Wait before attempt number `attempt` (1-based retry counter)
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32 - 1);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        std::cmp::min(Duration::from_millis(millis as u64), self.max_backoff)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.backoff_multiplier < 1.0 {
            errors.push(format!(
                "resilience.retry.backoff_multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        for status in &self.statuses {
            if StatusCode::from_u16(*status).is_err() {
                errors.push(format!("resilience.retry.statuses contains invalid status {}", status));
            }
        }
        for method in &self.methods {
            if Method::from_bytes(method.as_bytes()).is_err() {
                errors.push(format!("resilience.retry.methods contains invalid method '{}'", method));
            }
        }
        errors
    }
}
