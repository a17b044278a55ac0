//! # Fallback Responder
//!
//! Canned degraded responses returned instead of a failed backend call.
//! Every profile answers 503 except `rate-limit`, which answers 429.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::core::types::GatewayResponse;
use crate::observability::metrics::record_fallback;

pub const DEFAULT_SUGGESTION: &str =
    "If this problem persists, please contact support@lifepill.com";

/// Name of the profile used when a requested profile is unknown
pub const SERVICE_PROFILE: &str = "service";

/// Alternate names accepted for built-in profiles: (alias, profile)
const PROFILE_ALIASES: &[(&str, &str)] = &[("rate-limited", "rate-limit")];

/// One kind of degraded response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackProfile {
    /// Machine-readable error code, e.g. `SERVICE_UNAVAILABLE`
    pub code: String,
    pub message: String,
    pub source: String,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default = "default_suggestion")]
    pub suggestion: String,
}

fn default_status() -> u16 {
    StatusCode::SERVICE_UNAVAILABLE.as_u16()
}

fn default_suggestion() -> String {
    DEFAULT_SUGGESTION.to_string()
}

impl FallbackProfile {
    fn unavailable(code: &str, message: &str, source: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
            source: source.to_string(),
            status: default_status(),
            suggestion: default_suggestion(),
        }
    }

    /// Built-in profiles keyed by name
    pub fn builtins() -> HashMap<String, FallbackProfile> {
        let mut profiles = HashMap::new();
        profiles.insert(
            SERVICE_PROFILE.to_string(),
            Self::unavailable(
                "SERVICE_UNAVAILABLE",
                "The requested service is temporarily unavailable. Please try again later.",
                "service",
            ),
        );
        profiles.insert(
            "auth".to_string(),
            Self::unavailable(
                "AUTH_SERVICE_UNAVAILABLE",
                "Authentication service is temporarily unavailable. Please try again in a few moments.",
                "auth",
            ),
        );
        profiles.insert(
            "user".to_string(),
            Self::unavailable(
                "USER_SERVICE_UNAVAILABLE",
                "User service is temporarily unavailable. Your data is safe. Please try again later.",
                "user",
            ),
        );
        profiles.insert(
            "rate-limit".to_string(),
            Self {
                status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
                ..Self::unavailable(
                    "RATE_LIMIT_EXCEEDED",
                    "Too many requests. Please slow down and try again later.",
                    "rate-limit",
                )
            },
        );
        profiles
    }

    /// 503 unless the profile is explicitly 429
    pub fn status_code(&self) -> StatusCode {
        if self.status == StatusCode::TOO_MANY_REQUESTS.as_u16() {
            StatusCode::TOO_MANY_REQUESTS
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// JSON body of a fallback response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackBody {
    pub success: bool,
    pub error: String,
    pub message: String,
    pub source: String,
    pub path: String,
    pub timestamp: String,
    pub suggestion: String,
}

#[derive(Debug, Clone)]
pub struct FallbackResponder {
    profiles: HashMap<String, FallbackProfile>,
}

impl Default for FallbackResponder {
    fn default() -> Self {
        Self {
            profiles: FallbackProfile::builtins(),
        }
    }
}

impl FallbackResponder {
    /// Built-ins overlaid with `custom`; a custom profile replaces a built-in of the same name
    pub fn new(custom: HashMap<String, FallbackProfile>) -> Self {
        let mut profiles = FallbackProfile::builtins();
        profiles.extend(custom);
        Self { profiles }
    }

    pub fn has_profile(&self, name: &str) -> bool {
        self.profile(name).is_some()
    }

    /// Profile registered as `name`, or the one `name` is an alias of
    pub fn profile(&self, name: &str) -> Option<&FallbackProfile> {
        self.profiles.get(name).or_else(|| {
            PROFILE_ALIASES
                .iter()
                .find(|(alias, _)| *alias == name)
                .and_then(|(_, target)| self.profiles.get(*target))
        })
    }

    pub fn profile_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Degraded response for `profile`, falling back to the `service` profile
    pub fn respond(&self, profile: &str, path: &str) -> GatewayResponse {
        let (name, selected) = match self.profile(profile) {
            Some(selected) => (profile, selected),
            None => match self.profiles.get(SERVICE_PROFILE) {
                Some(selected) => (SERVICE_PROFILE, selected),
                None => return Self::last_resort(path),
            },
        };

        warn!(profile = %name, path = %path, code = %selected.code, "Fallback triggered");
        record_fallback(name);

        let body = FallbackBody {
            success: false,
            error: selected.code.clone(),
            message: selected.message.clone(),
            source: selected.source.clone(),
            path: path.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            suggestion: selected.suggestion.clone(),
        };
        GatewayResponse::json(selected.status_code(), &body)
            .unwrap_or_else(|_| Self::last_resort(path))
    }

    fn last_resort(path: &str) -> GatewayResponse {
        let body = serde_json::json!({
            "success": false,
            "error": "SERVICE_UNAVAILABLE",
            "message": "The requested service is temporarily unavailable.",
            "source": SERVICE_PROFILE,
            "path": path,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "suggestion": DEFAULT_SUGGESTION,
        });
        GatewayResponse::new(
            StatusCode::SERVICE_UNAVAILABLE,
            axum::http::HeaderMap::new(),
            body.to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(response: &GatewayResponse) -> FallbackBody {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[test]
    fn test_service_fallback() {
        let response = FallbackResponder::default().respond("service", "/items/1");
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);

        let body = body(&response);
        assert!(!body.success);
        assert_eq!(body.error, "SERVICE_UNAVAILABLE");
        assert_eq!(body.path, "/items/1");
        assert_eq!(body.suggestion, DEFAULT_SUGGESTION);
        assert!(chrono::DateTime::parse_from_rfc3339(&body.timestamp).is_ok());
    }

    #[test]
    fn test_rate_limit_fallback_is_429() {
        let response = FallbackResponder::default().respond("rate-limit", "/x");
        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body(&response).error, "RATE_LIMIT_EXCEEDED");
    }

    #[test]
    fn test_rate_limited_alias_serves_rate_limit_profile() {
        let responder = FallbackResponder::default();
        assert!(responder.has_profile("rate-limited"));

        let response = responder.respond("rate-limited", "/fallback/rate-limited");
        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body(&response).error, "RATE_LIMIT_EXCEEDED");
    }

    #[test]
    fn test_unknown_profile_uses_service() {
        let response = FallbackResponder::default().respond("billing", "/bill");
        assert_eq!(body(&response).source, "service");
    }

    #[test]
    fn test_custom_profiles_override_builtins() {
        let mut custom = HashMap::new();
        custom.insert(
            "user".to_string(),
            FallbackProfile {
                code: "PROFILE_DOWN".into(),
                message: "Profiles are down".into(),
                source: "user".into(),
                status: 500,
                suggestion: "Try later".into(),
            },
        );
        let responder = FallbackResponder::new(custom);
        let response = responder.respond("user", "/me");

        // anything other than 429 is served as 503
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body(&response).error, "PROFILE_DOWN");
        assert!(responder.has_profile("auth"));
        assert_eq!(responder.profile_names(), vec!["auth", "rate-limit", "service", "user"]);
    }
}
