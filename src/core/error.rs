//! # Error Handling Module
//!
//! Error taxonomy for the gateway, built with `thiserror`.
//!
//! Errors are grouped by the stage that raises them:
//! - [`AuthError`]: token verification failures inside the token validator
//! - [`AuthzError`]: authentication/authorization decisions (401 / 403)
//! - [`RoutingError`]: route resolution and resilience failures (fallback 503 / 429, or 404)
//! - [`GatewayError`]: the crate-wide error that wraps the above plus I/O,
//!   parsing and internal failures
//!
//! ## Rust Concepts Used
//!
//! - `#[from]` lets the `?` operator convert stage errors into `GatewayError`
//! - `IntoResponse` turns any `GatewayError` into the structured JSON error body
//! - Internal failures are logged with full detail but answered with a generic message

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::convert::Infallible;
use thiserror::Error;

use crate::auth::roles::Role;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Generic message returned for every 500; the real cause only goes to the log.
pub const INTERNAL_ERROR_MESSAGE: &str = "An unexpected error occurred. Please try again later.";

/// Token verification failures.
///
/// Never shown to clients verbatim: the authorization stage maps every variant
/// to a generic 401 message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Token could not be parsed or its signature does not verify
    #[error("malformed token: {0}")]
    Malformed(String),

    /// Expiration timestamp is at or before the current time
    #[error("token expired")]
    Expired,
}

/// Authentication and authorization decisions
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    /// No `Authorization` header, or it does not use the bearer scheme
    #[error("Missing or invalid Authorization header")]
    MissingCredential,

    /// Bearer token failed validation
    #[error("Invalid or expired token")]
    InvalidCredential(#[source] AuthError),

    /// Valid token, but no role reaches the route's minimum
    #[error("Access denied - Insufficient permissions")]
    InsufficientRole { required: Role },
}

impl AuthzError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingCredential | Self::InvalidCredential(_) => StatusCode::UNAUTHORIZED,
            Self::InsufficientRole { .. } => StatusCode::FORBIDDEN,
        }
    }
}

/// Route resolution and resilience failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Path matched no rule and no default backend is configured
    #[error("No route configured for path: {path}")]
    NoRoute { path: String },

    /// Discovery returned no reachable address for the backend
    #[error("No backend available for service: {backend}")]
    NoBackendAvailable { backend: String },

    /// Circuit breaker rejected the call without contacting the backend
    #[error("Circuit breaker open: {breaker}")]
    BreakerOpen { breaker: String },

    /// The whole (retried) call exceeded the per-call time limit
    #[error("Backend call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Every attempt failed with a transient status or a transport error
    #[error("Backend call failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl RoutingError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoRoute { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Crate-wide error type
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error(transparent)]
    Authorization(#[from] AuthzError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, network errors, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// HTTP client errors when making upstream requests
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authorization(err) => err.status_code(),
            Self::Routing(err) => err.status_code(),
            Self::Configuration { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Json { .. }
            | Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::HttpClient { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Transport-level failures that a retry may cure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::HttpClient { .. } | Self::Io { .. } | Self::Routing(RoutingError::Timeout { .. })
        )
    }

    /// Failures that count against the backend's circuit breaker
    pub fn should_trip_breaker(&self) -> bool {
        matches!(
            self,
            Self::HttpClient { .. }
                | Self::Io { .. }
                | Self::Routing(RoutingError::Timeout { .. })
                | Self::Routing(RoutingError::RetriesExhausted { .. })
        )
    }

    /// Message that is safe to show to a client
    pub fn public_message(&self) -> String {
        match self {
            Self::Authorization(err) => err.to_string(),
            Self::Routing(err) => err.to_string(),
            _ => INTERNAL_ERROR_MESSAGE.to_string(),
        }
    }

    /// Get a string representation of the error type for logs
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::Authorization(AuthzError::InsufficientRole { .. }) => "authorization_error",
            Self::Authorization(_) => "authentication_error",
            Self::Routing(_) => "routing_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::HttpClient { .. } => "http_client_error",
        }
    }
}

/// Body of every error the gateway produces itself: `{"code", "message", "data": null}`
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl ErrorBody {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code: status.as_u16(),
            message: message.into(),
            data: None,
        }
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE)
    }
}

impl From<Infallible> for GatewayError {
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, error_type = self.error_type(), "Request failed");
        }
        (status, Json(ErrorBody::new(status, self.public_message()))).into_response()
    }
}
