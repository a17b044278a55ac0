//! # Core Types Module
//!
//! Request, response and per-request context types that flow through the
//! pipeline.
//!
//! ## Ownership
//!
//! - [`IncomingRequest`] is moved from stage to stage; each stage hands the
//!   (possibly rewritten) request to the next one.
//! - [`RequestContext`] is exclusively owned by the task serving one request
//!   and is never shared with other requests.
//! - Bodies are `Bytes`, so cloning a request for a retry attempt does not copy
//!   the payload.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::routing::router::RouteDecision;

/// Header carrying the correlation id to backends
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Authenticated subject injected for downstream services
pub const AUTH_USER_HEADER: &str = "x-auth-user";
/// Comma-joined role claims injected for downstream services
pub const AUTH_ROLES_HEADER: &str = "x-auth-roles";
/// Marker telling downstream services the gateway verified the token
pub const AUTH_VALIDATED_HEADER: &str = "x-auth-validated";
/// Set when an inbound bearer credential was relayed by the gateway
pub const AUTH_RELAYED_HEADER: &str = "x-auth-relayed";
/// Epoch milliseconds at which the gateway relayed the credential
pub const GATEWAY_AUTH_TIME_HEADER: &str = "x-gateway-auth-time";
/// Identifies the gateway instance to downstream services
pub const GATEWAY_SOURCE_HEADER: &str = "x-gateway-source";
/// Total time spent in the gateway, in milliseconds
pub const RESPONSE_TIME_HEADER: &str = "x-response-time";

/// Request as seen by the pipeline
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
}

impl IncomingRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            remote_addr: None,
        }
    }

    pub fn with_remote_addr(mut self, remote_addr: SocketAddr) -> Self {
        self.remote_addr = Some(remote_addr);
        self
    }

    /// Request path without the query string
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Get a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Token from an `Authorization: Bearer <token>` header
    pub fn bearer_token(&self) -> Option<&str> {
        self.header(axum::http::header::AUTHORIZATION.as_str())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    /// Set a header, replacing any previous values
    pub fn set_header(&mut self, name: &'static str, value: HeaderValue) {
        self.headers.insert(HeaderName::from_static(name), value);
    }
}

/// Response produced by a stage, the backend or the fallback responder
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Create a JSON response
    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Result<Self, serde_json::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let body = serde_json::to_vec(data)?;
        Ok(Self::new(status, headers, body))
    }
}

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Identity derived from a validated bearer token; lives for one request only
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub subject: String,
    pub roles: Vec<String>,
    pub issued_valid: bool,
}

impl Principal {
    pub fn roles_header_value(&self) -> String {
        self.roles.join(",")
    }
}

/// Final classification of a backend call, recorded once per request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    Failure,
    Timeout,
}

impl CallOutcome {
    pub fn is_failure(self) -> bool {
        !matches!(self, CallOutcome::Success)
    }
}

/// Per-request state created at pipeline entry
#[derive(Debug)]
pub struct RequestContext {
    pub correlation_id: String,
    pub start_time: Instant,
    pub method: Method,
    pub path: String,
    pub principal: Option<Principal>,
    pub route: Option<RouteDecision>,
    pub target: Option<Url>,
    pub cancellation: CancellationToken,
    outcome: Option<CallOutcome>,
}

impl RequestContext {
    pub fn new(cancellation: CancellationToken) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            start_time: Instant::now(),
            method: Method::GET,
            path: "/".to_string(),
            principal: None,
            route: None,
            target: None,
            cancellation,
            outcome: None,
        }
    }

    /// Context for `request`, started now
    pub fn for_request(request: &IncomingRequest, cancellation: CancellationToken) -> Self {
        Self {
            method: request.method.clone(),
            path: request.path().to_string(),
            ..Self::new(cancellation)
        }
    }

    /// Get elapsed time since request started
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Record the call outcome; later calls are ignored and return `false`
    pub fn record_outcome(&mut self, outcome: CallOutcome) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(outcome);
        true
    }

    pub fn outcome(&self) -> Option<CallOutcome> {
        self.outcome
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_auth(value: &str) -> IncomingRequest {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(value).unwrap(),
        );
        IncomingRequest::new(Method::GET, "/x".parse().unwrap(), headers, Bytes::new())
    }

    #[test]
    fn test_bearer_token_extraction() {
        assert_eq!(request_with_auth("Bearer abc.def").bearer_token(), Some("abc.def"));
        assert_eq!(request_with_auth("Basic dXNlcg==").bearer_token(), None);
        assert_eq!(request_with_auth("Bearer ").bearer_token(), None);
        assert_eq!(request_with_auth("bearer abc").bearer_token(), None);
    }

    #[test]
    fn test_outcome_recorded_once() {
        let mut context = RequestContext::default();
        assert!(context.record_outcome(CallOutcome::Failure));
        assert!(!context.record_outcome(CallOutcome::Success));
        assert_eq!(context.outcome(), Some(CallOutcome::Failure));
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        assert_ne!(
            RequestContext::default().correlation_id,
            RequestContext::default().correlation_id
        );
    }
}
