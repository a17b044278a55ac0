//! # Dispatch Stage
//!
//! Last stage of the pipeline: routes the request to its backend under the
//! route's resilience policy.
//!
//! 1. resolve the backend's addresses through discovery
//! 2. ask the route's circuit breaker for admission
//! 3. forward with retries, the whole retried call bounded by the breaker
//!    profile's timeout
//! 4. record exactly one outcome in the breaker
//! 5. answer with the backend response, or with the route's fallback
//!
//! Backend responses are buffered completely before anything is returned, so a
//! retry can never follow bytes already written to the client.

use async_trait::async_trait;
use axum::http::HeaderValue;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::core::circuit_breaker::CircuitBreakerRegistry;
use crate::core::error::{GatewayError, GatewayResult, RoutingError};
use crate::core::retry::RetryPolicy;
use crate::core::types::{
    CallOutcome, GatewayResponse, IncomingRequest, RequestContext, GATEWAY_SOURCE_HEADER,
};
use crate::discovery::{RoundRobin, ServiceDiscovery};
use crate::gateway::fallback::FallbackResponder;
use crate::gateway::upstream::Upstream;
use crate::middleware::pipeline::{Stage, StageResult};
use crate::observability::metrics::record_retry;
use crate::routing::router::RouteTable;

pub const DISPATCH_ORDER: i32 = 40;

/// Result of the retried backend call
enum CallResult {
    Response(GatewayResponse, Url),
    Failed(GatewayError),
    Cancelled,
}

#[derive(Clone)]
pub struct DispatchStage {
    routes: Arc<RouteTable>,
    breakers: Arc<CircuitBreakerRegistry>,
    discovery: Arc<dyn ServiceDiscovery>,
    upstream: Arc<dyn Upstream>,
    fallbacks: Arc<FallbackResponder>,
    retry: RetryPolicy,
    balancer: Arc<RoundRobin>,
    gateway_source: Option<HeaderValue>,
}

impl std::fmt::Debug for DispatchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchStage")
            .field("retry", &self.retry)
            .field("gateway_source", &self.gateway_source)
            .finish_non_exhaustive()
    }
}

impl DispatchStage {
    pub fn new(
        routes: Arc<RouteTable>,
        breakers: Arc<CircuitBreakerRegistry>,
        discovery: Arc<dyn ServiceDiscovery>,
        upstream: Arc<dyn Upstream>,
        fallbacks: Arc<FallbackResponder>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            routes,
            breakers,
            discovery,
            upstream,
            fallbacks,
            retry,
            balancer: Arc::new(RoundRobin::new()),
            gateway_source: None,
        }
    }

    /// Value sent to backends in `X-Gateway-Source`
    pub fn with_gateway_source(mut self, source: &str) -> GatewayResult<Self> {
        let value = HeaderValue::from_str(source)
            .map_err(|_| GatewayError::config(format!("invalid gateway_source header value: {}", source)))?;
        self.gateway_source = Some(value);
        Ok(self)
    }

    fn fallback(&self, profile: &str, context: &RequestContext, reason: &RoutingError) -> StageResult {
        warn!(
            path = %context.path,
            correlation_id = %context.correlation_id,
            reason = %reason,
            "Serving fallback"
        );
        StageResult::Respond(self.fallbacks.respond(profile, &context.path))
    }

    async fn call_with_retry(
        &self,
        request: &IncomingRequest,
        backend_id: &str,
        instances: &[Url],
        path: &str,
        cancellation: &CancellationToken,
    ) -> CallResult {
        let max_attempts = self.retry.max_attempts(&request.method);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let Some(target) = self.balancer.pick(backend_id, instances) else {
                return CallResult::Failed(
                    RoutingError::NoBackendAvailable {
                        backend: backend_id.to_string(),
                    }
                    .into(),
                );
            };

            let result = tokio::select! {
                biased;
                _ = cancellation.cancelled() => return CallResult::Cancelled,
                result = self.upstream.send(target, request, path) => result,
            };

            let retry_reason = match &result {
                Ok(response) if self.retry.is_retryable_status(response.status) => {
                    format!("status {}", response.status.as_u16())
                }
                Err(err) if err.is_retryable() => err.to_string(),
                _ => String::new(),
            };

            if retry_reason.is_empty() {
                return match result {
                    Ok(response) => CallResult::Response(response, target.clone()),
                    Err(err) => CallResult::Failed(err),
                };
            }

            if attempt >= max_attempts {
                return match result {
                    // The final transient response is still the backend's answer
                    Ok(response) => CallResult::Response(response, target.clone()),
                    Err(err) => CallResult::Failed(
                        RoutingError::RetriesExhausted {
                            attempts: attempt,
                            last_error: err.to_string(),
                        }
                        .into(),
                    ),
                };
            }

            record_retry(backend_id);
            let delay = self.retry.backoff(attempt);
            debug!(
                backend = %backend_id,
                target = %target,
                attempt,
                reason = %retry_reason,
                delay_ms = delay.as_millis() as u64,
                "Retrying backend call"
            );
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => return CallResult::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[async_trait]
impl Stage for DispatchStage {
    fn name(&self) -> &str {
        "dispatch"
    }

    fn order(&self) -> i32 {
        DISPATCH_ORDER
    }

    async fn process_request(
        &self,
        mut request: IncomingRequest,
        context: &mut RequestContext,
    ) -> GatewayResult<StageResult> {
        let decision = match context.route.clone() {
            Some(decision) => decision,
            None => self.routes.classify(request.path(), &request.method),
        };

        let backend_id = decision.backend_id.clone().ok_or_else(|| RoutingError::NoRoute {
            path: request.path().to_string(),
        })?;
        let breaker_key = decision
            .breaker_key()
            .unwrap_or(backend_id.as_str())
            .to_string();
        let breaker_profile = decision.breaker_profile().map(str::to_string);
        let fallback_profile = decision.fallback_profile().to_string();
        let forward_path = decision.forward_path(request.path()).into_owned();
        context.route = Some(decision);

        if let Some(source) = &self.gateway_source {
            request.set_header(GATEWAY_SOURCE_HEADER, source.clone());
        }

        let instances = match self.discovery.resolve(&backend_id).await {
            Ok(instances) => instances,
            Err(err) => {
                warn!(backend = %backend_id, error = %err, "Discovery lookup failed");
                Vec::new()
            }
        };
        if instances.is_empty() {
            context.record_outcome(CallOutcome::Failure);
            let reason = RoutingError::NoBackendAvailable { backend: backend_id };
            return Ok(self.fallback(&fallback_profile, context, &reason));
        }

        let breaker = self
            .breakers
            .get_with_profile(&breaker_key, breaker_profile.as_deref());
        // Held until the outcome is recorded; dropping it early (cancellation,
        // panic, the request future being dropped) frees a HalfOpen trial slot.
        let Some(admission) = breaker.try_acquire() else {
            context.record_outcome(CallOutcome::Failure);
            let reason = RoutingError::BreakerOpen { breaker: breaker_key };
            return Ok(self.fallback(&fallback_profile, context, &reason));
        };

        let timeout = breaker.config().timeout;
        let started = Instant::now();
        let cancellation = context.cancellation.clone();
        let call = self.call_with_retry(&request, &backend_id, &instances, &forward_path, &cancellation);
        let result = tokio::time::timeout(timeout, call).await;
        let elapsed = started.elapsed();

        let (outcome, reason) = match result {
            Err(_) => (
                CallOutcome::Timeout,
                RoutingError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                },
            ),
            Ok(CallResult::Cancelled) => {
                // Client went away; this says nothing about the backend.
                drop(admission);
                info!(
                    backend = %backend_id,
                    correlation_id = %context.correlation_id,
                    "Request cancelled by client"
                );
                return Ok(StageResult::Respond(
                    self.fallbacks.respond(&fallback_profile, &context.path),
                ));
            }
            Ok(CallResult::Response(response, target)) if response.status.is_server_error() => {
                context.target = Some(target);
                (
                    CallOutcome::Failure,
                    RoutingError::RetriesExhausted {
                        attempts: self.retry.max_attempts(&request.method),
                        last_error: format!("backend answered {}", response.status.as_u16()),
                    },
                )
            }
            Ok(CallResult::Response(response, target)) => {
                admission.record(CallOutcome::Success, elapsed);
                context.record_outcome(CallOutcome::Success);
                context.target = Some(target);
                return Ok(StageResult::Respond(response));
            }
            Ok(CallResult::Failed(GatewayError::Routing(routing))) => (CallOutcome::Failure, routing),
            Ok(CallResult::Failed(other)) => (
                CallOutcome::Failure,
                RoutingError::RetriesExhausted {
                    attempts: 1,
                    last_error: other.to_string(),
                },
            ),
        };

        admission.record(outcome, elapsed);
        context.record_outcome(outcome);
        Ok(self.fallback(&fallback_profile, context, &reason))
    }
}
