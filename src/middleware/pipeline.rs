//! # Request Pipeline
//!
//! Fixed, ordered chain of stages every proxied request passes through.
//!
//! ## Execution Model
//! - Stages run in ascending `order`. Each stage either hands the (possibly
//!   rewritten) request to the next one or answers the request itself.
//! - Errors are converted to a structured response where they happen; nothing
//!   escapes [`Pipeline::handle`].
//! - Every stage that saw the request gets to see the response, in reverse
//!   order. This is how the logging stage observes every completion.
//!
//! ## Rust Concepts Used
//! - `async_trait` for async trait methods
//! - `Arc<dyn Stage>` for dynamic dispatch over shared stage instances
//! - The request is moved between stages; the context is borrowed mutably

use async_trait::async_trait;
use axum::http::StatusCode;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::core::error::{ErrorBody, GatewayError, GatewayResult};
use crate::core::types::{GatewayResponse, IncomingRequest, RequestContext};

/// What a stage wants to happen next
#[derive(Debug)]
pub enum StageResult {
    /// Pass the request on to the next stage
    Continue(IncomingRequest),
    /// Stop the chain and answer with this response
    Respond(GatewayResponse),
}

/// One step of the pipeline
#[async_trait]
pub trait Stage: Send + Sync + fmt::Debug {
    /// Stage name for identification and logging
    fn name(&self) -> &str;

    /// Position in the chain; lower numbers run first
    fn order(&self) -> i32;

    async fn process_request(
        &self,
        request: IncomingRequest,
        context: &mut RequestContext,
    ) -> GatewayResult<StageResult>;

    /// Inspect or adjust the response on its way out
    async fn process_response(
        &self,
        response: GatewayResponse,
        _context: &RequestContext,
    ) -> GatewayResponse {
        response
    }
}

/// Structured error response for a failure raised inside the pipeline
pub fn error_response(err: &GatewayError) -> GatewayResponse {
    let status = err.status_code();
    if status.is_server_error() {
        error!(error = %err, error_type = err.error_type(), "Request failed");
    } else {
        debug!(error = %err, error_type = err.error_type(), "Request rejected");
    }

    GatewayResponse::json(status, &ErrorBody::new(status, err.public_message()))
        .unwrap_or_else(|_| {
            GatewayResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                Default::default(),
                "{\"code\":500,\"message\":\"Internal server error\",\"data\":null}",
            )
        })
}

/// Statically ordered stage chain
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Arc<Vec<Arc<dyn Stage>>>,
}

impl Pipeline {
    pub fn new(mut stages: Vec<Arc<dyn Stage>>) -> Self {
        // Stable sort: stages with equal order keep registration order
        stages.sort_by_key(|stage| stage.order());
        Self {
            stages: Arc::new(stages),
        }
    }

    /// Stage names in execution order
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Run `request` through every stage and produce the client response
    #[instrument(skip_all, fields(method = %request.method, path = %request.path()))]
    pub async fn handle(
        &self,
        request: IncomingRequest,
        cancellation: CancellationToken,
    ) -> GatewayResponse {
        let mut context = RequestContext::for_request(&request, cancellation);
        let mut request = request;
        let mut entered = 0;

        let mut response = None;
        for stage in self.stages.iter() {
            entered += 1;
            match stage.process_request(request, &mut context).await {
                Ok(StageResult::Continue(next)) => request = next,
                Ok(StageResult::Respond(reply)) => {
                    debug!(stage = stage.name(), status = %reply.status, "Stage answered request");
                    response = Some(reply);
                    break;
                }
                Err(err) => {
                    debug!(stage = stage.name(), error = %err, "Stage failed");
                    response = Some(error_response(&err));
                    break;
                }
            }
        }

        let mut response = response.unwrap_or_else(|| {
            error_response(&GatewayError::internal("pipeline completed without a response"))
        });

        for stage in self.stages[..entered].iter().rev() {
            response = stage.process_response(response, &context).await;
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{AuthzError, RoutingError};
    use axum::http::{HeaderMap, HeaderValue, Method};
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct Recorder {
        name: &'static str,
        order: i32,
        trail: Arc<Mutex<Vec<String>>>,
        action: Action,
    }

    #[derive(Debug, Clone, Copy)]
    enum Action {
        Continue,
        Respond,
        Fail,
    }

    #[async_trait]
    impl Stage for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn order(&self) -> i32 {
            self.order
        }

        async fn process_request(
            &self,
            mut request: IncomingRequest,
            _context: &mut RequestContext,
        ) -> GatewayResult<StageResult> {
            self.trail.lock().push(format!("in:{}", self.name));
            match self.action {
                Action::Continue => {
                    request.headers.append("x-trail", HeaderValue::from_static("seen"));
                    Ok(StageResult::Continue(request))
                }
                Action::Respond => Ok(StageResult::Respond(GatewayResponse::new(
                    StatusCode::OK,
                    HeaderMap::new(),
                    format!("{}", request.headers.get_all("x-trail").iter().count()),
                ))),
                Action::Fail => Err(AuthzError::MissingCredential.into()),
            }
        }

        async fn process_response(
            &self,
            response: GatewayResponse,
            _context: &RequestContext,
        ) -> GatewayResponse {
            self.trail.lock().push(format!("out:{}", self.name));
            response
        }
    }

    fn stage(name: &'static str, order: i32, action: Action, trail: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Stage> {
        Arc::new(Recorder {
            name,
            order,
            trail: Arc::clone(trail),
            action,
        })
    }

    fn request() -> IncomingRequest {
        IncomingRequest::new(Method::GET, "/x".parse().unwrap(), HeaderMap::new(), Bytes::new())
    }

    #[tokio::test]
    async fn test_stages_run_in_order_and_unwind_in_reverse() {
        let trail = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            stage("dispatch", 40, Action::Respond, &trail),
            stage("logging", 10, Action::Continue, &trail),
            stage("relay", 20, Action::Continue, &trail),
        ]);
        assert_eq!(pipeline.stage_names(), vec!["logging", "relay", "dispatch"]);

        let response = pipeline.handle(request(), CancellationToken::new()).await;
        assert_eq!(response.body, Bytes::from_static(b"2"));
        assert_eq!(
            *trail.lock(),
            vec!["in:logging", "in:relay", "in:dispatch", "out:dispatch", "out:relay", "out:logging"]
        );
    }

    #[tokio::test]
    async fn test_failure_short_circuits_with_error_body() {
        let trail = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            stage("logging", 10, Action::Continue, &trail),
            stage("authorization", 30, Action::Fail, &trail),
            stage("dispatch", 40, Action::Respond, &trail),
        ]);

        let response = pipeline.handle(request(), CancellationToken::new()).await;
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"code": 401, "message": "Missing or invalid Authorization header", "data": null})
        );
        assert_eq!(
            *trail.lock(),
            vec!["in:logging", "in:authorization", "out:authorization", "out:logging"]
        );
    }

    #[tokio::test]
    async fn test_chain_without_terminal_stage_is_internal_error() {
        let trail = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![stage("logging", 10, Action::Continue, &trail)]);

        let response = pipeline.handle(request(), CancellationToken::new()).await;
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["message"], crate::core::error::INTERNAL_ERROR_MESSAGE);
    }

    #[test]
    fn test_no_route_is_404() {
        let response = error_response(&RoutingError::NoRoute { path: "/nowhere".into() }.into());
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }
}
