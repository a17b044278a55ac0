//! Logging stage: correlation id on the way in, one completion line on the way out.

use async_trait::async_trait;
use axum::http::HeaderValue;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::error::GatewayResult;
use crate::core::types::{
    GatewayResponse, IncomingRequest, RequestContext, REQUEST_ID_HEADER, RESPONSE_TIME_HEADER,
};
use crate::middleware::pipeline::{Stage, StageResult};
use crate::observability::metrics::record_request;

pub const REQUEST_LOGGING_ORDER: i32 = 10;

#[derive(Debug, Clone)]
pub struct RequestLoggingStage {
    slow_threshold: Duration,
}

impl RequestLoggingStage {
    pub fn new(slow_threshold: Duration) -> Self {
        Self { slow_threshold }
    }
}

#[async_trait]
impl Stage for RequestLoggingStage {
    fn name(&self) -> &str {
        "request_logging"
    }

    fn order(&self) -> i32 {
        REQUEST_LOGGING_ORDER
    }

    async fn process_request(
        &self,
        mut request: IncomingRequest,
        context: &mut RequestContext,
    ) -> GatewayResult<StageResult> {
        debug!(
            method = %request.method,
            path = %request.path(),
            correlation_id = %context.correlation_id,
            client = ?request.remote_addr,
            "Incoming request"
        );

        if let Ok(value) = HeaderValue::from_str(&context.correlation_id) {
            request.set_header(REQUEST_ID_HEADER, value);
        }
        Ok(StageResult::Continue(request))
    }

    async fn process_response(
        &self,
        mut response: GatewayResponse,
        context: &RequestContext,
    ) -> GatewayResponse {
        let elapsed = context.elapsed();
        let duration_ms = elapsed.as_millis() as u64;

        info!(
            method = %context.method,
            path = %context.path,
            correlation_id = %context.correlation_id,
            status = response.status.as_u16(),
            duration_ms,
            "Request completed"
        );
        if elapsed >= self.slow_threshold {
            warn!(
                path = %context.path,
                correlation_id = %context.correlation_id,
                duration_ms,
                threshold_ms = self.slow_threshold.as_millis() as u64,
                "Slow request detected"
            );
        }
        record_request(response.status.as_u16(), elapsed);

        response
            .headers
            .insert(RESPONSE_TIME_HEADER, HeaderValue::from(duration_ms));
        if let Ok(value) = HeaderValue::from_str(&context.correlation_id) {
            response.headers.insert(REQUEST_ID_HEADER, value);
        }
        response
    }
}
