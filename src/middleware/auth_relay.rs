//! Header relay stage: marks requests whose bearer credential the gateway relays.
//!
//! Authentication is not enforced here; that is the authorization stage's job.

use async_trait::async_trait;
use axum::http::HeaderValue;
use tracing::debug;

use crate::core::error::GatewayResult;
use crate::core::types::{
    IncomingRequest, RequestContext, AUTH_RELAYED_HEADER, GATEWAY_AUTH_TIME_HEADER,
};
use crate::middleware::pipeline::{Stage, StageResult};

pub const AUTH_RELAY_ORDER: i32 = 20;

#[derive(Debug, Clone, Default)]
pub struct AuthRelayStage;

impl AuthRelayStage {
    pub fn new() -> Self {
        Self
    }

    /// Mark `request` as relayed if it carries a bearer credential.
    /// Headers are replaced, never appended, so applying this twice is harmless.
    pub fn relay(request: &mut IncomingRequest) -> bool {
        if request.bearer_token().is_none() {
            return false;
        }
        request.set_header(AUTH_RELAYED_HEADER, HeaderValue::from_static("true"));
        let now_ms = chrono::Utc::now().timestamp_millis();
        request.set_header(GATEWAY_AUTH_TIME_HEADER, HeaderValue::from(now_ms));
        true
    }
}

#[async_trait]
impl Stage for AuthRelayStage {
    fn name(&self) -> &str {
        "auth_relay"
    }

    fn order(&self) -> i32 {
        AUTH_RELAY_ORDER
    }

    async fn process_request(
        &self,
        mut request: IncomingRequest,
        _context: &mut RequestContext,
    ) -> GatewayResult<StageResult> {
        if Self::relay(&mut request) {
            debug!(path = %request.path(), "Authorization header present, relaying");
        }
        Ok(StageResult::Continue(request))
    }
}
