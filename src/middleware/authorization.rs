//! Authorization stage: applies the access policy and injects identity headers.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::auth::policy::AccessPolicy;
use crate::core::error::GatewayResult;
use crate::core::types::{
    IncomingRequest, RequestContext, AUTH_ROLES_HEADER, AUTH_USER_HEADER, AUTH_VALIDATED_HEADER,
};
use crate::middleware::pipeline::{Stage, StageResult};

pub const AUTHORIZATION_ORDER: i32 = 30;

/// Identity headers only the gateway may set
const IDENTITY_HEADERS: [&str; 3] = [AUTH_USER_HEADER, AUTH_ROLES_HEADER, AUTH_VALIDATED_HEADER];

#[derive(Debug, Clone)]
pub struct AuthorizationStage {
    policy: AccessPolicy,
}

impl AuthorizationStage {
    pub fn new(policy: AccessPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Stage for AuthorizationStage {
    fn name(&self) -> &str {
        "authorization"
    }

    fn order(&self) -> i32 {
        AUTHORIZATION_ORDER
    }

    async fn process_request(
        &self,
        mut request: IncomingRequest,
        context: &mut RequestContext,
    ) -> GatewayResult<StageResult> {
        for name in IDENTITY_HEADERS {
            if request.headers.remove(name).is_some() {
                warn!(
                    header = name,
                    path = %request.path(),
                    correlation_id = %context.correlation_id,
                    "Dropped client-supplied identity header"
                );
            }
        }

        let authorized = self.policy.authorize(&request).map_err(|err| {
            debug!(
                path = %request.path(),
                method = %request.method,
                correlation_id = %context.correlation_id,
                reason = %err,
                "Request not authorized"
            );
            err
        })?;

        authorized.apply(&mut request);
        context.principal = authorized.principal;
        context.route = Some(authorized.decision);
        Ok(StageResult::Continue(request))
    }
}
