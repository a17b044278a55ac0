//! # Access Policy
//!
//! Decides whether a request may proceed and, if it carries an identity, which
//! headers tell downstream services who the caller is.
//!
//! Order of checks:
//! 1. open routes pass anonymously
//! 2. a bearer credential must be present (401)
//! 3. the token must validate (401)
//! 4. one of the principal's roles must reach the route minimum (403)

use axum::http::HeaderValue;
use std::sync::Arc;
use tracing::debug;

use crate::auth::roles::RoleHierarchy;
use crate::auth::token::TokenValidator;
use crate::core::error::AuthzError;
use crate::core::types::{
    IncomingRequest, Principal, AUTH_ROLES_HEADER, AUTH_USER_HEADER, AUTH_VALIDATED_HEADER,
};
use crate::routing::router::{RouteDecision, RouteTable};

/// Header to set on the forwarded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderDirective {
    pub name: &'static str,
    pub value: HeaderValue,
}

/// Outcome of a successful authorization
#[derive(Debug, Clone)]
pub struct AuthorizedRequest {
    pub decision: RouteDecision,
    /// `None` for anonymous pass-through on open routes
    pub principal: Option<Principal>,
    pub headers: Vec<HeaderDirective>,
}

impl AuthorizedRequest {
    /// Set every directive on `request`, replacing existing values
    pub fn apply(&self, request: &mut IncomingRequest) {
        for directive in &self.headers {
            request.set_header(directive.name, directive.value.clone());
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessPolicy {
    routes: Arc<RouteTable>,
    validator: Arc<TokenValidator>,
    hierarchy: RoleHierarchy,
}

impl AccessPolicy {
    pub fn new(routes: Arc<RouteTable>, validator: Arc<TokenValidator>, hierarchy: RoleHierarchy) -> Self {
        Self {
            routes,
            validator,
            hierarchy,
        }
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn authorize(&self, request: &IncomingRequest) -> Result<AuthorizedRequest, AuthzError> {
        let decision = self.routes.classify(request.path(), &request.method);

        if decision.is_open {
            return Ok(AuthorizedRequest {
                decision,
                principal: None,
                headers: Vec::new(),
            });
        }

        let token = request.bearer_token().ok_or(AuthzError::MissingCredential)?;
        let principal = self.validator.validate(token).map_err(|err| {
            debug!(path = %request.path(), error = %err, "Token rejected");
            AuthzError::InvalidCredential(err)
        })?;

        if !self.hierarchy.meets_minimum(&principal, decision.minimum_role) {
            if let Some(required) = decision.minimum_role {
                debug!(
                    path = %request.path(),
                    method = %request.method,
                    subject = %principal.subject,
                    required = %required,
                    "Insufficient role"
                );
                return Err(AuthzError::InsufficientRole { required });
            }
        }

        let headers = identity_headers(&principal);
        Ok(AuthorizedRequest {
            decision,
            principal: Some(principal),
            headers,
        })
    }
}

/// Subjects or role claims that are not valid header text are dropped rather than
/// failing the request.
fn identity_headers(principal: &Principal) -> Vec<HeaderDirective> {
    let mut headers = Vec::with_capacity(3);
    if let Ok(value) = HeaderValue::from_str(&principal.subject) {
        headers.push(HeaderDirective {
            name: AUTH_USER_HEADER,
            value,
        });
    }
    if let Ok(value) = HeaderValue::from_str(&principal.roles_header_value()) {
        headers.push(HeaderDirective {
            name: AUTH_ROLES_HEADER,
            value,
        });
    }
    headers.push(HeaderDirective {
        name: AUTH_VALIDATED_HEADER,
        value: HeaderValue::from_static("true"),
    });
    headers
}
