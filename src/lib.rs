//! # Edge Gateway Library
//!
//! Edge API gateway for a microservice backend. Every client request runs
//! through a fixed pipeline: request logging, bearer-credential relay,
//! token validation with role-based authorization, and finally dispatch to a
//! backend guarded by a per-route circuit breaker, retry policy and fallback.
//!
//! ## Module Layout
//! - `core`: errors, configuration, request types, breaker and retry policy
//! - `auth`: token validation, role hierarchy and the access policy
//! - `routing`: ordered path-prefix route table
//! - `discovery`: backend instance lookup
//! - `middleware`: the pipeline and its stages
//! - `gateway`: axum server, backend client and fallback responses
//! - `observability`: logging setup and metric names

/// Core functionality including error types, configuration, and basic data structures
pub mod core;

/// Token validation, role hierarchy and access decisions
pub mod auth;

/// Path-to-backend route table
pub mod routing;

/// Service discovery: backend id to instance addresses
pub mod discovery;

/// Request pipeline and its stages
pub mod middleware;

/// HTTP server, upstream client and fallback responses
pub mod gateway;

/// Logging and metrics
pub mod observability;

pub use crate::core::config::GatewayConfig;
pub use crate::core::error::{GatewayError, GatewayResult};
pub use crate::core::types::{GatewayResponse, IncomingRequest, RequestContext};
pub use crate::gateway::server::GatewayServer;
pub use crate::middleware::pipeline::Pipeline;
