//! # HTTP Server Module
//!
//! Axum front end of the gateway. A handful of gateway-owned endpoints are
//! served directly; every other request is buffered, converted into an
//! [`IncomingRequest`] and handed to the [`Pipeline`].
//!
//! ## Endpoints outside the pipeline
//! - `GET /gateway/health`, `GET /gateway/info`
//! - `GET /gateway/services`: instances known to discovery
//! - `GET /gateway/circuit-breakers`: breaker snapshots
//! - `GET /fallback/:kind`: a fallback body served on demand
//!
//! ## Rust Concepts Used
//! - `Arc<T>` for sharing server state across request tasks
//! - A `CancellationToken` drop guard per request: when the client goes away
//!   axum drops the handler future, the guard fires and the pipeline stops
//!   retrying and sleeping on its behalf

use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router as AxumRouter,
};
use serde_json::json;
use std::any::Any;
use std::collections::BTreeMap;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error, info, instrument, warn};

use crate::auth::policy::AccessPolicy;
use crate::core::circuit_breaker::CircuitBreakerRegistry;
use crate::core::config::GatewayConfig;
use crate::core::error::{ErrorBody, GatewayError, GatewayResult};
use crate::core::types::IncomingRequest;
use crate::discovery::ServiceDiscovery;
use crate::gateway::fallback::FallbackResponder;
use crate::gateway::upstream::{HttpUpstream, Upstream};
use crate::middleware::{
    AuthRelayStage, AuthorizationStage, DispatchStage, Pipeline, RequestLoggingStage, Stage,
};

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub discovery: Arc<dyn ServiceDiscovery>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub fallbacks: Arc<FallbackResponder>,
    /// Largest request body buffered before the pipeline runs
    pub max_request_size: usize,
    /// Reported by the health endpoint
    pub service_name: String,
}

/// The assembled gateway: pipeline, admin endpoints and listener settings
pub struct GatewayServer {
    state: AppState,
    bind_addr: SocketAddr,
    shutdown_timeout: Duration,
}

impl GatewayServer {
    /// Build the gateway with static discovery and the pooled HTTP client
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let upstream = HttpUpstream::new(config.server.connect_timeout)?;
        Self::with_components(
            config,
            Arc::new(config.static_discovery()),
            Arc::new(upstream),
        )
    }

    /// Build the gateway around caller-supplied discovery and upstream
    pub fn with_components(
        config: &GatewayConfig,
        discovery: Arc<dyn ServiceDiscovery>,
        upstream: Arc<dyn Upstream>,
    ) -> GatewayResult<Self> {
        config.validate()?;

        let routes = Arc::new(config.route_table()?);
        let validator = Arc::new(config.token_validator()?);
        let breakers = Arc::new(config.breaker_registry());
        let fallbacks = Arc::new(config.fallback_responder());

        let policy = AccessPolicy::new(Arc::clone(&routes), validator, config.role_hierarchy());
        let dispatch = DispatchStage::new(
            routes,
            Arc::clone(&breakers),
            Arc::clone(&discovery),
            upstream,
            Arc::clone(&fallbacks),
            config.resilience.retry.clone(),
        )
        .with_gateway_source(&config.gateway_source)?;

        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(RequestLoggingStage::new(config.logging.slow_request_threshold)),
            Arc::new(AuthRelayStage::new()),
            Arc::new(AuthorizationStage::new(policy)),
            Arc::new(dispatch),
        ];
        let pipeline = Pipeline::new(stages);
        info!(stages = ?pipeline.stage_names(), "Request pipeline assembled");

        Ok(Self {
            state: AppState {
                pipeline,
                discovery,
                breakers,
                fallbacks,
                max_request_size: config.server.max_request_size,
                service_name: config.gateway_source.clone(),
            },
            bind_addr: config.server.socket_addr()?,
            shutdown_timeout: config.server.shutdown_timeout,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.state.breakers
    }

    /// The axum application, ready to serve or to drive from tests
    pub fn app(&self) -> AxumRouter {
        build_app(self.state.clone())
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests for at
    /// most the configured shutdown timeout
    #[instrument(skip_all, fields(bind_addr = %self.bind_addr))]
    pub async fn serve<F>(self, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            GatewayError::internal(format!("Failed to bind gateway server to {}: {}", self.bind_addr, e))
        })?;
        info!("Gateway HTTP server listening on {}", self.bind_addr);

        let draining = CancellationToken::new();
        let server = axum::serve(
            listener,
            self.app().into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(draining.clone().cancelled_owned())
        .into_future();
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => {
                result.map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))?;
            }
            _ = shutdown => {
                info!("Shutdown signal received, waiting for in-flight requests to complete");
                draining.cancel();
                match tokio::time::timeout(self.shutdown_timeout, &mut server).await {
                    Ok(result) => {
                        result.map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))?;
                        info!("Server shutdown completed gracefully");
                    }
                    Err(_) => {
                        warn!(
                            timeout_ms = self.shutdown_timeout.as_millis() as u64,
                            "Server shutdown timed out, dropping remaining connections"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Serve until Ctrl-C or SIGTERM
    pub async fn run(self) -> GatewayResult<()> {
        self.serve(shutdown_signal()).await
    }
}

/// Resolves on Ctrl-C, or on SIGTERM where the platform has it
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl-C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

/// Routes for the gateway endpoints plus the pipeline catch-all
pub fn build_app(state: AppState) -> AxumRouter {
    AxumRouter::new()
        .route("/gateway/health", get(health))
        .route("/gateway/info", get(gateway_info))
        .route("/gateway/services", get(registered_services))
        .route("/gateway/circuit-breakers", get(circuit_breakers))
        .route("/fallback/:kind", get(fallback))
        .fallback(proxy)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::custom(panic_response))
                .layer(TraceLayer::new_for_http()),
        )
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = detail, "Request handler panicked");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody::internal())).into_response()
}

/// Everything that is not a gateway endpoint goes through the pipeline
async fn proxy(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let body = match axum::body::to_bytes(body, state.max_request_size).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %parts.uri.path(), "Failed to read request body: {}", e);
            let status = StatusCode::PAYLOAD_TOO_LARGE;
            return (
                status,
                Json(ErrorBody::new(
                    status,
                    format!("Request body exceeds maximum allowed size {}", state.max_request_size),
                )),
            )
                .into_response();
        }
    };

    let mut incoming = IncomingRequest::new(parts.method, parts.uri, parts.headers, body);
    if let Some(addr) = remote_addr {
        incoming = incoming.with_remote_addr(addr);
    }

    let cancellation = CancellationToken::new();
    let guard = cancellation.clone().drop_guard();
    let response = state.pipeline.handle(incoming, cancellation).await;
    guard.disarm();

    response.into_response()
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "UP",
        "service": state.service_name,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn gateway_info() -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "description": env!("CARGO_PKG_DESCRIPTION"),
        "endpoints": {
            "health": "/gateway/health",
            "services": "/gateway/services",
            "circuitBreakers": "/gateway/circuit-breakers",
            "fallback": "/fallback/{kind}",
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn registered_services(State(state): State<AppState>) -> Result<Response, GatewayError> {
    let services = state.discovery.services().await?;
    let details: BTreeMap<String, Vec<String>> = services
        .into_iter()
        .map(|entry| {
            let urls = entry.instances.iter().map(|url| url.to_string()).collect();
            (entry.backend_id, urls)
        })
        .collect();

    Ok(Json(json!({
        "totalServices": details.len(),
        "services": details,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response())
}

async fn circuit_breakers(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "circuitBreakers": state.breakers.snapshots(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn fallback(State(state): State<AppState>, Path(kind): Path<String>, uri: Uri) -> Response {
    debug!(kind = %kind, "Serving fallback endpoint");
    state.fallbacks.respond(&kind, uri.path()).into_response()
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer")
            .field("bind_addr", &self.bind_addr)
            .field("stages", &self.state.pipeline.stage_names())
            .finish_non_exhaustive()
    }
}
