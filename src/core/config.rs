//! # Configuration Module
//!
//! Gateway configuration: structures, loading and validation.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Environment variable overrides (`GATEWAY_*`)
//! - Validation that reports every problem at once
//! - Builders turning configuration into the runtime components

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::auth::roles::{RoleHierarchy, DEFAULT_ROLE_PREFIX};
use crate::auth::token::TokenValidator;
use crate::core::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::retry::RetryPolicy;
use crate::discovery::StaticDiscovery;
use crate::gateway::fallback::{FallbackProfile, FallbackResponder};
use crate::observability::config::{LogConfig, LogFormat};
use crate::routing::router::{shadowed_rules, RouteRule, RouteTable};

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG_PATH";

/// Used when `GATEWAY_CONFIG_PATH` is not set
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

/// Main gateway configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub routing: RoutingConfig,
    pub resilience: ResilienceConfig,
    pub discovery: DiscoveryConfig,
    /// Extra or replacement fallback profiles, merged over the built-ins
    pub fallbacks: HashMap<String, FallbackProfile>,
    pub logging: LogConfig,
    /// Sent to backends as `X-Gateway-Source`
    pub gateway_source: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            routing: RoutingConfig::default(),
            resilience: ResilienceConfig::default(),
            discovery: DiscoveryConfig::default(),
            fallbacks: HashMap::new(),
            logging: LogConfig::default(),
            gateway_source: "api-gateway".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Largest request body the gateway buffers, in bytes
    pub max_request_size: usize,
    /// TCP connect timeout towards backends
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Grace period for in-flight requests on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            max_request_size: 10 * 1024 * 1024,
            connect_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> GatewayResult<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| GatewayError::config(format!("Invalid server address: {}", e)))
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Base64-encoded HMAC signing secret
    pub jwt_secret: String,
    /// Prefix stripped from role claims before lookup
    pub role_prefix: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("role_prefix", &self.role_prefix)
            .finish()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            role_prefix: DEFAULT_ROLE_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Path prefixes that never require a credential
    pub open_paths: Vec<String>,
    /// Ordered rules; the first matching prefix wins
    pub rules: Vec<RouteRule>,
    /// Backend for paths no rule matches
    pub default_backend: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Profile for breakers without a named profile
    pub circuit_breaker: CircuitBreakerConfig,
    /// Named breaker profiles
    pub circuit_breakers: HashMap<String, CircuitBreakerConfig>,
    pub retry: RetryPolicy,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        let mut circuit_breakers = HashMap::new();
        circuit_breakers.insert("auth".to_string(), CircuitBreakerConfig::auth_profile());
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            circuit_breakers,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// backend id -> instance base URLs
    pub services: HashMap<String, Vec<Url>>,
}

impl GatewayConfig {
    /// Load from `GATEWAY_CONFIG_PATH`, or `config/gateway.yaml`
    pub async fn load() -> GatewayResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_file(path).await
    }

    /// Load a YAML or JSON file (by extension), apply env overrides and validate
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let mut config = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_yaml_str(&content)?
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML without overrides or validation
    pub fn from_yaml_str(content: &str) -> GatewayResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))
    }

    /// Parse JSON without overrides or validation
    pub fn from_json_str(content: &str) -> GatewayResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse JSON config: {}", e)))
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `GATEWAY_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup("GATEWAY_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }

        if let Some(addr) = lookup("GATEWAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Some(port) = lookup("GATEWAY_SERVER_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_SERVER_PORT: {}", e)))?;
        }

        if let Some(level) = lookup("GATEWAY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = lookup("GATEWAY_LOG_FORMAT") {
            self.logging.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(GatewayError::config(format!(
                        "Invalid GATEWAY_LOG_FORMAT: {} (expected json or text)",
                        other
                    )))
                }
            };
        }

        if let Some(count) = lookup("GATEWAY_RETRY_COUNT") {
            self.resilience.retry.retries = count
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_RETRY_COUNT: {}", e)))?;
        }

        if let Some(timeout) = lookup("GATEWAY_BREAKER_TIMEOUT") {
            self.resilience.circuit_breaker.timeout = humantime::parse_duration(&timeout)
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_BREAKER_TIMEOUT: {}", e)))?;
        }

        if let Some(source) = lookup("GATEWAY_SOURCE") {
            self.gateway_source = source;
        }

        Ok(())
    }

    /// Validate the configuration, collecting every problem
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("server.bind_address cannot be empty".to_string());
        }
        if self.server.max_request_size == 0 {
            errors.push("server.max_request_size must be greater than 0".to_string());
        }

        if self.auth.jwt_secret.trim().is_empty() {
            errors.push("auth.jwt_secret cannot be empty (set GATEWAY_JWT_SECRET)".to_string());
        } else if let Err(e) = TokenValidator::from_base64_secret(&self.auth.jwt_secret) {
            errors.push(format!("auth.jwt_secret: {}", e));
        }

        errors.extend(self.logging.validate());
        errors.extend(self.resilience.circuit_breaker.validate("default"));
        for (name, profile) in &self.resilience.circuit_breakers {
            errors.extend(profile.validate(name));
        }
        errors.extend(self.resilience.retry.validate());

        let fallbacks = FallbackResponder::new(self.fallbacks.clone());
        let mut breaker_profiles: HashMap<&str, Option<&str>> = HashMap::new();
        for rule in &self.routing.rules {
            if rule.backend_id.is_empty() {
                errors.push(format!("Route '{}' has empty backend_id", rule.path_prefix));
            }
            if let Some(profile) = &rule.breaker_profile {
                if !self.resilience.circuit_breakers.contains_key(profile) {
                    errors.push(format!(
                        "Route '{}' references unknown circuit breaker profile '{}'",
                        rule.path_prefix, profile
                    ));
                }
            }
            let profile = rule.breaker_profile.as_deref();
            match breaker_profiles.insert(rule.breaker_key(), profile) {
                Some(previous) if previous != profile => errors.push(format!(
                    "Route '{}': circuit breaker '{}' is already used with profile '{}'",
                    rule.path_prefix,
                    rule.breaker_key(),
                    previous.unwrap_or("default")
                )),
                _ => {}
            }
            if let Some(fallback) = &rule.fallback {
                if !fallbacks.has_profile(fallback) {
                    errors.push(format!(
                        "Route '{}' references unknown fallback profile '{}'",
                        rule.path_prefix, fallback
                    ));
                }
            }
        }
        errors.extend(shadowed_rules(&self.routing.rules));

        for (backend_id, instances) in &self.discovery.services {
            for url in instances {
                if !matches!(url.scheme(), "http" | "https") {
                    errors.push(format!(
                        "discovery.services.{}: unsupported scheme in {}",
                        backend_id, url
                    ));
                }
            }
        }

        if axum::http::HeaderValue::from_str(&self.gateway_source).is_err() {
            errors.push("gateway_source is not a valid header value".to_string());
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }

    pub fn token_validator(&self) -> GatewayResult<TokenValidator> {
        TokenValidator::from_base64_secret(&self.auth.jwt_secret)
    }

    pub fn role_hierarchy(&self) -> RoleHierarchy {
        RoleHierarchy::new(self.auth.role_prefix.clone())
    }

    pub fn route_table(&self) -> GatewayResult<RouteTable> {
        RouteTable::new(
            self.routing.rules.clone(),
            self.routing.open_paths.clone(),
            self.routing.default_backend.clone(),
        )
    }

    pub fn breaker_registry(&self) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(
            self.resilience.circuit_breaker.clone(),
            self.resilience.circuit_breakers.clone(),
        )
    }

    pub fn fallback_responder(&self) -> FallbackResponder {
        FallbackResponder::new(self.fallbacks.clone())
    }

    pub fn static_discovery(&self) -> StaticDiscovery {
        StaticDiscovery::from_table(&self.discovery.services)
    }
}
