//! # Route Table
//!
//! Ordered path-prefix rules mapping a request path and method to a backend
//! service, an access classification and a minimum role.
//!
//! Matching is first-match in registration order. A general prefix listed
//! before a more specific one would shadow it forever, so the table refuses to
//! be built from such a list (see [`RouteTable::new`]). Reloading means
//! building a new table and swapping it in whole.

use axum::http::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::roles::Role;
use crate::core::error::{GatewayError, GatewayResult};

/// Fallback profile used when a rule does not name one
pub const DEFAULT_FALLBACK_PROFILE: &str = "service";

/// Who may use a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAccess {
    /// No credential required
    Open,
    /// Valid credential required, optionally with a minimum role
    Protected {
        minimum_role: Option<Role>,
        /// HTTP method (upper case) -> minimum role for that method
        method_overrides: HashMap<String, Role>,
    },
}

impl Default for RouteAccess {
    fn default() -> Self {
        RouteAccess::Protected {
            minimum_role: None,
            method_overrides: HashMap::new(),
        }
    }
}

/// One configured route rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RouteRuleRecord", into = "RouteRuleRecord")]
pub struct RouteRule {
    /// Matched against the start of the request path
    pub path_prefix: String,

    /// Logical service name resolved through discovery
    pub backend_id: String,

    pub access: RouteAccess,

    /// Name of the breaker instance guarding this rule; defaults to the backend id.
    /// Rules naming the same breaker share its window.
    pub circuit_breaker: Option<String>,

    /// Named breaker profile from `resilience.circuit_breakers`; the default profile when unset
    pub breaker_profile: Option<String>,

    /// Fallback profile; defaults to `service`
    pub fallback: Option<String>,

    /// Remove `path_prefix` from the path before forwarding
    pub strip_prefix: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum AccessKind {
    Open,
    #[default]
    Protected,
}

/// Flat on-disk form of a [`RouteRule`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RouteRuleRecord {
    path_prefix: String,
    backend_id: String,
    #[serde(default)]
    access: AccessKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    minimum_role: Option<Role>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    method_overrides: HashMap<String, Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    circuit_breaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    breaker_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fallback: Option<String>,
    #[serde(default)]
    strip_prefix: bool,
}

impl TryFrom<RouteRuleRecord> for RouteRule {
    type Error = String;

    fn try_from(record: RouteRuleRecord) -> Result<Self, Self::Error> {
        if record.path_prefix.is_empty() {
            return Err("route rule has an empty path_prefix".to_string());
        }
        let access = match record.access {
            AccessKind::Open => {
                if record.minimum_role.is_some() || !record.method_overrides.is_empty() {
                    return Err(format!(
                        "open route '{}' cannot declare role requirements",
                        record.path_prefix
                    ));
                }
                RouteAccess::Open
            }
            AccessKind::Protected => RouteAccess::Protected {
                minimum_role: record.minimum_role,
                method_overrides: record
                    .method_overrides
                    .into_iter()
                    .map(|(method, role)| (method.to_ascii_uppercase(), role))
                    .collect(),
            },
        };

        Ok(Self {
            path_prefix: record.path_prefix,
            backend_id: record.backend_id,
            access,
            circuit_breaker: record.circuit_breaker,
            breaker_profile: record.breaker_profile,
            fallback: record.fallback,
            strip_prefix: record.strip_prefix,
        })
    }
}

impl From<RouteRule> for RouteRuleRecord {
    fn from(rule: RouteRule) -> Self {
        let (access, minimum_role, method_overrides) = match rule.access {
            RouteAccess::Open => (AccessKind::Open, None, HashMap::new()),
            RouteAccess::Protected {
                minimum_role,
                method_overrides,
            } => (AccessKind::Protected, minimum_role, method_overrides),
        };
        Self {
            path_prefix: rule.path_prefix,
            backend_id: rule.backend_id,
            access,
            minimum_role,
            method_overrides,
            circuit_breaker: rule.circuit_breaker,
            breaker_profile: rule.breaker_profile,
            fallback: rule.fallback,
            strip_prefix: rule.strip_prefix,
        }
    }
}

impl RouteRule {
    pub fn open(path_prefix: impl Into<String>, backend_id: impl Into<String>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            backend_id: backend_id.into(),
            access: RouteAccess::Open,
            circuit_breaker: None,
            breaker_profile: None,
            fallback: None,
            strip_prefix: false,
        }
    }

    pub fn protected(
        path_prefix: impl Into<String>,
        backend_id: impl Into<String>,
        minimum_role: Option<Role>,
    ) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            backend_id: backend_id.into(),
            access: RouteAccess::Protected {
                minimum_role,
                method_overrides: HashMap::new(),
            },
            circuit_breaker: None,
            breaker_profile: None,
            fallback: None,
            strip_prefix: false,
        }
    }

    /// Require `role` for `method` on this rule
    pub fn with_method_role(mut self, method: Method, role: Role) -> Self {
        if let RouteAccess::Protected {
            method_overrides, ..
        } = &mut self.access
        {
            method_overrides.insert(method.as_str().to_string(), role);
        }
        self
    }

    pub fn with_circuit_breaker(mut self, name: impl Into<String>) -> Self {
        self.circuit_breaker = Some(name.into());
        self
    }

    pub fn with_breaker_profile(mut self, profile: impl Into<String>) -> Self {
        self.breaker_profile = Some(profile.into());
        self
    }

    pub fn with_fallback(mut self, profile: impl Into<String>) -> Self {
        self.fallback = Some(profile.into());
        self
    }

    pub fn with_strip_prefix(mut self) -> Self {
        self.strip_prefix = true;
        self
    }

    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.path_prefix)
    }

    /// Key of the breaker guarding this rule
    pub fn breaker_key(&self) -> &str {
        self.circuit_breaker.as_deref().unwrap_or(&self.backend_id)
    }

    pub fn fallback_profile(&self) -> &str {
        self.fallback.as_deref().unwrap_or(DEFAULT_FALLBACK_PROFILE)
    }

    fn minimum_role_for(&self, method: &Method) -> Option<Role> {
        match &self.access {
            RouteAccess::Open => None,
            RouteAccess::Protected {
                minimum_role,
                method_overrides,
            } => method_overrides
                .get(method.as_str())
                .copied()
                .or(*minimum_role),
        }
    }
}

/// Result of classifying one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub is_open: bool,
    pub backend_id: Option<String>,
    pub minimum_role: Option<Role>,
    /// Matched rule; `None` when the default mapping was used
    pub rule: Option<Arc<RouteRule>>,
}

impl RouteDecision {
    pub fn breaker_key(&self) -> Option<&str> {
        match &self.rule {
            Some(rule) => Some(rule.breaker_key()),
            None => self.backend_id.as_deref(),
        }
    }

    /// Profile the breaker is created with; `None` means the default profile
    pub fn breaker_profile(&self) -> Option<&str> {
        self.rule.as_ref().and_then(|rule| rule.breaker_profile.as_deref())
    }

    pub fn fallback_profile(&self) -> &str {
        self.rule
            .as_ref()
            .map(|rule| rule.fallback_profile())
            .unwrap_or(DEFAULT_FALLBACK_PROFILE)
    }

    /// Path to forward to the backend after any configured rewrite
    pub fn forward_path<'a>(&self, path: &'a str) -> std::borrow::Cow<'a, str> {
        match &self.rule {
            Some(rule) if rule.strip_prefix => {
                let rest = path.strip_prefix(&rule.path_prefix).unwrap_or(path);
                if rest.starts_with('/') {
                    rest.into()
                } else {
                    format!("/{}", rest).into()
                }
            }
            _ => path.into(),
        }
    }
}

/// Immutable, ordered route table
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: Vec<Arc<RouteRule>>,
    open_paths: Vec<String>,
    default_backend: Option<String>,
}

impl RouteTable {
    /// Build a table, rejecting rule lists where an earlier prefix shadows a later one
    pub fn new(
        rules: Vec<RouteRule>,
        open_paths: Vec<String>,
        default_backend: Option<String>,
    ) -> GatewayResult<Self> {
        let shadowed = shadowed_rules(&rules);
        if !shadowed.is_empty() {
            return Err(GatewayError::config(format!(
                "Route rules are mis-ordered:\n{}",
                shadowed.join("\n")
            )));
        }

        Ok(Self {
            rules: rules.into_iter().map(Arc::new).collect(),
            open_paths,
            default_backend,
        })
    }

    pub fn rules(&self) -> &[Arc<RouteRule>] {
        &self.rules
    }

    pub fn open_paths(&self) -> &[String] {
        &self.open_paths
    }

    /// True if `path` starts with one of the configured open prefixes
    pub fn is_open_path(&self, path: &str) -> bool {
        self.open_paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub fn classify(&self, path: &str, method: &Method) -> RouteDecision {
        let open_path = self.is_open_path(path);

        match self.rules.iter().find(|rule| rule.matches(path)) {
            Some(rule) => {
                let is_open = open_path || matches!(rule.access, RouteAccess::Open);
                RouteDecision {
                    is_open,
                    backend_id: Some(rule.backend_id.clone()),
                    minimum_role: if is_open {
                        None
                    } else {
                        rule.minimum_role_for(method)
                    },
                    rule: Some(Arc::clone(rule)),
                }
            }
            None => RouteDecision {
                is_open: open_path,
                backend_id: self.default_backend.clone(),
                minimum_role: if open_path { None } else { Some(Role::Other) },
                rule: None,
            },
        }
    }
}

/// Human-readable description of every rule made unreachable by an earlier one
pub fn shadowed_rules(rules: &[RouteRule]) -> Vec<String> {
    let mut problems = Vec::new();
    for (later_index, later) in rules.iter().enumerate() {
        if let Some((earlier_index, earlier)) = rules[..later_index]
            .iter()
            .enumerate()
            .find(|(_, earlier)| later.path_prefix.starts_with(&earlier.path_prefix))
        {
            problems.push(format!(
                "rule {} ('{}') is shadowed by rule {} ('{}'); list the more specific prefix first",
                later_index, later.path_prefix, earlier_index, earlier.path_prefix
            ));
        }
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::new(
            vec![
                RouteRule::open("/service-a", "service-a"),
                RouteRule::protected("/orders", "order-service", Some(Role::User))
                    .with_method_role(Method::POST, Role::Manager)
                    .with_method_role(Method::DELETE, Role::Owner),
                RouteRule::protected("/mobile/orders", "order-service", Some(Role::User)),
                RouteRule::protected("/mobile", "mobile-service", None),
                RouteRule::protected("/config", "config-server", None).with_strip_prefix(),
            ],
            vec!["/auth".to_string(), "/mobile/public".to_string()],
            Some("default-service".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn test_open_rule() {
        let decision = table().classify("/service-a/x", &Method::GET);
        assert!(decision.is_open);
        assert_eq!(decision.backend_id.as_deref(), Some("service-a"));
        assert_eq!(decision.minimum_role, None);
    }

    #[test]
    fn test_method_overrides() {
        let table = table();
        assert_eq!(table.classify("/orders/1", &Method::GET).minimum_role, Some(Role::User));
        assert_eq!(table.classify("/orders", &Method::POST).minimum_role, Some(Role::Manager));
        assert_eq!(table.classify("/orders/1", &Method::DELETE).minimum_role, Some(Role::Owner));
        assert_eq!(table.classify("/orders/1", &Method::PUT).minimum_role, Some(Role::User));
    }

    #[test]
    fn test_specific_prefix_registered_first_wins() {
        let table = table();
        let decision = table.classify("/mobile/orders/7", &Method::GET);
        assert_eq!(decision.backend_id.as_deref(), Some("order-service"));
        assert_eq!(decision.minimum_role, Some(Role::User));

        let decision = table.classify("/mobile/search", &Method::GET);
        assert_eq!(decision.backend_id.as_deref(), Some("mobile-service"));
        assert_eq!(decision.minimum_role, None);
        assert!(!decision.is_open);
    }

    #[test]
    fn test_open_paths_override_rules() {
        let decision = table().classify("/mobile/public/banner", &Method::GET);
        assert!(decision.is_open);
        assert_eq!(decision.backend_id.as_deref(), Some("mobile-service"));
    }

    #[test]
    fn test_unmatched_path_uses_default_mapping() {
        let decision = table().classify("/reports/daily", &Method::GET);
        assert!(!decision.is_open);
        assert_eq!(decision.backend_id.as_deref(), Some("default-service"));
        assert_eq!(decision.minimum_role, Some(Role::Other));
        assert!(decision.rule.is_none());

        let decision = table().classify("/auth/login", &Method::POST);
        assert!(decision.is_open);
        assert_eq!(decision.minimum_role, None);
    }

    #[test]
    fn test_misordered_rules_are_rejected() {
        let result = RouteTable::new(
            vec![
                RouteRule::protected("/a", "a", None),
                RouteRule::protected("/a/b", "b", Some(Role::Owner)),
            ],
            vec![],
            None,
        );
        let err = result.unwrap_err().to_string();
        assert!(err.contains("'/a/b'"), "{}", err);
    }

    #[test]
    fn test_string_prefix_shadowing_is_detected() {
        let problems = shadowed_rules(&[
            RouteRule::protected("/v1/supplier", "inventory", Some(Role::Manager)),
            RouteRule::protected("/v1/supplier-company", "inventory", Some(Role::Manager)),
        ]);
        assert_eq!(problems.len(), 1);
    }

    #[test]
    fn test_strip_prefix_rewrite() {
        let table = table();
        let decision = table.classify("/config/app/default", &Method::GET);
        assert_eq!(decision.forward_path("/config/app/default"), "/app/default");
        assert_eq!(decision.forward_path("/config"), "/");

        let decision = table.classify("/orders/1", &Method::GET);
        assert_eq!(decision.forward_path("/orders/1"), "/orders/1");
    }

    #[test]
    fn test_rule_deserialization() {
        let yaml = r#"
- path_prefix: /lifepill/v1/item
  backend_id: inventory-service
  access: protected
  minimum_role: USER
  method_overrides:
    POST: MANAGER
    DELETE: OWNER
- path_prefix: /api/v1/auth
  backend_id: user-auth-service
  access: open
  circuit_breaker: user-auth
  breaker_profile: auth
  fallback: auth
"#;
        let rules: Vec<RouteRule> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules[0],
            RouteRule::protected("/lifepill/v1/item", "inventory-service", Some(Role::User))
                .with_method_role(Method::POST, Role::Manager)
                .with_method_role(Method::DELETE, Role::Owner)
        );
        assert_eq!(rules[1].access, RouteAccess::Open);
        assert_eq!(rules[0].breaker_key(), "inventory-service");
        assert_eq!(rules[1].breaker_key(), "user-auth");
        assert_eq!(rules[1].breaker_profile.as_deref(), Some("auth"));
        assert_eq!(rules[1].fallback_profile(), "auth");
    }

    #[test]
    fn test_open_rule_with_role_is_rejected() {
        let yaml = "path_prefix: /x\nbackend_id: x\naccess: open\nminimum_role: OWNER\n";
        assert!(serde_yaml::from_str::<RouteRule>(yaml).is_err());

        let yaml = "path_prefix: /x\nbackend_id: x\nmethod_overrides:\n  post: OWNER\n";
        let rule: RouteRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.minimum_role_for(&Method::POST), Some(Role::Owner));
        assert_eq!(rule.minimum_role_for(&Method::GET), None);
    }
}
