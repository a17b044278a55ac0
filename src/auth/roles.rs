//! # Role Hierarchy
//!
//! Total order over role names: `OWNER > MANAGER > CASHIER > USER > OTHER`.
//! Names are matched case-insensitively after stripping the configured prefix
//! (`ROLE_` by default). Unknown names sit below every known role.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::types::Principal;

/// Level reported for role names that are not part of the hierarchy
pub const UNKNOWN_ROLE_LEVEL: u8 = 0;

/// Default prefix carried by role claims issued by the identity service
pub const DEFAULT_ROLE_PREFIX: &str = "ROLE_";

/// Known roles, ordered from least to most privileged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    Other,
    User,
    Cashier,
    Manager,
    Owner,
}

impl Role {
    pub const ALL: [Role; 5] = [Role::Other, Role::User, Role::Cashier, Role::Manager, Role::Owner];

    pub fn level(self) -> u8 {
        match self {
            Role::Owner => 5,
            Role::Manager => 4,
            Role::Cashier => 3,
            Role::User => 2,
            Role::Other => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "OWNER",
            Role::Manager => "MANAGER",
            Role::Cashier => "CASHIER",
            Role::User => "USER",
            Role::Other => "OTHER",
        }
    }

    fn from_bare_name(name: &str) -> Option<Role> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    /// Accepts `manager`, `MANAGER` and `ROLE_MANAGER`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let bare = strip_prefix_ignore_case(trimmed, DEFAULT_ROLE_PREFIX).unwrap_or(trimmed);
        Role::from_bare_name(bare).ok_or_else(|| format!("unknown role: {}", s))
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

/// Maps role names from token claims onto the hierarchy
#[derive(Debug, Clone)]
pub struct RoleHierarchy {
    prefix: String,
}

impl Default for RoleHierarchy {
    fn default() -> Self {
        Self::new(DEFAULT_ROLE_PREFIX)
    }
}

impl RoleHierarchy {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Hierarchy level of a role name; 0 for anything unrecognized
    pub fn level(&self, role_name: &str) -> u8 {
        self.resolve(role_name)
            .map(Role::level)
            .unwrap_or(UNKNOWN_ROLE_LEVEL)
    }

    /// Known role for a claim value, if any
    pub fn resolve(&self, role_name: &str) -> Option<Role> {
        let trimmed = role_name.trim();
        let bare = if self.prefix.is_empty() {
            trimmed
        } else {
            strip_prefix_ignore_case(trimmed, &self.prefix).unwrap_or(trimmed)
        };
        Role::from_bare_name(bare)
    }

    /// True iff one of the principal's roles reaches `minimum`.
    /// A route without a minimum role only requires authentication.
    pub fn meets_minimum(&self, principal: &Principal, minimum: Option<Role>) -> bool {
        match minimum {
            None => true,
            Some(required) => principal
                .roles
                .iter()
                .any(|role| self.level(role) >= required.level()),
        }
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len()
        && value.is_char_boundary(prefix.len())
        && value[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(roles: &[&str]) -> Principal {
        Principal {
            subject: "alice".to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            issued_valid: true,
        }
    }

    #[test]
    fn test_levels() {
        let hierarchy = RoleHierarchy::default();
        assert_eq!(hierarchy.level("OWNER"), 5);
        assert_eq!(hierarchy.level("ROLE_MANAGER"), 4);
        assert_eq!(hierarchy.level("role_cashier"), 3);
        assert_eq!(hierarchy.level("User"), 2);
        assert_eq!(hierarchy.level("OTHER"), 1);
        assert_eq!(hierarchy.level("ROLE_ADMIN"), UNKNOWN_ROLE_LEVEL);
        assert_eq!(hierarchy.level(""), UNKNOWN_ROLE_LEVEL);
    }

    #[test]
    fn test_custom_prefix() {
        let hierarchy = RoleHierarchy::new("APP_");
        assert_eq!(hierarchy.level("APP_OWNER"), 5);
        assert_eq!(hierarchy.level("ROLE_OWNER"), UNKNOWN_ROLE_LEVEL);
    }

    #[test]
    fn test_higher_role_satisfies_lower_minimum() {
        let hierarchy = RoleHierarchy::default();
        for held in Role::ALL {
            for required in Role::ALL {
                let p = principal(&[held.as_str()]);
                assert_eq!(
                    hierarchy.meets_minimum(&p, Some(required)),
                    held.level() >= required.level(),
                    "{} vs {}",
                    held,
                    required
                );
            }
        }
    }

    #[test]
    fn test_any_role_is_enough() {
        let hierarchy = RoleHierarchy::default();
        let p = principal(&["ROLE_USER", "ROLE_MANAGER"]);
        assert!(hierarchy.meets_minimum(&p, Some(Role::Manager)));
        assert!(!hierarchy.meets_minimum(&p, Some(Role::Owner)));
    }

    #[test]
    fn test_absent_minimum_always_passes() {
        let hierarchy = RoleHierarchy::default();
        assert!(hierarchy.meets_minimum(&principal(&[]), None));
        assert!(!hierarchy.meets_minimum(&principal(&[]), Some(Role::Other)));
        assert!(!hierarchy.meets_minimum(&principal(&["ROLE_GUEST"]), Some(Role::Other)));
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("ROLE_OWNER".parse::<Role>().unwrap(), Role::Owner);
        assert_eq!("cashier".parse::<Role>().unwrap(), Role::Cashier);
        assert!("janitor".parse::<Role>().is_err());

        let role: Role = serde_yaml::from_str("manager").unwrap();
        assert_eq!(role, Role::Manager);
    }
}
