//! # Token Validator
//!
//! Verifies HMAC-signed JWT bearer tokens and extracts the principal.
//!
//! The signing secret is configured base64-encoded, the same form the identity
//! service uses when it issues tokens. Validation reads only the clock and the
//! key, so one validator is shared by every request.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::error::{AuthError, GatewayError, GatewayResult};
use crate::core::types::Principal;

/// Claims the gateway reads from a token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub roles: Option<Vec<String>>,
}

pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenValidator")
            .field("algorithms", &self.validation.algorithms)
            .finish_non_exhaustive()
    }
}

impl TokenValidator {
    /// Build a validator from a base64-encoded HMAC secret
    pub fn from_base64_secret(secret: &str) -> GatewayResult<Self> {
        let key_bytes = STANDARD
            .decode(secret.trim())
            .map_err(|e| GatewayError::config(format!("JWT secret is not valid base64: {}", e)))?;
        if key_bytes.is_empty() {
            return Err(GatewayError::config("JWT secret cannot be empty"));
        }
        Ok(Self::from_secret(&key_bytes))
    }

    /// Build a validator from raw HMAC key bytes
    pub fn from_secret(key_bytes: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            key: DecodingKey::from_secret(key_bytes),
            validation,
        }
    }

    /// Verify `token` and extract its principal
    pub fn validate(&self, token: &str) -> Result<Principal, AuthError> {
        let data = decode::<TokenClaims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Malformed(e.to_string()),
            }
        })?;

        let claims = data.claims;
        // jsonwebtoken accepts exp == now; a token is already expired at that instant.
        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }

        Ok(Principal {
            subject: claims.sub,
            roles: claims.roles.unwrap_or_default(),
            issued_valid: true,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    pub const TEST_SECRET: &[u8] = b"test-signing-secret-that-is-long-enough-for-hs256";

    pub fn base64_secret() -> String {
        STANDARD.encode(TEST_SECRET)
    }

    pub fn mint(subject: &str, roles: Option<Vec<&str>>, expires_in_seconds: i64) -> String {
        mint_with_secret(TEST_SECRET, subject, roles, expires_in_seconds)
    }

    pub fn mint_with_secret(
        secret: &[u8],
        subject: &str,
        roles: Option<Vec<&str>>,
        expires_in_seconds: i64,
    ) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = TokenClaims {
            sub: subject.to_string(),
            exp: now + expires_in_seconds,
            iat: Some(now),
            roles: roles.map(|r| r.into_iter().map(String::from).collect()),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret),
        )
        .expect("Failed to create test JWT")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn validator() -> TokenValidator {
        TokenValidator::from_base64_secret(&base64_secret()).unwrap()
    }

    #[test]
    fn test_valid_token() {
        let token = mint("alice", Some(vec!["ROLE_MANAGER", "ROLE_USER"]), 300);
        let principal = validator().validate(&token).unwrap();

        assert_eq!(principal.subject, "alice");
        assert_eq!(principal.roles, vec!["ROLE_MANAGER", "ROLE_USER"]);
        assert!(principal.issued_valid);
    }

    #[test]
    fn test_missing_roles_claim_is_empty() {
        let token = mint("bob", None, 300);
        let principal = validator().validate(&token).unwrap();
        assert!(principal.roles.is_empty());
    }

    #[test]
    fn test_expired_token() {
        let token = mint("alice", Some(vec!["ROLE_OWNER"]), -120);
        assert_eq!(validator().validate(&token), Err(AuthError::Expired));
    }

    #[test]
    fn test_token_expiring_now_is_expired() {
        let token = mint("alice", Some(vec!["ROLE_OWNER"]), 0);
        assert_eq!(validator().validate(&token), Err(AuthError::Expired));
    }

    #[test]
    fn test_wrong_signature_is_malformed() {
        let token = mint_with_secret(b"some-other-secret-entirely-0123456789", "eve", None, 300);
        assert!(matches!(validator().validate(&token), Err(AuthError::Malformed(_))));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(validator().validate("not-a-jwt"), Err(AuthError::Malformed(_))));
        assert!(matches!(validator().validate(""), Err(AuthError::Malformed(_))));
    }

    #[test]
    fn test_invalid_base64_secret() {
        assert!(TokenValidator::from_base64_secret("%%%not-base64%%%").is_err());
        assert!(TokenValidator::from_base64_secret("").is_err());
    }
}
