//! Session JWT handling
//!
//! Session tokens authenticate the dashboard/API; client tunnel credentials
//! are opaque tokens handled in [`crate::token`].

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// JWT errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("Failed to encode token: {0}")]
    Encode(#[source] jsonwebtoken::errors::Error),

    #[error("Invalid or expired token: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),
}

/// Claims carried by a session token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    /// Subject (user id)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// User role ("super_admin", "org_admin", "org_user")
    pub role: String,
    /// Organization scope, when the user belongs to one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    /// Set on the intermediate token issued between password and TOTP steps
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending_2fa: bool,
}

impl JwtClaims {
    pub fn new(user_id: Uuid, role: String, org_id: Option<Uuid>, validity: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: (now + validity).timestamp(),
            role,
            org_id: org_id.map(|id| id.to_string()),
            pending_2fa: false,
        }
    }

    /// Mark this token as the first step of a 2FA login.
    pub fn with_pending_2fa(mut self) -> Self {
        self.pending_2fa = true;
        self
    }

    pub fn user_id(&self) -> Result<Uuid, uuid::Error> {
        self.sub.parse()
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// Validates and mints HS256 session tokens
pub struct JwtValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Signature and expiration are checked; issuer/audience are not used.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn encode(&self, claims: &JwtClaims) -> Result<String, JwtError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(JwtError::Encode)
    }

    pub fn validate(&self, token: &str) -> Result<JwtClaims, JwtError> {
        decode::<JwtClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(JwtError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> JwtValidator {
        JwtValidator::new(b"test-secret-key-for-jwt-unit-tests")
    }

    #[test]
    fn test_encode_validate_roundtrip() {
        let v = validator();
        let user_id = Uuid::new_v4();
        let org_id = Uuid::new_v4();
        let claims = JwtClaims::new(
            user_id,
            "org_admin".to_string(),
            Some(org_id),
            Duration::hours(1),
        );

        let token = v.encode(&claims).unwrap();
        let back = v.validate(&token).unwrap();

        assert_eq!(back.user_id().unwrap(), user_id);
        assert_eq!(back.role, "org_admin");
        assert_eq!(back.org_id, Some(org_id.to_string()));
        assert!(!back.pending_2fa);
    }

    #[test]
    fn test_expired_token_rejected() {
        let v = validator();
        let claims = JwtClaims::new(
            Uuid::new_v4(),
            "org_user".to_string(),
            None,
            Duration::seconds(-90),
        );
        let token = v.encode(&claims).unwrap();
        assert!(v.validate(&token).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let claims = JwtClaims::new(
            Uuid::new_v4(),
            "org_user".to_string(),
            None,
            Duration::hours(1),
        );
        let token = validator().encode(&claims).unwrap();

        let other = JwtValidator::new(b"a-completely-different-secret-value");
        assert!(other.validate(&token).is_err());
    }

    #[test]
    fn test_pending_2fa_flag_survives() {
        let v = validator();
        let claims = JwtClaims::new(
            Uuid::new_v4(),
            "org_user".to_string(),
            None,
            Duration::minutes(5),
        )
        .with_pending_2fa();

        let back = v.validate(&v.encode(&claims).unwrap()).unwrap();
        assert!(back.pending_2fa);
    }
}
