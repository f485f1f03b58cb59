//! Bearer-token authentication
//!
//! Tokens are HS256-signed JWTs with a pinned issuer. The subject claim is
//! the participant identity; the `role` claim drives authorisation and the
//! `blocked` claim rejects suspended accounts at the middleware boundary.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};

/// JWT claims structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the participant identity (username)
    pub sub: String,
    /// Issuer, pinned at verification
    pub iss: String,
    /// Expiration time (seconds since epoch)
    pub exp: i64,
    /// Issued at (seconds since epoch)
    pub iat: i64,
    /// Authorisation role, e.g. "admin"
    #[serde(default)]
    pub role: String,
    /// Suspended accounts carry this flag and are rejected everywhere
    #[serde(default)]
    pub blocked: bool,
}

/// Identity attached to a request after successful authentication
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub username: String,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// Verifies bearer tokens against the configured secret and issuer
pub struct TokenVerifier {
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str, issuer: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify a token and return the authenticated identity.
    /// Blocked accounts are rejected here so no handler sees them.
    pub fn verify(&self, token: &str) -> Result<AuthUser> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| ChatError::unauthenticated(format!("invalid token: {}", e)))?;

        if data.claims.blocked {
            return Err(ChatError::forbidden("account is blocked"));
        }
        if data.claims.sub.is_empty() {
            return Err(ChatError::unauthenticated("token has no subject"));
        }

        Ok(AuthUser {
            username: data.claims.sub,
            role: data.claims.role,
        })
    }
}

/// Issue a signed token. Used by tests and operational tooling; the login
/// service that mints production tokens lives outside this crate.
pub fn issue_token(
    secret: &str,
    issuer: &str,
    username: &str,
    role: &str,
    ttl_secs: i64,
) -> Result<String> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: username.to_string(),
        iss: issuer.to_string(),
        exp: now + ttl_secs,
        iat: now,
        role: role.to_string(),
        blocked: false,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ChatError::internal(format!("token encode: {}", e)))
}
