//! Bearer-token authentication for the WebSocket route.
//!
//! Tokens are HS256 JWTs carrying the user in `sub`. Browsers cannot set
//! headers on a WebSocket handshake, so a `token` query parameter is accepted
//! as well; the `Authorization` header wins when both are present.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use scribe_core::{AdmissionError, Identity};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// JWT claims issued by the account service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID.
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "currentWorkspaceId")]
    pub current_workspace_id: Option<String>,
    /// Expiry, seconds since the epoch.
    pub exp: u64,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Identity {
            user_id: claims.sub,
            display_name: claims.name,
            workspace_id: claims.current_workspace_id,
        }
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Malformed Authorization header")]
    InvalidAuthHeader,

    #[error("No JWT secret configured")]
    NotConfigured,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

impl From<AuthError> for AdmissionError {
    fn from(err: AuthError) -> Self {
        AdmissionError::Unauthenticated(err.to_string())
    }
}

/// Verifies bearer tokens.
#[derive(Clone)]
pub struct Authenticator {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl Authenticator {
    /// Create an authenticator. Without a secret every token is rejected.
    #[must_use]
    pub fn new(secret: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            key: secret.map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation,
        }
    }

    /// Verify a token and return the identity it carries.
    ///
    /// # Errors
    ///
    /// Returns an error if no secret is configured or the token is invalid.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let key = self.key.as_ref().ok_or(AuthError::NotConfigured)?;

        let data = decode::<Claims>(token, key, &self.validation).map_err(|e| {
            debug!(error = %e, "JWT validation failed");
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        if data.claims.sub.is_empty() {
            return Err(AuthError::InvalidToken("empty subject".into()));
        }
        Ok(data.claims.into())
    }

    /// Authenticate a handshake from its headers or `token` query parameter.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable token is present or it fails verification.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<Identity, AuthError> {
        let token = match headers.get(AUTHORIZATION) {
            Some(value) => {
                let value = value.to_str().map_err(|_| AuthError::InvalidAuthHeader)?;
                bearer_token(value)?
            }
            None => query_token
                .filter(|token| !token.is_empty())
                .ok_or(AuthError::MissingToken)?,
        };
        self.verify(token)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` value.
fn bearer_token(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }
    Ok(token)
}
