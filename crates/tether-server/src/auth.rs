//! Connection identity.
//!
//! The relay never issues credentials. It only resolves a presented bearer
//! token to a [`PrincipalId`] through an [`IdentityProvider`].

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};
use tether_core::ids::PrincipalId;
use tether_settings::AuthSettings;

/// Why a credential was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No bearer token in the header or query.
    #[error("no token provided")]
    MissingCredential,
    /// Signature, algorithm, or expiry check failed.
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// Token verified but carries no usable principal claim.
    #[error("token has no {0} claim")]
    MissingClaim(String),
    /// This relay accepts no credentials.
    #[error("authentication is not configured")]
    NotConfigured,
}

/// Resolves a credential to a principal.
pub trait IdentityProvider: Send + Sync {
    /// Verify `credential` and return the principal it names.
    fn authenticate(&self, credential: &str) -> Result<PrincipalId, AuthError>;
}

/// Verifies HS256 JWTs and reads the principal from one claim.
///
/// `exp` is enforced when present but not required.
pub struct JwtIdentityProvider {
    key: DecodingKey,
    validation: Validation,
    claim: String,
}

impl JwtIdentityProvider {
    /// Build a verifier for `secret` reading the principal from `claim`.
    pub fn new(secret: &str, claim: impl Into<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            claim: claim.into(),
        }
    }

    /// Build from settings; `None` when no secret is configured.
    pub fn from_settings(settings: &AuthSettings) -> Option<Self> {
        settings
            .jwt_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|secret| Self::new(secret, settings.principal_claim.clone()))
    }
}

impl IdentityProvider for JwtIdentityProvider {
    fn authenticate(&self, credential: &str) -> Result<PrincipalId, AuthError> {
        let data = jsonwebtoken::decode::<Map<String, Value>>(credential, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let principal = match data.claims.get(&self.claim) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        if principal.is_empty() {
            return Err(AuthError::MissingClaim(self.claim.clone()));
        }
        Ok(PrincipalId::from(principal))
    }
}

/// Refuses every credential. Used when no secret is configured.
pub struct RejectAllIdentityProvider;

impl IdentityProvider for RejectAllIdentityProvider {
    fn authenticate(&self, _credential: &str) -> Result<PrincipalId, AuthError> {
        Err(AuthError::NotConfigured)
    }
}

/// Pull the bearer token from `Authorization`, else from the `token` query
/// parameter.
pub fn extract_credential(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then_some(token)
        });

    from_header
        .or(query_token)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
}

/// Resolve the caller of an HTTP request: header or query credential, then
/// `identity`. No credential at all is [`AuthError::MissingCredential`].
pub fn authenticate_request(
    identity: &dyn IdentityProvider,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<PrincipalId, AuthError> {
    let credential = extract_credential(headers, query_token).ok_or(AuthError::MissingCredential)?;
    identity.authenticate(&credential)
}
