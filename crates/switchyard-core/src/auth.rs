//! Bearer token validation contract.
//!
//! The router only depends on [`TokenValidator`]; how a token is checked
//! is up to the implementation. [`StaticTokenValidator`] maps a fixed
//! table of tokens from configuration to identities.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::config::StaticToken;
use crate::types::SessionClaims;

/// Boxed future used at dyn-compatible async seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Reasons a credential was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token")]
    InvalidToken,

    #[error("token validator unavailable: {0}")]
    Unavailable(String),
}

/// Validates a bearer token and returns the identity it carries.
pub trait TokenValidator: Send + Sync {
    fn validate<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<SessionClaims, AuthError>>;
}

/// Token table loaded from `[[auth.tokens]]`.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, SessionClaims>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(tokens: &[StaticToken]) -> Self {
        let mut validator = Self::new();
        for t in tokens {
            validator = validator.with_token(
                &t.token,
                SessionClaims::new(&t.user_id, t.organization_id.clone()),
            );
        }
        validator
    }

    /// Accept `token` as `claims`.
    pub fn with_token(mut self, token: &str, claims: SessionClaims) -> Self {
        self.tokens.insert(token.to_string(), claims);
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl TokenValidator for StaticTokenValidator {
    fn validate<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<SessionClaims, AuthError>> {
        Box::pin(async move {
            if token.is_empty() {
                return Err(AuthError::MissingToken);
            }
            self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
        })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn parse_bearer(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> StaticTokenValidator {
        StaticTokenValidator::from_config(&[StaticToken {
            token: "good".to_string(),
            user_id: "user1".to_string(),
            organization_id: Some("acme".to_string()),
        }])
    }

    #[tokio::test]
    async fn accepts_known_token() {
        let claims = validator().validate("good").await.unwrap();
        assert_eq!(claims.user_id, "user1");
        assert_eq!(claims.organization_id.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn rejects_unknown_token() {
        assert_eq!(
            validator().validate("bad").await,
            Err(AuthError::InvalidToken)
        );
    }

    #[tokio::test]
    async fn rejects_empty_token() {
        assert_eq!(validator().validate("").await, Err(AuthError::MissingToken));
    }

    #[test]
    fn parse_bearer_header() {
        assert_eq!(parse_bearer("Bearer abc"), Some("abc"));
        assert_eq!(parse_bearer("bearer   abc "), Some("abc"));
        assert_eq!(parse_bearer("Basic abc"), None);
        assert_eq!(parse_bearer("Bearer "), None);
        assert_eq!(parse_bearer("abc"), None);
    }
}
