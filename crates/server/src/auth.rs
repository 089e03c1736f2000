//! Caller authorization boundary.
//!
//! Both the query endpoints and WebSocket admission ask an [`Authorizer`]
//! whether a bearer token is acceptable and, if so, who it belongs to.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
}

#[derive(Error, Debug, PartialEq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token has no subject")]
    MissingSubject,
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
}

/// HS256 JWT validation. The `sub` claim is the caller's identity.
pub struct JwtAuthorizer {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthorizer {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl Authorizer for JwtAuthorizer {
    async fn authorize(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        match data.claims.sub {
            Some(subject) if !subject.is_empty() => Ok(Identity { subject }),
            _ => Err(AuthError::MissingSubject),
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header. The
/// scheme name is matched case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret";

    fn token(secret: &str, claims: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn exp_in(secs: i64) -> i64 {
        chrono::Utc::now().timestamp() + secs
    }

    #[tokio::test]
    async fn test_valid_token_yields_subject() {
        let auth = JwtAuthorizer::new(SECRET);
        let t = token(SECRET, json!({"sub": "ops@example.com", "exp": exp_in(900)}));
        assert_eq!(
            auth.authorize(&t).await,
            Ok(Identity {
                subject: "ops@example.com".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_wrong_secret_is_rejected() {
        let auth = JwtAuthorizer::new(SECRET);
        let t = token("other-secret", json!({"sub": "ops@example.com", "exp": exp_in(900)}));
        assert!(matches!(
            auth.authorize(&t).await,
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected() {
        let auth = JwtAuthorizer::new(SECRET);
        let t = token(SECRET, json!({"sub": "ops@example.com", "exp": exp_in(-3600)}));
        assert!(matches!(
            auth.authorize(&t).await,
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn test_token_without_subject_is_rejected() {
        let auth = JwtAuthorizer::new(SECRET);
        let t = token(SECRET, json!({"exp": exp_in(900)}));
        assert_eq!(auth.authorize(&t).await, Err(AuthError::MissingSubject));
        assert_eq!(auth.authorize("").await, Err(AuthError::MissingToken));
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_bearer_scheme_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("BEARER abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }
}
