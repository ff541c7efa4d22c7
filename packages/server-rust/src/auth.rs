//! Bearer-token authentication producing a [`Principal`].
//!
//! Runs before tenant binding. A request without an `Authorization` header
//! passes through anonymously; a present but invalid token is rejected with
//! 401 before any storage session is leased.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::{json, Map, Value};
use tenant_rls_core::Principal;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authorization header is not a bearer token")]
    MalformedHeader,
    #[error("token rejected: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid credentials" })),
        )
            .into_response()
    }
}

/// HS256 token verifier.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthenticator").finish_non_exhaustive()
    }
}

impl JwtAuthenticator {
    /// Builds a verifier for tokens signed with `secret`. Tokens must carry
    /// an `exp` claim.
    #[must_use]
    pub fn hs256(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verifies `token` and turns its claims into a principal. The `sub`
    /// claim becomes the principal id.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidToken`] on a bad signature, expiry, or
    /// malformed payload.
    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let data = decode::<Map<String, Value>>(token, &self.key, &self.validation)?;
        let id = data
            .claims
            .get("sub")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Principal::authenticated(id, data.claims))
    }

    fn principal_from(&self, req: &Request) -> Result<Option<Principal>, AuthError> {
        let Some(value) = req.headers().get(header::AUTHORIZATION) else {
            return Ok(None);
        };
        let token = value
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(AuthError::MalformedHeader)?;
        self.verify(token.trim()).map(Some)
    }
}

/// Axum middleware inserting the verified [`Principal`] as an extension.
pub async fn authenticate(
    State(auth): State<Arc<JwtAuthenticator>>,
    mut req: Request,
    next: Next,
) -> Response {
    match auth.principal_from(&req) {
        Ok(Some(principal)) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Ok(None) => next.run(req).await,
        Err(err) => {
            debug!(error = %err, "request authentication failed");
            err.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use jsonwebtoken::{encode, EncodingKey, Header};

    use super::*;

    const SECRET: &[u8] = b"test-secret";

    fn token(claims: &Value, secret: &[u8]) -> String {
        encode(&Header::default(), claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn exp() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 3600
    }

    #[test]
    fn verify_extracts_sub_and_claims() {
        let auth = JwtAuthenticator::hs256(SECRET);
        let jwt = token(
            &json!({ "sub": "alice", "tenant_id": "acme", "roles": ["admin"], "exp": exp() }),
            SECRET,
        );
        let principal = auth.verify(&jwt).unwrap();
        assert_eq!(principal.id, "alice");
        assert!(principal.authenticated);
        assert_eq!(principal.claim("tenant_id"), Some("acme"));
        assert_eq!(principal.roles, vec!["admin"]);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let auth = JwtAuthenticator::hs256(SECRET);
        let jwt = token(&json!({ "sub": "alice", "exp": exp() }), b"other");
        assert!(matches!(auth.verify(&jwt), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn expired_token_is_rejected() {
        let auth = JwtAuthenticator::hs256(SECRET);
        let jwt = token(&json!({ "sub": "alice", "exp": 1_000 }), SECRET);
        assert!(auth.verify(&jwt).is_err());
    }

    #[test]
    fn missing_header_is_anonymous() {
        let auth = JwtAuthenticator::hs256(SECRET);
        let req = Request::builder().body(axum::body::Body::empty()).unwrap();
        assert!(auth.principal_from(&req).unwrap().is_none());
    }

    #[test]
    fn non_bearer_header_is_malformed() {
        let auth = JwtAuthenticator::hs256(SECRET);
        let req = Request::builder()
            .header(header::AUTHORIZATION, "Basic dXNlcjpwYXNz")
            .body(axum::body::Body::empty())
            .unwrap();
        assert!(matches!(
            auth.principal_from(&req),
            Err(AuthError::MalformedHeader)
        ));
    }

    #[test]
    fn auth_error_maps_to_unauthorized() {
        let response = AuthError::MalformedHeader.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
