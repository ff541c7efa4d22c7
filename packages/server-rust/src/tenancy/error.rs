//! Errors raised by the tenant binding layer and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tenant_rls_core::TenantId;

/// Failures of the tenant binding layer.
///
/// Downstream failures are never wrapped here: they propagate unchanged.
/// Clear failures are not errors either; the binder logs and absorbs them.
#[derive(Debug, thiserror::Error)]
pub enum TenancyError {
    /// Authenticated principal without a usable tenant claim.
    #[error("authenticated principal has no `{claim}` claim")]
    MissingTenantClaim { claim: String },
    /// No session could be leased for the request.
    #[error("storage session unavailable: {0}")]
    SessionUnavailable(#[source] anyhow::Error),
    /// Writing the tenant into the session slot failed.
    #[error("failed to bind tenant {tenant} to storage session: {source}")]
    BindFailure {
        tenant: TenantId,
        #[source]
        source: anyhow::Error,
    },
    /// A handler touched the pinned session after the request's binding ended.
    #[error("storage session already released")]
    SessionReleased,
    /// The request succeeded downstream but its transaction did not commit.
    #[error("failed to commit tenant transaction: {0}")]
    CommitFailure(#[source] anyhow::Error),
}

impl TenancyError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingTenantClaim { .. } => StatusCode::UNAUTHORIZED,
            Self::SessionUnavailable(_)
            | Self::BindFailure { .. }
            | Self::SessionReleased
            | Self::CommitFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Internal causes stay in the logs.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::MissingTenantClaim { .. } => "Missing tenant context",
            Self::SessionUnavailable(_) | Self::BindFailure { .. } => {
                "Tenant context could not be established"
            }
            Self::SessionReleased => "Storage session no longer available",
            Self::CommitFailure(_) => "Changes could not be saved",
        }
    }
}

impl IntoResponse for TenancyError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.public_message() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_claim_is_unauthorized() {
        let err = TenancyError::MissingTenantClaim {
            claim: "tenant_id".to_string(),
        };
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.public_message(), "Missing tenant context");
        assert!(err.to_string().contains("tenant_id"));
    }

    #[test]
    fn bind_failure_is_server_error_and_hides_cause() {
        let err = TenancyError::BindFailure {
            tenant: TenantId::new("acme").unwrap(),
            source: anyhow::anyhow!("connection reset"),
        };
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.public_message().contains("connection reset"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn into_response_uses_status() {
        let response = TenancyError::SessionUnavailable(anyhow::anyhow!("pool timeout"))
            .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn commit_failure_is_server_error_and_hides_cause() {
        let err = TenancyError::CommitFailure(anyhow::anyhow!("could not serialize access"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.public_message(), "Changes could not be saved");
        assert!(err.to_string().contains("could not serialize access"));
    }
}
