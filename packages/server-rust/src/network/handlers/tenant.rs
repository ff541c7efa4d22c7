//! `GET /v1/tenant`: what this request is bound to, as seen from both sides.
//!
//! `tenant` is the context cell value and `session_tenant` is read back
//! from the pinned storage session. For a bound request the two agree; for
//! a public request both are null.

use axum::extract::{Request, State};
use axum::Json;
use serde_json::{json, Value};
use tenant_rls_core::RequestContext;

use super::AppState;
use crate::tenancy::{SessionConfig, TenancyError, TenantCell, TenantSession};

/// Reports the tenant binding of the current request.
///
/// # Errors
///
/// Fails if the pinned session was already released or cannot be read.
pub async fn tenant_handler<S>(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<Value>, TenancyError>
where
    S: SessionConfig + Send + 'static,
{
    let context = req.extensions().get::<RequestContext>().cloned();
    let pinned = req.extensions().get::<TenantSession<S>>().cloned();

    let session_tenant = match pinned {
        Some(pinned) => {
            let mut session = pinned.lock().await?;
            let bound = state
                .binder
                .read(&mut *session)
                .await
                .map_err(TenancyError::SessionUnavailable)?;
            bound
        }
        None => None,
    };

    Ok(Json(json!({
        "tenant": TenantCell::get(),
        "session_tenant": session_tenant,
        "bound": context.as_ref().is_some_and(RequestContext::is_bound),
        "trace_id": context.as_ref().map(|c| c.trace_id.clone()),
        "node_id": context.map(|c| c.node_id),
        "backend": state.backend,
    })))
}
