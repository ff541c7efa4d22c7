use crate::principal::Principal;
use crate::tenant::TenantId;

/// Per-request context carrying identity, tenancy, and tracing information.
/// Inserted into request extensions by the tenant binding layer so handlers
/// can see which tenant the storage session is bound to.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Identifier of the server node handling this request.
    pub node_id: String,
    /// Tenant bound for this request. `None` for public requests.
    pub tenant_id: Option<TenantId>,
    /// Authenticated principal, if the request is authenticated.
    pub principal: Option<Principal>,
    /// Distributed trace identifier for observability.
    pub trace_id: String,
}

impl RequestContext {
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.tenant_id.is_some()
    }
}
