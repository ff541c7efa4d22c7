//! Tenant RLS core: tenant identity, principals, extraction, and request context.

pub mod context;
pub mod extract;
pub mod principal;
pub mod tenant;

pub use context::RequestContext;
pub use extract::{Extraction, TenantExtractor, DEFAULT_TENANT_CLAIM};
pub use principal::Principal;
pub use tenant::{InvalidTenantId, TenantId};
