//! Request-scoped tenant binding.
//!
//! [`TenantBindingLayer`] ties the pieces together: the caller's tenant is
//! extracted from the authenticated [`Principal`](tenant_rls_core::Principal),
//! written into the leased storage session by [`SessionBinder`], published
//! to in-process code through [`TenantCell`], and torn down again before
//! the request completes.

pub mod binder;
pub mod cell;
pub mod coordinator;
pub mod error;
pub mod session;

pub use binder::{SessionBinder, CLEARED_SENTINEL, DEFAULT_SESSION_PARAMETER};
pub use cell::{TenantCell, TenantSnapshot};
pub use coordinator::{Phase, TenantBindingLayer, TenantBindingService};
pub use error::TenancyError;
pub use session::{Completion, SessionConfig, SessionPool, TenantSession};
