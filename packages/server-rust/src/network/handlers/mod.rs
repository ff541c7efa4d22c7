//! Axum handlers and the state they share.

pub mod health;
pub mod tenant;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use tenant::tenant_handler;

use std::sync::Arc;
use std::time::Instant;

use super::ShutdownController;
use crate::tenancy::SessionBinder;

/// Shared handler state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub shutdown: Arc<ShutdownController>,
    /// Reads the session slot for diagnostics.
    pub binder: SessionBinder,
    /// Storage backend label, e.g. `memory` or `postgres`.
    pub backend: &'static str,
    pub start_time: Instant,
}
