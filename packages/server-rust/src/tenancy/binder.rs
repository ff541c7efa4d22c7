//! Session binder: writes the request's tenant into the storage session slot.
//!
//! The binder never leases connections. It is handed the session the
//! binding layer leased for the request, and downstream queries run on that
//! same session through [`TenantSession`](super::session::TenantSession).

use tenant_rls_core::TenantId;
use tracing::{debug, trace};

use super::error::TenancyError;
use super::session::SessionConfig;

/// Parameter used when none is configured.
pub const DEFAULT_SESSION_PARAMETER: &str = "app.current_tenant";

/// Value written on clear. Row policies treat it as "match nothing".
pub const CLEARED_SENTINEL: &str = "";

#[derive(Debug, Clone)]
pub struct SessionBinder {
    parameter: String,
}

impl SessionBinder {
    #[must_use]
    pub fn new(parameter: impl Into<String>) -> Self {
        Self {
            parameter: parameter.into(),
        }
    }

    #[must_use]
    pub fn parameter(&self) -> &str {
        &self.parameter
    }

    /// Binds `tenant` on `session` for the rest of its transaction.
    ///
    /// # Errors
    ///
    /// Any failure is a [`TenancyError::BindFailure`]; callers must abort
    /// the request rather than continue unbound.
    pub async fn bind<S>(&self, tenant: &TenantId, session: &mut S) -> Result<(), TenancyError>
    where
        S: SessionConfig + ?Sized,
    {
        session
            .set_config(&self.parameter, tenant.as_str())
            .await
            .map_err(|source| TenancyError::BindFailure {
                tenant: tenant.clone(),
                source,
            })?;
        trace!(parameter = %self.parameter, tenant = %tenant, "session slot bound");
        Ok(())
    }

    /// Writes the empty sentinel into the slot. Best-effort.
    ///
    /// Returns whether the write succeeded. Failures are expected when the
    /// transaction is already aborted; the slot is transaction-local and
    /// reverts when the transaction ends, so they are logged at debug level.
    pub async fn clear<S>(&self, session: &mut S) -> bool
    where
        S: SessionConfig + ?Sized,
    {
        match session.set_config(&self.parameter, CLEARED_SENTINEL).await {
            Ok(()) => {
                trace!(parameter = %self.parameter, "session slot cleared");
                true
            }
            Err(err) => {
                metrics::counter!("tenant_session_clear_failures_total").increment(1);
                debug!(
                    parameter = %self.parameter,
                    error = %err,
                    "clearing session slot failed; transaction end will reset it"
                );
                false
            }
        }
    }

    /// Reads the tenant currently bound on `session`.
    ///
    /// Unset and the empty sentinel both read as `None`.
    ///
    /// # Errors
    ///
    /// Propagates the backend error if the setting cannot be read.
    pub async fn read<S>(&self, session: &mut S) -> anyhow::Result<Option<TenantId>>
    where
        S: SessionConfig + ?Sized,
    {
        let value = session.current_setting(&self.parameter).await?;
        Ok(value.and_then(|v| TenantId::new(v).ok()))
    }
}

impl Default for SessionBinder {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_PARAMETER)
    }
}
