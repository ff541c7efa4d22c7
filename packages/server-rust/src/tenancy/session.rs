//! Storage session abstractions and the pinned per-request session handle.

use std::sync::Arc;

use async_trait::async_trait;
use tenant_rls_core::TenantId;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use super::error::TenancyError;

/// A leased storage connection with a transaction-scoped configuration slot.
///
/// Implementations: Postgres transaction (`set_config(.., true)`), in-memory
/// session (tests, `memory` backend).
#[async_trait]
pub trait SessionConfig: Send {
    /// Writes `value` into the named transaction-local setting.
    async fn set_config(&mut self, parameter: &str, value: &str) -> anyhow::Result<()>;

    /// Reads the named setting. `None` when the engine has never seen it.
    async fn current_setting(&mut self, parameter: &str) -> anyhow::Result<Option<String>>;
}

/// How a leased session's transaction ends when it goes back to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Commit,
    Rollback,
}

/// Pool of storage sessions. A session is leased to exactly one request
/// between `acquire` and `release`.
#[async_trait]
pub trait SessionPool: Send + Sync + 'static {
    type Session: SessionConfig + Send + 'static;

    /// Leases a session and opens its transaction.
    async fn acquire(&self) -> anyhow::Result<Self::Session>;

    /// Ends the session's transaction and returns it to the pool.
    async fn release(&self, session: Self::Session, completion: Completion)
        -> anyhow::Result<()>;

    /// Short backend label for logs and health output.
    fn backend_name(&self) -> &'static str;
}

/// The session leased for one request, shared with downstream handlers.
///
/// Handlers must run their queries through [`lock`](Self::lock) so every
/// statement uses the connection the tenant was bound on. Once the binding
/// layer takes the session back, further `lock` calls fail instead of
/// silently falling back to another connection.
pub struct TenantSession<S> {
    slot: Arc<Mutex<Option<S>>>,
    tenant: TenantId,
}

impl<S> Clone for TenantSession<S> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            tenant: self.tenant.clone(),
        }
    }
}

impl<S> std::fmt::Debug for TenantSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantSession")
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

impl<S: Send> TenantSession<S> {
    pub(crate) fn new(session: S, tenant: TenantId) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(session))),
            tenant,
        }
    }

    /// Tenant the session is bound to.
    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Exclusive access to the pinned session.
    ///
    /// # Errors
    ///
    /// Returns [`TenancyError::SessionReleased`] after the request's
    /// binding has been torn down.
    pub async fn lock(&self) -> Result<MappedMutexGuard<'_, S>, TenancyError> {
        let guard = self.slot.lock().await;
        MutexGuard::try_map(guard, Option::as_mut).map_err(|_| TenancyError::SessionReleased)
    }

    /// Removes the session from the handle. Subsequent `lock` calls fail.
    pub(crate) async fn take(&self) -> Option<S> {
        self.slot.lock().await.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_fails_after_take() {
        let session = TenantSession::new(7_u32, TenantId::new("acme").unwrap());
        let clone = session.clone();
        assert_eq!(*clone.lock().await.unwrap(), 7);

        assert_eq!(session.take().await, Some(7));
        assert!(matches!(
            clone.lock().await,
            Err(TenancyError::SessionReleased)
        ));
        assert_eq!(session.take().await, None);
    }

    #[tokio::test]
    async fn clones_share_one_session() {
        let session = TenantSession::new(Vec::<u8>::new(), TenantId::new("acme").unwrap());
        let clone = session.clone();
        clone.lock().await.unwrap().push(1);
        session.lock().await.unwrap().push(2);
        assert_eq!(session.take().await, Some(vec![1, 2]));
        assert_eq!(clone.tenant().as_str(), "acme");
    }
}
