//! Tenant context cell: the "current tenant" slot of the executing request.
//!
//! Async request handling runs inside [`TenantCell::scope`], which installs a
//! task-local slot. The slot follows the task when the runtime moves it to
//! another worker thread, and it disappears when the scoped future completes
//! or is dropped. Code running outside any scope (plain threads, the blocking
//! pool) uses a thread-local slot instead.
//!
//! Spawned work never shares a slot with its parent. The spawn helpers copy
//! the value at spawn time into a fresh slot owned by the child, so a later
//! `set` or `clear` on either side is invisible to the other.

use std::cell::RefCell;
use std::future::Future;

use tenant_rls_core::TenantId;
use tokio::task::JoinHandle;

tokio::task_local! {
    static TASK_TENANT: RefCell<Option<TenantId>>;
}

thread_local! {
    static THREAD_TENANT: RefCell<Option<TenantId>> = const { RefCell::new(None) };
}

/// Point-in-time copy of the current tenant, used to seed spawned work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantSnapshot(Option<TenantId>);

impl TenantSnapshot {
    /// A snapshot holding no tenant.
    #[must_use]
    pub fn empty() -> Self {
        Self(None)
    }

    #[must_use]
    pub fn of(tenant: TenantId) -> Self {
        Self(Some(tenant))
    }

    #[must_use]
    pub fn tenant(&self) -> Option<&TenantId> {
        self.0.as_ref()
    }
}

/// Narrow get/set/clear access to the current tenant slot.
///
/// Every `set` must be paired with a `clear` by the same task or thread.
/// Children created through [`spawn`](Self::spawn),
/// [`spawn_blocking`](Self::spawn_blocking) or
/// [`spawn_thread`](Self::spawn_thread) own their copy and never clear the
/// parent's binding.
pub struct TenantCell;

impl TenantCell {
    /// Binds `tenant` for the calling task (or thread, outside a scope).
    ///
    /// On a runtime worker, only call this inside [`scope`](Self::scope).
    /// Unscoped, it writes the worker's thread-local slot, which every later
    /// unscoped task polled on that worker would observe. Blocking-pool and
    /// [`spawn_thread`](Self::spawn_thread) closures are safe: their slot is
    /// restored when they return.
    pub fn set(tenant: TenantId) {
        with_slot(|slot| *slot = Some(tenant));
    }

    /// Returns the bound tenant, or `None` when unbound.
    #[must_use]
    pub fn get() -> Option<TenantId> {
        with_slot(|slot| slot.clone())
    }

    /// Removes the binding. Idempotent.
    pub fn clear() {
        with_slot(|slot| *slot = None);
    }

    #[must_use]
    pub fn snapshot() -> TenantSnapshot {
        TenantSnapshot(Self::get())
    }

    /// Whether the caller runs inside a task-local scope.
    #[must_use]
    pub fn is_scoped() -> bool {
        TASK_TENANT.try_with(|_| ()).is_ok()
    }

    /// Runs `fut` with a fresh task-local slot seeded from `snapshot`.
    pub async fn scope<F: Future>(snapshot: TenantSnapshot, fut: F) -> F::Output {
        TASK_TENANT.scope(RefCell::new(snapshot.0), fut).await
    }

    /// Spawns a tokio task that starts with a copy of the current tenant.
    pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let snapshot = Self::snapshot();
        tokio::spawn(Self::scope(snapshot, fut))
    }

    /// Runs `f` on the blocking pool with a copy of the current tenant.
    ///
    /// The pool thread's previous slot is restored when `f` returns or
    /// unwinds, so a reused pool thread never carries the binding over.
    pub fn spawn_blocking<F, R>(f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let snapshot = Self::snapshot();
        tokio::task::spawn_blocking(move || {
            let _binding = ThreadBinding::enter(snapshot);
            f()
        })
    }

    /// Spawns an OS thread with a copy of the current tenant.
    pub fn spawn_thread<F, R>(f: F) -> std::thread::JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let snapshot = Self::snapshot();
        std::thread::spawn(move || {
            let _binding = ThreadBinding::enter(snapshot);
            f()
        })
    }
}

/// Seeds the thread-local slot and restores the previous value on drop.
struct ThreadBinding {
    previous: Option<TenantId>,
}

impl ThreadBinding {
    fn enter(snapshot: TenantSnapshot) -> Self {
        let previous = THREAD_TENANT.with(|cell| cell.replace(snapshot.0));
        Self { previous }
    }
}

impl Drop for ThreadBinding {
    fn drop(&mut self) {
        let previous = self.previous.take();
        // try_with: the thread-local may already be gone during thread teardown.
        let _ = THREAD_TENANT.try_with(|cell| *cell.borrow_mut() = previous);
    }
}

fn with_slot<R>(f: impl FnOnce(&mut Option<TenantId>) -> R) -> R {
    if TenantCell::is_scoped() {
        TASK_TENANT.with(|cell| f(&mut cell.borrow_mut()))
    } else {
        THREAD_TENANT.with(|cell| f(&mut cell.borrow_mut()))
    }
}
