//! In-memory session pool that honours the session-slot and row-policy
//! contract of the Postgres backend.
//!
//! - Settings written through [`SessionConfig::set_config`] are transaction
//!   local: they vanish when the session is released, whether the
//!   transaction commits or rolls back.
//! - Reads go through [`RowPolicy`], so an unset or empty slot matches no
//!   rows.
//! - Inserts are checked against the slot and buffered until commit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::rls::{PolicyError, RowPolicy};
use crate::tenancy::session::{Completion, SessionConfig, SessionPool};

/// A stored row. `tenant_id` is the column row policies compare against.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRow {
    pub tenant_id: String,
    pub data: Value,
}

/// Shared table storage behind every [`MemorySession`].
#[derive(Debug)]
pub struct MemoryDatabase {
    policy: RowPolicy,
    tables: DashMap<String, Vec<MemoryRow>>,
    fail_set_config: AtomicBool,
    set_config_calls: AtomicU64,
    next_session_id: AtomicU64,
}

impl MemoryDatabase {
    /// Creates an empty database whose row policies read `parameter`.
    #[must_use]
    pub fn new(parameter: impl Into<String>) -> Self {
        Self {
            policy: RowPolicy::new(parameter),
            tables: DashMap::new(),
            fail_set_config: AtomicBool::new(false),
            set_config_calls: AtomicU64::new(0),
            next_session_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &RowPolicy {
        &self.policy
    }

    /// Inserts a row as the table owner, bypassing row policies.
    pub fn seed(&self, table: &str, tenant_id: &str, data: Value) {
        self.tables.entry(table.to_string()).or_default().push(MemoryRow {
            tenant_id: tenant_id.to_string(),
            data,
        });
    }

    /// Unfiltered row count, as seen by the table owner.
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |rows| rows.len())
    }

    /// Makes every subsequent `set_config` call fail.
    pub fn fail_set_config(&self, fail: bool) {
        self.fail_set_config.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn set_config_calls(&self) -> u64 {
        self.set_config_calls.load(Ordering::SeqCst)
    }

    fn visible_rows(&self, table: &str, slot: Option<&str>) -> Vec<Value> {
        self.tables.get(table).map_or_else(Vec::new, |rows| {
            rows.iter()
                .filter(|row| self.policy.admits(&row.tenant_id, slot))
                .map(|row| row.data.clone())
                .collect()
        })
    }
}

/// One leased in-memory connection.
#[derive(Debug)]
pub struct MemorySession {
    id: u64,
    db: Arc<MemoryDatabase>,
    local_settings: HashMap<String, String>,
    pending: Vec<(String, MemoryRow)>,
    permit: Option<OwnedSemaphorePermit>,
}

impl MemorySession {
    fn new(db: Arc<MemoryDatabase>) -> Self {
        let id = db.next_session_id.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            db,
            local_settings: HashMap::new(),
            pending: Vec::new(),
            permit: None,
        }
    }

    /// Stable identifier of the underlying connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Raw value of a setting, without going through the async trait.
    #[must_use]
    pub fn setting(&self, parameter: &str) -> Option<&str> {
        self.local_settings.get(parameter).map(String::as_str)
    }

    fn slot(&self) -> Option<&str> {
        self.setting(self.db.policy.parameter())
    }

    /// Rows of `table` visible under the current slot, including this
    /// transaction's uncommitted inserts.
    #[must_use]
    pub fn select(&self, table: &str) -> Vec<Value> {
        let slot = self.slot();
        let mut rows = self.db.visible_rows(table, slot);
        rows.extend(
            self.pending
                .iter()
                .filter(|(t, row)| t == table && self.db.policy.admits(&row.tenant_id, slot))
                .map(|(_, row)| row.data.clone()),
        );
        rows
    }

    /// Inserts a row, enforcing the policy's `WITH CHECK` clause.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Violation`] if `tenant_id` differs from the
    /// bound tenant or nothing is bound.
    pub fn insert(&mut self, table: &str, tenant_id: &str, data: Value) -> Result<(), PolicyError> {
        if !self.db.policy.admits(tenant_id, self.slot()) {
            return Err(PolicyError::Violation {
                table: table.to_string(),
            });
        }
        self.pending.push((
            table.to_string(),
            MemoryRow {
                tenant_id: tenant_id.to_string(),
                data,
            },
        ));
        Ok(())
    }

    fn end_transaction(&mut self, completion: Completion) {
        let pending = std::mem::take(&mut self.pending);
        if completion == Completion::Commit {
            for (table, row) in pending {
                self.db.tables.entry(table).or_default().push(row);
            }
        }
        self.local_settings.clear();
    }
}

#[async_trait]
impl SessionConfig for MemorySession {
    async fn set_config(&mut self, parameter: &str, value: &str) -> anyhow::Result<()> {
        self.db.set_config_calls.fetch_add(1, Ordering::SeqCst);
        if self.db.fail_set_config.load(Ordering::SeqCst) {
            anyhow::bail!("set_config rejected by session {}", self.id);
        }
        self.local_settings
            .insert(parameter.to_string(), value.to_string());
        Ok(())
    }

    async fn current_setting(&mut self, parameter: &str) -> anyhow::Result<Option<String>> {
        Ok(self.setting(parameter).map(str::to_string))
    }
}

/// Fixed-size pool of [`MemorySession`]s.
#[derive(Debug)]
pub struct MemoryPool {
    db: Arc<MemoryDatabase>,
    idle: Mutex<Vec<MemorySession>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    acquired: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl MemoryPool {
    #[must_use]
    pub fn new(db: Arc<MemoryDatabase>, max_connections: usize) -> Self {
        Self {
            db,
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
            acquire_timeout: Duration::from_secs(5),
            acquired: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    #[must_use]
    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    /// Sessions currently parked in the pool.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// First non-absent value of `parameter` among idle sessions.
    #[must_use]
    pub fn peek_idle_setting(&self, parameter: &str) -> Option<String> {
        self.idle
            .lock()
            .iter()
            .find_map(|session| session.setting(parameter).map(str::to_string))
    }

    #[must_use]
    pub fn acquired_total(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionPool for MemoryPool {
    type Session = MemorySession;

    async fn acquire(&self) -> anyhow::Result<MemorySession> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for a storage session"))??;

        let mut session = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| MemorySession::new(Arc::clone(&self.db)));
        session.permit = Some(permit);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(session)
    }

    async fn release(
        &self,
        mut session: MemorySession,
        completion: Completion,
    ) -> anyhow::Result<()> {
        session.end_transaction(completion);
        match completion {
            Completion::Commit => self.commits.fetch_add(1, Ordering::SeqCst),
            Completion::Rollback => self.rollbacks.fetch_add(1, Ordering::SeqCst),
        };
        let permit = session.permit.take();
        self.idle.lock().push(session);
        drop(permit);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
