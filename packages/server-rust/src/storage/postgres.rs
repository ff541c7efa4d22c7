//! Postgres session pool backed by `sqlx`.
//!
//! Every leased [`PgSession`] is an open transaction, so the slot written by
//! `set_config(.., true)` is transaction-local and reverts on commit or
//! rollback even if the explicit clear fails.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::info;

use super::rls::RowPolicy;
use crate::tenancy::session::{Completion, SessionConfig, SessionPool};

/// One leased connection with its transaction open.
pub struct PgSession {
    tx: Transaction<'static, Postgres>,
}

impl PgSession {
    /// Connection to run tenant queries on. Row policies see the bound slot.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut *self.tx
    }
}

impl std::fmt::Debug for PgSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSession").finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionConfig for PgSession {
    async fn set_config(&mut self, parameter: &str, value: &str) -> anyhow::Result<()> {
        sqlx::query("SELECT set_config($1, $2, true)")
            .bind(parameter)
            .bind(value)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn current_setting(&mut self, parameter: &str) -> anyhow::Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT current_setting($1, true)")
            .bind(parameter)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(value)
    }
}

/// `sqlx` pool handing out transaction-wrapped sessions.
#[derive(Debug, Clone)]
pub struct PgSessionPool {
    pool: PgPool,
}

impl PgSessionPool {
    /// Connects a pool. The URL is never logged since it may hold credentials.
    ///
    /// # Errors
    ///
    /// Fails if the URL does not parse or no connection can be established.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let options = PgConnectOptions::from_str(url)?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await?;
        info!(max_connections, "postgres session pool connected");
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn inner(&self) -> &PgPool {
        &self.pool
    }

    /// Enables and forces row-level security on each table, reading the
    /// tenant from `policy`'s parameter.
    ///
    /// # Errors
    ///
    /// Fails on an invalid identifier or if any DDL statement fails.
    pub async fn install_row_policies(
        &self,
        policy: &RowPolicy,
        tables: &[String],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in tables {
            for statement in policy.statements(table)? {
                sqlx::query(&statement).execute(&mut *tx).await?;
            }
            info!(table = %table, parameter = %policy.parameter(), "row policy installed");
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl SessionPool for PgSessionPool {
    type Session = PgSession;

    async fn acquire(&self) -> anyhow::Result<PgSession> {
        let tx = self.pool.begin().await?;
        Ok(PgSession { tx })
    }

    async fn release(&self, session: PgSession, completion: Completion) -> anyhow::Result<()> {
        match completion {
            Completion::Commit => session.tx.commit().await?,
            Completion::Rollback => session.tx.rollback().await?,
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
