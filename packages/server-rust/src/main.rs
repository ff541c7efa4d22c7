use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tenant_rls_server::auth::JwtAuthenticator;
use tenant_rls_server::config::{ServerArgs, StorageBackend, StorageConfig};
use tenant_rls_server::network::NetworkModule;
use tenant_rls_server::observability;
use tenant_rls_server::storage::{MemoryDatabase, MemoryPool};
use tenant_rls_server::tenancy::SessionPool;
use tenant_rls_server::TenancyConfig;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();
    let obs = args.observability();
    observability::init_tracing(obs.log_json);
    if let Some(addr) = obs.metrics_addr {
        observability::install_metrics(addr)?;
    }

    let tenancy = args.tenancy();
    tenancy
        .validate()
        .context("invalid tenancy configuration")?;
    info!(
        claim = %tenancy.claim_name,
        parameter = %tenancy.session_parameter,
        "tenant binding configured"
    );

    let storage = args.storage();
    match storage.backend {
        StorageBackend::Memory => {
            let db = Arc::new(MemoryDatabase::new(tenancy.session_parameter.clone()));
            let pool = MemoryPool::new(db, storage.max_connections as usize)
                .with_acquire_timeout(storage.acquire_timeout);
            run(&args, tenancy, Arc::new(pool)).await
        }
        StorageBackend::Postgres => run_postgres(&args, tenancy, &storage).await,
    }
}

#[cfg(feature = "postgres")]
async fn run_postgres(
    args: &ServerArgs,
    tenancy: TenancyConfig,
    storage: &StorageConfig,
) -> anyhow::Result<()> {
    use tenant_rls_server::storage::PgSessionPool;

    let url = storage
        .database_url
        .as_deref()
        .context("DATABASE_URL is required for the postgres backend")?;
    let pool = PgSessionPool::connect(url, storage.max_connections, storage.acquire_timeout).await?;
    if !storage.protected_tables.is_empty() {
        pool.install_row_policies(&tenancy.row_policy(), &storage.protected_tables)
            .await
            .context("installing row policies")?;
    }
    run(args, tenancy, Arc::new(pool)).await
}

#[cfg(not(feature = "postgres"))]
async fn run_postgres(
    _args: &ServerArgs,
    _tenancy: TenancyConfig,
    _storage: &StorageConfig,
) -> anyhow::Result<()> {
    anyhow::bail!("this binary was built without the `postgres` feature")
}

async fn run<P: SessionPool>(
    args: &ServerArgs,
    tenancy: TenancyConfig,
    pool: Arc<P>,
) -> anyhow::Result<()> {
    let backend = pool.backend_name();
    let mut module = NetworkModule::new(args.network(), tenancy, pool);
    match args.auth().jwt_secret {
        Some(secret) => module = module.with_authenticator(JwtAuthenticator::hs256(secret.as_bytes())),
        None => warn!("no JWT secret configured; all requests run unauthenticated"),
    }

    let port = module.start().await?;
    info!(port, backend, "tenant-rls-server started");

    module.serve(shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; shutting down");
    }
    info!("shutdown signal received");
}
