//! HTTP server with deferred startup.
//!
//! `new()` allocates shared state, `start()` binds the listener, and
//! `serve()` accepts connections until shutdown. Between `start()` and
//! `serve()` the caller can read the bound port or grab the shutdown
//! controller.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::{NetworkConfig, TlsConfig};
use super::handlers::{
    health_handler, liveness_handler, readiness_handler, tenant_handler, AppState,
};
use super::middleware::{build_http_layers, track_in_flight};
use super::shutdown::ShutdownController;
use crate::auth::{authenticate, JwtAuthenticator};
use crate::config::TenancyConfig;
use crate::tenancy::{SessionPool, TenantBindingLayer};

pub struct NetworkModule<P: SessionPool> {
    config: NetworkConfig,
    tenancy: TenancyConfig,
    pool: Arc<P>,
    authenticator: Option<Arc<JwtAuthenticator>>,
    node_id: String,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl<P: SessionPool> NetworkModule<P> {
    /// Creates the module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, tenancy: TenancyConfig, pool: Arc<P>) -> Self {
        Self {
            config,
            tenancy,
            pool,
            authenticator: None,
            node_id: format!("node-{}", uuid::Uuid::new_v4()),
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// Verifies bearer tokens before tenant binding. Without an
    /// authenticator every API request is treated as anonymous.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: JwtAuthenticator) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    #[must_use]
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the router.
    ///
    /// - `GET /health`, `/health/live`, `/health/ready`: unauthenticated,
    ///   never bound to a tenant
    /// - `GET /v1/tenant`: in-flight tracking, then authentication, then
    ///   tenant binding around the handler
    pub fn build_router(&self) -> Router {
        let state = AppState {
            shutdown: Arc::clone(&self.shutdown),
            binder: self.tenancy.binder(),
            backend: self.pool.backend_name(),
            start_time: Instant::now(),
        };

        let mut api = Router::new()
            .route("/v1/tenant", get(tenant_handler::<P::Session>))
            .layer(TenantBindingLayer::new(
                Arc::clone(&self.pool),
                self.tenancy.extractor(),
                self.tenancy.binder(),
                self.node_id.clone(),
            ));
        if let Some(authenticator) = &self.authenticator {
            api = api.layer(from_fn_with_state(Arc::clone(authenticator), authenticate));
        }
        let api = api.layer(from_fn_with_state(
            Arc::clone(&self.shutdown),
            track_in_flight,
        ));

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .merge(api)
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the listener and returns the actual port (useful with port 0).
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests.
    ///
    /// # Errors
    ///
    /// Fails if `start()` was not called first or on a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let Some(listener) = self.listener.take() else {
            anyhow::bail!("start() must be called before serve()");
        };
        let router = self.build_router();
        self.shutdown.set_ready();

        match &self.config.tls {
            Some(tls) => serve_tls(listener, router, tls, shutdown).await?,
            None => {
                info!("serving plain HTTP");
                axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown)
                    .await?;
            }
        }

        self.shutdown.trigger_shutdown();
        if self
            .shutdown
            .wait_for_drain(self.config.drain_timeout)
            .await
        {
            info!("all requests drained");
        } else {
            warn!(
                in_flight = self.shutdown.in_flight_count(),
                "drain timeout expired"
            );
        }
        Ok(())
    }
}

/// TLS via `axum-server`, reusing the pre-bound listener.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &TlsConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load TLS certificates: {e}"))?;

    let addr = listener.local_addr()?;
    let handle = axum_server::Handle::new();
    let trigger = handle.clone();
    tokio::spawn(async move {
        shutdown.await;
        trigger.graceful_shutdown(None);
    });

    info!(%addr, "serving TLS");
    axum_server::from_tcp_rustls(listener.into_std()?, rustls)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}
