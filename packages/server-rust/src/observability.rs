//! Tracing and metrics setup for the server binary.
//!
//! Both initializers are idempotent so tests and embedders can call them
//! more than once.

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceLock<()> = OnceLock::new();
static METRICS_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber. `RUST_LOG` overrides the default
/// `info` filter; `json` switches to one JSON object per line.
pub fn init_tracing(json: bool) {
    TRACING_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);
        // Another subscriber may already be installed (tests); keep it.
        let _ = if json {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
                .try_init()
        } else {
            registry.with(tracing_subscriber::fmt::layer()).try_init()
        };
    });
}

/// Serves Prometheus metrics on `addr`. Must run inside a tokio runtime.
///
/// # Errors
///
/// Fails if the exporter cannot bind or a recorder is already installed.
pub fn install_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    if METRICS_INIT.get().is_some() {
        return Ok(());
    }
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install metrics exporter on {addr}: {e}"))?;
    let _ = METRICS_INIT.set(());
    tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}
