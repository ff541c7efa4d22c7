//! Server configuration from command-line flags and environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tenant_rls_core::{TenantExtractor, DEFAULT_TENANT_CLAIM};

use crate::network::{NetworkConfig, TlsConfig};
use crate::storage::rls::{validate_parameter, PolicyError, RowPolicy};
use crate::tenancy::{SessionBinder, DEFAULT_SESSION_PARAMETER};

/// The two names this layer is configured by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenancyConfig {
    /// Principal claim holding the tenant id.
    pub claim_name: String,
    /// Transaction-local setting the tenant is written to.
    pub session_parameter: String,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            claim_name: DEFAULT_TENANT_CLAIM.to_string(),
            session_parameter: DEFAULT_SESSION_PARAMETER.to_string(),
        }
    }
}

impl TenancyConfig {
    /// # Errors
    ///
    /// Rejects a session parameter that is not `prefix.name`.
    pub fn validate(&self) -> Result<(), PolicyError> {
        validate_parameter(&self.session_parameter)
    }

    #[must_use]
    pub fn extractor(&self) -> TenantExtractor {
        TenantExtractor::new(self.claim_name.clone())
    }

    #[must_use]
    pub fn binder(&self) -> SessionBinder {
        SessionBinder::new(self.session_parameter.clone())
    }

    #[must_use]
    pub fn row_policy(&self) -> RowPolicy {
        RowPolicy::new(self.session_parameter.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Tables to install row policies on at startup.
    pub protected_tables: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// HS256 secret. Without one every request is anonymous.
    pub jwt_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_json: bool,
    pub metrics_addr: Option<SocketAddr>,
}

/// Command-line interface of the `tenant-rls-server` binary.
#[derive(Debug, Parser)]
#[command(name = "tenant-rls-server", version, about)]
pub struct ServerArgs {
    #[arg(long, env = "TENANT_RLS_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "TENANT_RLS_PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "TENANT_RLS_TENANT_CLAIM", default_value = DEFAULT_TENANT_CLAIM)]
    pub tenant_claim: String,

    #[arg(long, env = "TENANT_RLS_SESSION_PARAMETER", default_value = DEFAULT_SESSION_PARAMETER)]
    pub session_parameter: String,

    #[arg(long, env = "TENANT_RLS_STORAGE", value_enum, default_value_t = StorageBackend::Memory)]
    pub storage: StorageBackend,

    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "TENANT_RLS_MAX_CONNECTIONS", default_value_t = 10)]
    pub max_connections: u32,

    /// Seconds to wait for a pooled session before failing the request.
    #[arg(long, env = "TENANT_RLS_ACQUIRE_TIMEOUT_SECS", default_value_t = 5)]
    pub acquire_timeout_secs: u64,

    /// Comma-separated tables to protect with row policies at startup.
    #[arg(long, env = "TENANT_RLS_PROTECTED_TABLES", value_delimiter = ',')]
    pub protected_tables: Vec<String>,

    #[arg(long, env = "TENANT_RLS_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    #[arg(long, env = "TENANT_RLS_LOG_JSON")]
    pub log_json: bool,

    #[arg(long, env = "TENANT_RLS_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    #[arg(long, env = "TENANT_RLS_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "TENANT_RLS_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    #[arg(long, env = "TENANT_RLS_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,
}

impl ServerArgs {
    #[must_use]
    pub fn network(&self) -> NetworkConfig {
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert_path: cert.clone(),
                key_path: key.clone(),
            }),
            _ => None,
        };
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            tls,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            ..NetworkConfig::default()
        }
    }

    #[must_use]
    pub fn tenancy(&self) -> TenancyConfig {
        TenancyConfig {
            claim_name: self.tenant_claim.clone(),
            session_parameter: self.session_parameter.clone(),
        }
    }

    #[must_use]
    pub fn storage(&self) -> StorageConfig {
        StorageConfig {
            backend: self.storage,
            database_url: self.database_url.clone(),
            max_connections: self.max_connections,
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
            protected_tables: self
                .protected_tables
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn auth(&self) -> AuthConfig {
        AuthConfig {
            jwt_secret: self.jwt_secret.clone(),
        }
    }

    #[must_use]
    pub fn observability(&self) -> ObservabilityConfig {
        ObservabilityConfig {
            log_json: self.log_json,
            metrics_addr: self.metrics_addr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServerArgs {
        ServerArgs::try_parse_from(std::iter::once("tenant-rls-server").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn tenancy_defaults() {
        let config = TenancyConfig::default();
        assert_eq!(config.claim_name, "tenant_id");
        assert_eq!(config.session_parameter, "app.current_tenant");
        assert!(config.validate().is_ok());
        assert_eq!(config.binder().parameter(), "app.current_tenant");
        assert_eq!(config.extractor().claim(), "tenant_id");
    }

    #[test]
    fn invalid_session_parameter_fails_validation() {
        let config = TenancyConfig {
            session_parameter: "current_tenant".to_string(),
            ..TenancyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn flags_override_names() {
        let args = parse(&[
            "--tenant-claim",
            "org",
            "--session-parameter",
            "myapp.org",
            "--port",
            "9000",
        ]);
        let tenancy = args.tenancy();
        assert_eq!(tenancy.claim_name, "org");
        assert_eq!(tenancy.session_parameter, "myapp.org");
        assert_eq!(args.network().port, 9000);
    }

    #[test]
    fn protected_tables_split_on_commas() {
        let args = parse(&["--protected-tables", "products, orders"]);
        assert_eq!(args.storage().protected_tables, vec!["products", "orders"]);
    }

    #[test]
    fn tls_needs_both_paths() {
        let result = ServerArgs::try_parse_from([
            "tenant-rls-server",
            "--tls-cert",
            "/tmp/cert.pem",
        ]);
        assert!(result.is_err());

        let args = parse(&["--tls-cert", "/tmp/cert.pem", "--tls-key", "/tmp/key.pem"]);
        assert!(args.network().tls.is_some());
    }

    #[test]
    fn storage_backend_parses() {
        let args = parse(&["--storage", "postgres", "--max-connections", "4"]);
        let storage = args.storage();
        assert_eq!(storage.backend, StorageBackend::Postgres);
        assert_eq!(storage.max_connections, 4);
    }
}
