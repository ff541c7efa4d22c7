//! Tenant RLS server: binds each request's tenant to its storage session so
//! row-level security policies filter every query.

pub mod auth;
pub mod config;
pub mod network;
pub mod observability;
pub mod storage;
pub mod tenancy;

pub use config::{ServerArgs, TenancyConfig};
pub use network::NetworkModule;
pub use tenancy::{
    SessionBinder, SessionConfig, SessionPool, TenancyError, TenantBindingLayer, TenantCell,
    TenantSession,
};
