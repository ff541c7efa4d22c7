//! Storage backends behind the [`SessionPool`](crate::tenancy::SessionPool)
//! contract, plus the row-level security policy they enforce.
//!
//! - [`memory`]: in-process tables with the same slot and policy rules as
//!   Postgres. Used by tests and the `memory` storage backend.
//! - [`postgres`]: `sqlx` pool where every leased session is an open
//!   transaction (feature `postgres`).

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod rls;

pub use memory::{MemoryDatabase, MemoryPool, MemoryRow, MemorySession};
#[cfg(feature = "postgres")]
pub use postgres::{PgSession, PgSessionPool};
pub use rls::{validate_parameter, PolicyError, RowPolicy};
