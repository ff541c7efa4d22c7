//! Tenant identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a string cannot be used as a tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidTenantId {
    #[error("tenant id must not be empty or blank")]
    Blank,
    #[error("tenant id must not contain control characters")]
    ControlCharacter,
}

/// Opaque, externally issued tenant identifier.
///
/// Construction rejects empty and whitespace-only strings, so a bound
/// `TenantId` is never blank. No other structure is assumed: the value is
/// compared byte-for-byte against the `tenant_id` column by the storage
/// engine's row policies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Validates and wraps a tenant identifier.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTenantId::Blank`] for empty or whitespace-only input
    /// and [`InvalidTenantId::ControlCharacter`] if the value contains a
    /// control character (which Postgres rejects in `set_config` values).
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidTenantId> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(InvalidTenantId::Blank);
        }
        if value.chars().any(char::is_control) {
            return Err(InvalidTenantId::ControlCharacter);
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for TenantId {
    type Err = InvalidTenantId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = InvalidTenantId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}
