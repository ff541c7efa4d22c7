//! Row-level security policy contract.
//!
//! Every protected table compares its `tenant_id` column with the session
//! slot. An unset or empty slot yields `NULL` through `NULLIF`, and
//! `tenant_id = NULL` is never true, so the policy fails closed.

/// Errors from policy construction or enforcement.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("session parameter must look like `prefix.name`: {0:?}")]
    InvalidParameter(String),
    #[error("new row violates row-level security policy for table {table}")]
    Violation { table: String },
}

/// Name of the policy created on each table.
pub const POLICY_NAME: &str = "tenant_isolation";

/// Row visibility predicate keyed on one session parameter.
#[derive(Debug, Clone)]
pub struct RowPolicy {
    parameter: String,
}

impl RowPolicy {
    #[must_use]
    pub fn new(parameter: impl Into<String>) -> Self {
        Self {
            parameter: parameter.into(),
        }
    }

    #[must_use]
    pub fn parameter(&self) -> &str {
        &self.parameter
    }

    /// Whether a row owned by `row_tenant` is visible under `slot`.
    #[must_use]
    pub fn admits(&self, row_tenant: &str, slot: Option<&str>) -> bool {
        match slot {
            Some(bound) if !bound.is_empty() => bound == row_tenant,
            _ => false,
        }
    }

    /// DDL that installs the policy on `table`.
    ///
    /// `FORCE` makes the policy apply to the table owner too, which is the
    /// role application pools usually connect as.
    ///
    /// # Errors
    ///
    /// Rejects identifiers and parameters that cannot be safely interpolated.
    pub fn statements(&self, table: &str) -> Result<Vec<String>, PolicyError> {
        validate_table(table)?;
        validate_parameter(&self.parameter)?;
        let predicate = format!(
            "tenant_id = NULLIF(current_setting('{}', true), '')",
            self.parameter
        );
        Ok(vec![
            format!("ALTER TABLE {table} ENABLE ROW LEVEL SECURITY"),
            format!("ALTER TABLE {table} FORCE ROW LEVEL SECURITY"),
            format!("DROP POLICY IF EXISTS {POLICY_NAME} ON {table}"),
            format!(
                "CREATE POLICY {POLICY_NAME} ON {table} USING ({predicate}) WITH CHECK ({predicate})"
            ),
        ])
    }
}

/// Checks a custom session parameter name (`prefix.name`).
///
/// # Errors
///
/// Returns [`PolicyError::InvalidParameter`] unless the name has exactly two
/// non-empty identifier parts.
pub fn validate_parameter(parameter: &str) -> Result<(), PolicyError> {
    let parts: Vec<&str> = parameter.split('.').collect();
    if parts.len() == 2 && parts.iter().all(|part| is_identifier(part)) {
        Ok(())
    } else {
        Err(PolicyError::InvalidParameter(parameter.to_string()))
    }
}

fn validate_table(table: &str) -> Result<(), PolicyError> {
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|part| is_identifier(part)) {
        Ok(())
    } else {
        Err(PolicyError::InvalidIdentifier(table.to_string()))
    }
}

fn is_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
