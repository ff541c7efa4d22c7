//! Authenticated principal as handed over by the upstream authentication layer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A verified caller identity together with its token claims.
///
/// Signature and expiry verification happen before a `Principal` is built;
/// this type only carries the result. `authenticated` is `false` for
/// anonymous placeholders some upstreams install on public routes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Principal {
    /// Unique identifier for the authenticated entity (usually the `sub` claim).
    pub id: String,
    /// Roles assigned to this principal.
    pub roles: Vec<String>,
    /// Whether upstream verified this principal.
    pub authenticated: bool,
    /// Raw claims from the verified token.
    #[serde(default)]
    pub claims: Map<String, Value>,
}

impl Principal {
    /// Builds an authenticated principal from a claim map.
    #[must_use]
    pub fn authenticated(id: impl Into<String>, claims: Map<String, Value>) -> Self {
        let roles = claims
            .get("roles")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            id: id.into(),
            roles,
            authenticated: true,
            claims,
        }
    }

    /// Anonymous placeholder principal.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            id: "anonymous".to_string(),
            ..Self::default()
        }
    }

    /// Returns a claim as a string, or `None` if absent or not a string.
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }

    #[must_use]
    pub fn with_claim(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.claims.insert(name.into(), value.into());
        self
    }
}
