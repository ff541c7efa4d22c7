//! Tenant identity extraction from verified principals.

use crate::principal::Principal;
use crate::tenant::TenantId;

/// Claim consulted when no other name is configured.
pub const DEFAULT_TENANT_CLAIM: &str = "tenant_id";

/// Outcome of inspecting a request's principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// An authenticated principal carrying a usable tenant claim.
    Tenant(TenantId),
    /// An authenticated principal without a usable tenant claim.
    MissingClaim,
    /// No principal, or a principal upstream did not authenticate.
    Anonymous,
}

/// Reads the tenant identifier out of one named claim.
///
/// Pure and side-effect free; trust decisions belong to the authentication
/// layer that produced the [`Principal`].
#[derive(Debug, Clone)]
pub struct TenantExtractor {
    claim: String,
}

impl TenantExtractor {
    #[must_use]
    pub fn new(claim: impl Into<String>) -> Self {
        Self {
            claim: claim.into(),
        }
    }

    #[must_use]
    pub fn claim(&self) -> &str {
        &self.claim
    }

    /// Returns the tenant id, or `None` if the principal is absent,
    /// unauthenticated, or its claim is missing, non-string or blank.
    #[must_use]
    pub fn extract(&self, principal: Option<&Principal>) -> Option<TenantId> {
        match self.classify(principal) {
            Extraction::Tenant(tenant) => Some(tenant),
            Extraction::MissingClaim | Extraction::Anonymous => None,
        }
    }

    /// Like [`extract`](Self::extract) but distinguishes an authenticated
    /// caller without a claim from an anonymous one.
    #[must_use]
    pub fn classify(&self, principal: Option<&Principal>) -> Extraction {
        let Some(principal) = principal.filter(|p| p.authenticated) else {
            return Extraction::Anonymous;
        };
        match principal.claim(&self.claim).map(TenantId::new) {
            Some(Ok(tenant)) => Extraction::Tenant(tenant),
            Some(Err(err)) => {
                tracing::debug!(claim = %self.claim, error = %err, "tenant claim unusable");
                Extraction::MissingClaim
            }
            None => Extraction::MissingClaim,
        }
    }
}

impl Default for TenantExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_TENANT_CLAIM)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::Map;

    use super::*;

    fn principal_with(claim: &str, value: &str) -> Principal {
        Principal::authenticated("user", Map::new()).with_claim(claim, value)
    }

    #[test]
    fn extracts_default_claim() {
        let extractor = TenantExtractor::default();
        let principal = principal_with("tenant_id", "acme");
        assert_eq!(
            extractor.extract(Some(&principal)),
            Some(TenantId::new("acme").unwrap())
        );
    }

    #[test]
    fn absent_principal_is_anonymous() {
        let extractor = TenantExtractor::default();
        assert_eq!(extractor.classify(None), Extraction::Anonymous);
        assert_eq!(extractor.extract(None), None);
    }

    #[test]
    fn unauthenticated_principal_is_anonymous_even_with_claim() {
        let extractor = TenantExtractor::default();
        let principal = Principal::anonymous().with_claim("tenant_id", "acme");
        assert_eq!(extractor.classify(Some(&principal)), Extraction::Anonymous);
    }

    #[test]
    fn missing_claim_is_reported() {
        let extractor = TenantExtractor::default();
        let principal = Principal::authenticated("user", Map::new());
        assert_eq!(
            extractor.classify(Some(&principal)),
            Extraction::MissingClaim
        );
    }

    #[test]
    fn blank_claim_counts_as_missing() {
        let extractor = TenantExtractor::default();
        let principal = principal_with("tenant_id", "  ");
        assert_eq!(
            extractor.classify(Some(&principal)),
            Extraction::MissingClaim
        );
    }

    #[test]
    fn custom_claim_name() {
        let extractor = TenantExtractor::new("org");
        let principal = principal_with("org", "globex").with_claim("tenant_id", "acme");
        assert_eq!(extractor.claim(), "org");
        assert_eq!(
            extractor.extract(Some(&principal)).map(TenantId::into_inner),
            Some("globex".to_string())
        );
    }

    proptest! {
        #[test]
        fn extract_returns_exactly_the_claim(value in "[a-z0-9_]{1,32}") {
            let extractor = TenantExtractor::default();
            let principal = principal_with("tenant_id", &value);
            let extracted = extractor.extract(Some(&principal)).map(TenantId::into_inner);
            prop_assert_eq!(extracted, Some(value));
        }
    }
}
