//! C1: process-wide tenant -> credentials mapping.

use crate::job::TenantTokens;
use std::collections::HashMap;
use std::sync::RwLock;

/// Read-mostly map of tenant to credentials. No persistence: repopulated at
/// startup by the embedding application, mutated rarely thereafter.
#[derive(Default)]
pub struct TokenStore {
    inner: RwLock<HashMap<String, TenantTokens>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, tenant: impl Into<String>, tokens: TenantTokens) {
        let mut guard = self.inner.write().expect("token store lock poisoned");
        guard.insert(tenant.into(), tokens);
    }

    /// Returns a clone of the tenant's tokens and whether they existed, so
    /// callers can distinguish "no credentials configured" from an empty
    /// token value.
    pub fn get(&self, tenant: &str) -> (Option<TenantTokens>, bool) {
        let guard = self.inner.read().expect("token store lock poisoned");
        match guard.get(tenant) {
            Some(tokens) => (Some(tokens.clone()), true),
            None => (None, false),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("token store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let store = TokenStore::new();
        store.set(
            "acme",
            TenantTokens {
                api_token: "api-1".into(),
                datafeed_token: "df-1".into(),
            },
        );

        let (tokens, exists) = store.get("acme");
        assert!(exists);
        assert_eq!(tokens.unwrap().api_token, "api-1");
    }

    #[test]
    fn missing_tenant_reports_not_exists() {
        let store = TokenStore::new();
        let (tokens, exists) = store.get("missing");
        assert!(!exists);
        assert!(tokens.is_none());
    }

    #[test]
    fn overwrite_replaces_previous_tokens() {
        let store = TokenStore::new();
        store.set(
            "acme",
            TenantTokens {
                api_token: "old".into(),
                datafeed_token: "old".into(),
            },
        );
        store.set(
            "acme",
            TenantTokens {
                api_token: "new".into(),
                datafeed_token: "new".into(),
            },
        );
        let (tokens, _) = store.get("acme");
        assert_eq!(tokens.unwrap().api_token, "new");
    }
}
