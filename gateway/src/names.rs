//! Display-name ownership checks against an external name registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use hlchat_common::Address;
use serde::Deserialize;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("registry returned HTTP {0}")]
    Status(u16),
    #[error("registry lookup timed out")]
    Timeout,
}

/// Answers whether a wallet owns a name.
#[async_trait]
pub trait NameRegistry: Send + Sync {
    async fn owns(&self, address: &Address, name: &str) -> Result<bool, RegistryError>;
}

/// Registry reached over HTTP at `{base}/resolve/primary_name/{address}`.
pub struct HttpNameRegistry {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrimaryNameResponse {
    primary_name: Option<String>,
}

impl HttpNameRegistry {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl NameRegistry for HttpNameRegistry {
    async fn owns(&self, address: &Address, name: &str) -> Result<bool, RegistryError> {
        let url = format!("{}/resolve/primary_name/{}", self.base_url, address);
        let resp = self.http.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !resp.status().is_success() {
            return Err(RegistryError::Status(resp.status().as_u16()));
        }
        let body: PrimaryNameResponse = resp.json().await?;
        Ok(body
            .primary_name
            .is_some_and(|primary| primary.eq_ignore_ascii_case(name)))
    }
}

/// Fixed address → names table. Empty by default, which rejects every name.
#[derive(Default)]
pub struct StaticNameRegistry {
    names: HashMap<Address, Vec<String>>,
}

impl StaticNameRegistry {
    pub fn with_name(mut self, address: Address, name: &str) -> Self {
        self.names
            .entry(address)
            .or_default()
            .push(name.to_lowercase());
        self
    }
}

#[async_trait]
impl NameRegistry for StaticNameRegistry {
    async fn owns(&self, address: &Address, name: &str) -> Result<bool, RegistryError> {
        let name = name.to_lowercase();
        Ok(self
            .names
            .get(address)
            .is_some_and(|owned| owned.contains(&name)))
    }
}

/// TTL cache in front of a [`NameRegistry`].
///
/// Only positive answers are cached: a miss or a registry failure is asked
/// again next time, so an outage never locks out a legitimately owned name.
pub struct NameOwnershipCache {
    registry: Arc<dyn NameRegistry>,
    verified: DashMap<(Address, String), Instant>,
    ttl: Duration,
    timeout: Duration,
}

impl NameOwnershipCache {
    pub fn new(registry: Arc<dyn NameRegistry>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            verified: DashMap::new(),
            ttl,
            timeout,
        }
    }

    pub async fn owns_name(&self, address: &Address, name: &str) -> Result<bool, RegistryError> {
        let key = (*address, name.to_lowercase());
        let cached = self
            .verified
            .get(&key)
            .is_some_and(|verified_at| verified_at.elapsed() < self.ttl);
        if cached {
            return Ok(true);
        }

        let owned = tokio::time::timeout(self.timeout, self.registry.owns(address, name))
            .await
            .map_err(|_| RegistryError::Timeout)??;
        if owned {
            self.verified.insert(key, Instant::now());
        }
        Ok(owned)
    }

    pub fn sweep(&self) -> usize {
        let before = self.verified.len();
        self.verified
            .retain(|_, verified_at| verified_at.elapsed() < self.ttl);
        before.saturating_sub(self.verified.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Counts lookups; answers from a switchable flag.
    struct CountingRegistry {
        calls: AtomicUsize,
        owned: AtomicBool,
        fail: AtomicBool,
    }

    impl CountingRegistry {
        fn new(owned: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                owned: AtomicBool::new(owned),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl NameRegistry for CountingRegistry {
        async fn owns(&self, _address: &Address, _name: &str) -> Result<bool, RegistryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(RegistryError::Status(503));
            }
            Ok(self.owned.load(Ordering::SeqCst))
        }
    }

    struct HangingRegistry;

    #[async_trait]
    impl NameRegistry for HangingRegistry {
        async fn owns(&self, _address: &Address, _name: &str) -> Result<bool, RegistryError> {
            std::future::pending().await
        }
    }

    fn cache(registry: Arc<dyn NameRegistry>) -> NameOwnershipCache {
        NameOwnershipCache::new(registry, Duration::from_secs(600), Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn positive_answers_are_cached_case_insensitively() {
        let registry = CountingRegistry::new(true);
        let cache = cache(registry.clone());
        let a = Address([1; 20]);

        assert!(cache.owns_name(&a, "Alice.hl").await.unwrap());
        assert!(cache.owns_name(&a, "alice.HL").await.unwrap());
        assert_eq!(registry.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(cache.owns_name(&a, "alice.hl").await.unwrap());
        assert_eq!(registry.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn misses_and_failures_are_not_cached() {
        let registry = CountingRegistry::new(false);
        let cache = cache(registry.clone());
        let a = Address([2; 20]);

        assert!(!cache.owns_name(&a, "bob").await.unwrap());
        registry.fail.store(true, Ordering::SeqCst);
        assert!(cache.owns_name(&a, "bob").await.is_err());

        // Registry recovers and now says yes; nothing stale stands in the way.
        registry.fail.store(false, Ordering::SeqCst);
        registry.owned.store(true, Ordering::SeqCst);
        assert!(cache.owns_name(&a, "bob").await.unwrap());
        assert_eq!(registry.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_registry_times_out() {
        let cache = cache(Arc::new(HangingRegistry));
        let result = cache.owns_name(&Address([3; 20]), "carol").await;
        assert!(matches!(result, Err(RegistryError::Timeout)));
    }

    #[tokio::test]
    async fn static_registry_lookup() {
        let a = Address([4; 20]);
        let registry = StaticNameRegistry::default().with_name(a, "Dave.hl");
        assert!(registry.owns(&a, "dave.hl").await.unwrap());
        assert!(!registry.owns(&a, "eve.hl").await.unwrap());
        assert!(!registry.owns(&Address([5; 20]), "dave.hl").await.unwrap());
    }
}
