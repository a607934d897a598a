//! Tokens of recently dispatched non-idempotent requests.

use std::fmt;

use moka::sync::Cache;

use crate::config::DedupConfig;

/// Bounded memory of dispatched request tokens.
///
/// Entries expire after [`DedupConfig::max_age`] and the least recently
/// used are evicted once [`DedupConfig::max_entries`] is reached, so a
/// flood of distinct tokens cannot grow the cache without limit. Each entry
/// records the identity that serviced the token.
#[derive(Clone)]
pub struct DispatchedCache {
    identity: String,
    cache: Cache<String, String>,
}

impl fmt::Debug for DispatchedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchedCache")
            .field("identity", &self.identity)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl DispatchedCache {
    /// Create a cache for tokens serviced by `identity`.
    pub fn new(identity: impl Into<String>, config: &DedupConfig) -> Self {
        Self {
            identity: identity.into(),
            cache: Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(config.max_age)
                .build(),
        }
    }

    /// Remember a dispatched token.
    pub fn store(&self, token: &str) {
        self.cache.insert(token.to_string(), self.identity.clone());
    }

    /// Identity that serviced `token`, if it was dispatched recently.
    pub fn serviced_by(&self, token: &str) -> Option<String> {
        self.cache.get(token)
    }

    /// Number of remembered tokens, after pending evictions are applied.
    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    /// Whether no tokens are remembered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_store_and_lookup() {
        let cache = DispatchedCache::new("rs-agent-1-1", &DedupConfig::default());
        assert!(cache.is_empty());
        cache.store("token1");
        assert_eq!(cache.serviced_by("token1").as_deref(), Some("rs-agent-1-1"));
        assert_eq!(cache.serviced_by("token2"), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_entries_expire() {
        let config = DedupConfig {
            max_age: Duration::from_millis(50),
            max_entries: 10,
        };
        let cache = DispatchedCache::new("rs-agent-1-1", &config);
        cache.store("token1");
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(cache.serviced_by("token1"), None);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let config = DedupConfig {
            max_age: Duration::from_secs(60),
            max_entries: 10,
        };
        let cache = DispatchedCache::new("rs-agent-1-1", &config);
        for i in 0..100 {
            cache.store(&format!("token{i}"));
        }
        assert!(cache.len() <= 10);
    }
}
