//! Cache seams.
//!
//! The balancer uses two caches: a process-local one (read-only state,
//! known-reached replication positions) and a cluster-wide one shared by
//! every process fronting the same cluster. Both sit behind the same
//! narrow get/set contract; [`InMemoryCache`] is the process-local
//! implementation and the test stand-in for the cluster tier.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Key-value cache with per-entry TTLs. Values are plain JSON, the shape
/// a shared cache actually stores.
pub trait KvCache: Send + Sync {
    /// Get a live (non-expired) value.
    fn get(&self, key: &str) -> Option<serde_json::Value>;

    /// Store a value for `ttl`.
    fn set(&self, key: &str, value: serde_json::Value, ttl: Duration);

    /// Drop a key, forcing the next read to miss.
    fn delete(&self, key: &str);
}

/// In-memory [`KvCache`] with lazy expiry.
#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, (serde_json::Value, Instant)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvCache for InMemoryCache {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read();
        let (value, deadline) = entries.get(key)?;
        if Instant::now() >= *deadline {
            return None;
        }
        Some(value.clone())
    }

    fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let deadline = Instant::now() + ttl;
        self.entries.write().insert(key.to_string(), (value, deadline));
    }

    fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_delete() {
        let cache = InMemoryCache::new();
        assert!(cache.get("k").is_none());

        cache.set("k", json!({"v": 1}), Duration::from_secs(60));
        assert_eq!(cache.get("k").unwrap()["v"], 1);

        cache.delete("k");
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_expired_entries_miss() {
        let cache = InMemoryCache::new();
        cache.set("k", json!(true), Duration::from_secs(0));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_overwrite_extends_ttl() {
        let cache = InMemoryCache::new();
        cache.set("k", json!(1), Duration::from_secs(0));
        cache.set("k", json!(2), Duration::from_secs(60));
        assert_eq!(cache.get("k").unwrap(), json!(2));
    }
}
