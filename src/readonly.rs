//! Server-side read-only detection.
//!
//! Whether the primary is running read-only is cached through two tiers: a
//! process-local tier with a short TTL and a cluster-wide tier with a
//! longer one. A miss on both tiers means the caller must probe the writer
//! itself and [`store`](ReadOnlyProbe::store) the answer; a cluster hit
//! warms the local tier but a cluster miss never backfills from a possibly
//! stale local value.
//!
//! Probe failures are read as "not read-only": a flaky driver must not
//! escalate into cluster-wide read-only mode. For the same reason "not
//! read-only" is what concurrent probers should assume while a probe is in
//! flight, so two processes don't both open writer connections just to ask.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::KvCache;

const LOCAL_TTL: Duration = Duration::from_secs(5);
const CLUSTER_TTL: Duration = Duration::from_secs(30);

pub struct ReadOnlyProbe {
    local: Arc<dyn KvCache>,
    cluster: Arc<dyn KvCache>,
}

impl ReadOnlyProbe {
    pub fn new(local: Arc<dyn KvCache>, cluster: Arc<dyn KvCache>) -> Self {
        Self { local, cluster }
    }

    fn cache_key(writer_name: &str) -> String {
        format!("readonly:{writer_name}")
    }

    /// Drop the process-local entry so the next check re-reads the
    /// cluster tier or re-probes.
    pub fn invalidate_local(&self, writer_name: &str) {
        self.local.delete(&Self::cache_key(writer_name));
    }

    /// Cached read-only state, or `None` when the caller must probe.
    pub fn cached(&self, writer_name: &str) -> Option<bool> {
        let key = Self::cache_key(writer_name);

        if let Some(value) = self.local.get(&key) {
            return Some(value.as_bool().unwrap_or(false));
        }

        if let Some(value) = self.cluster.get(&key) {
            let read_only = value.as_bool().unwrap_or(false);
            self.local.set(&key, value, LOCAL_TTL);
            return Some(read_only);
        }

        None
    }

    /// Publish a probe result, or the in-flight busy placeholder, into
    /// both tiers.
    pub fn store(&self, writer_name: &str, read_only: bool) {
        tracing::debug!(writer = writer_name, read_only, "Probed primary read-only state");
        let key = Self::cache_key(writer_name);
        let value = serde_json::Value::Bool(read_only);
        self.local.set(&key, value.clone(), LOCAL_TTL);
        self.cluster.set(&key, value, CLUSTER_TTL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;

    fn probe_with_tiers() -> (ReadOnlyProbe, Arc<InMemoryCache>, Arc<InMemoryCache>) {
        let local = Arc::new(InMemoryCache::new());
        let cluster = Arc::new(InMemoryCache::new());
        (
            ReadOnlyProbe::new(local.clone(), cluster.clone()),
            local,
            cluster,
        )
    }

    #[test]
    fn test_store_populates_both_tiers() {
        let (probe, local, cluster) = probe_with_tiers();
        assert_eq!(probe.cached("db1"), None);

        probe.store("db1", true);
        assert_eq!(probe.cached("db1"), Some(true));
        assert_eq!(local.get("readonly:db1"), Some(serde_json::Value::Bool(true)));
        assert_eq!(cluster.get("readonly:db1"), Some(serde_json::Value::Bool(true)));
    }

    #[test]
    fn test_cluster_tier_serves_local_misses_and_warms_local() {
        let (probe, local, cluster) = probe_with_tiers();

        // Another process already published the cluster-wide answer
        cluster.set(
            "readonly:db1",
            serde_json::Value::Bool(true),
            Duration::from_secs(30),
        );

        assert_eq!(probe.cached("db1"), Some(true));
        assert_eq!(local.get("readonly:db1"), Some(serde_json::Value::Bool(true)));
    }

    #[test]
    fn test_invalidate_local_keeps_cluster_tier() {
        let (probe, local, _cluster) = probe_with_tiers();

        probe.store("db1", false);
        probe.invalidate_local("db1");
        assert!(local.get("readonly:db1").is_none());

        // The cluster tier still answers, so no probe is needed
        assert_eq!(probe.cached("db1"), Some(false));
    }

    #[test]
    fn test_miss_on_both_tiers_requires_probe() {
        let (probe, _, _) = probe_with_tiers();
        assert_eq!(probe.cached("db1"), None);
        // Distinct writers are cached independently
        probe.store("db1", true);
        assert_eq!(probe.cached("db2"), None);
    }
}
