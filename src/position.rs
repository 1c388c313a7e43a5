//! Session replication positions.
//!
//! A session may be required to see everything the client saw on the
//! primary during an earlier request. The tracker holds that single
//! wait-for position, loads it lazily through a one-shot chronology
//! callback, and remembers which positions each replica is already known
//! to have reached so repeat waits can be skipped.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::KvCache;

/// An opaque, totally ordered coordinate in the primary's change stream.
///
/// The optional wall-clock timestamp records when the position was
/// produced; the reader selector uses it to bound how much lag is
/// tolerable while still expecting the position to be reachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryPosition {
    value: u64,
    as_of: Option<DateTime<Utc>>,
}

impl PrimaryPosition {
    pub fn new(value: u64) -> Self {
        Self { value, as_of: None }
    }

    pub fn with_timestamp(value: u64, as_of: DateTime<Utc>) -> Self {
        Self {
            value,
            as_of: Some(as_of),
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn as_of(&self) -> Option<DateTime<Utc>> {
        self.as_of
    }

    /// Whether this position is at or past `other`.
    pub fn has_reached(&self, other: &PrimaryPosition) -> bool {
        self.value >= other.value
    }
}

impl PartialOrd for PrimaryPosition {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.value.partial_cmp(&other.value)
    }
}

impl std::fmt::Display for PrimaryPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pos/{}", self.value)
    }
}

/// One-shot loader for the session's initial wait-for position.
pub type ChronologyCallback = Box<dyn FnOnce() -> Option<PrimaryPosition> + Send>;

/// Per-session wait-for-position state.
pub struct PositionTracker {
    wait_pos: Option<PrimaryPosition>,
    chronology: Option<ChronologyCallback>,
    chronology_fired: bool,
}

impl std::fmt::Debug for PositionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionTracker")
            .field("wait_pos", &self.wait_pos)
            .field("chronology_fired", &self.chronology_fired)
            .finish()
    }
}

impl PositionTracker {
    pub fn new(chronology: Option<ChronologyCallback>) -> Self {
        Self {
            wait_pos: None,
            chronology,
            chronology_fired: false,
        }
    }

    pub fn wait_pos(&self) -> Option<&PrimaryPosition> {
        self.wait_pos.as_ref()
    }

    /// Fire the chronology callback if it never ran, merging any position
    /// it yields. Subsequent calls are no-ops.
    pub fn ensure_loaded(&mut self) {
        if self.chronology_fired {
            return;
        }
        self.chronology_fired = true;
        if let Some(callback) = self.chronology.take() {
            if let Some(pos) = callback() {
                tracing::debug!(pos = %pos, "Loaded session wait-for position");
                self.merge(pos);
            }
        }
    }

    /// Raise the wait-for position to `pos` if it is higher.
    pub fn merge(&mut self, pos: PrimaryPosition) {
        match &self.wait_pos {
            Some(current) if current.has_reached(&pos) => {}
            _ => self.wait_pos = Some(pos),
        }
    }

    /// Replace the wait-for position outright, returning the previous one
    /// so the caller can restore the higher of the two afterwards.
    pub fn replace(&mut self, pos: PrimaryPosition) -> Option<PrimaryPosition> {
        self.wait_pos.replace(pos)
    }
}

const REACHED_POS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

fn reached_pos_key(server_name: &str) -> String {
    format!("replpos:{server_name}")
}

/// Last position `server_name` is known to have reached, if cached.
pub fn cached_reached_pos(cache: &dyn KvCache, server_name: &str) -> Option<PrimaryPosition> {
    let value = cache.get(&reached_pos_key(server_name))?;
    serde_json::from_value(value).ok()
}

/// Record that `server_name` has reached `pos`.
pub fn store_reached_pos(cache: &dyn KvCache, server_name: &str, pos: &PrimaryPosition) {
    if let Ok(value) = serde_json::to_value(pos) {
        cache.set(&reached_pos_key(server_name), value, REACHED_POS_TTL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;

    #[test]
    fn test_position_ordering() {
        let a = PrimaryPosition::new(5);
        let b = PrimaryPosition::new(9);
        assert!(b.has_reached(&a));
        assert!(!a.has_reached(&b));
        assert!(a.has_reached(&a));
        assert!(a < b);
    }

    #[test]
    fn test_chronology_fires_once() {
        let mut fired = 0;
        // Count through a cell so the FnOnce can be observed
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let c = counter.clone();
        let mut tracker = PositionTracker::new(Some(Box::new(move || {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Some(PrimaryPosition::new(7))
        })));

        tracker.ensure_loaded();
        tracker.ensure_loaded();
        fired += counter.load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(fired, 1);
        assert_eq!(tracker.wait_pos().unwrap().value(), 7);
    }

    #[test]
    fn test_merge_keeps_higher() {
        let mut tracker = PositionTracker::new(None);
        tracker.merge(PrimaryPosition::new(10));
        tracker.merge(PrimaryPosition::new(3));
        assert_eq!(tracker.wait_pos().unwrap().value(), 10);
        tracker.merge(PrimaryPosition::new(12));
        assert_eq!(tracker.wait_pos().unwrap().value(), 12);
    }

    #[test]
    fn test_reached_pos_cache_round_trip() {
        let cache = InMemoryCache::new();
        assert!(cached_reached_pos(&cache, "db2").is_none());

        store_reached_pos(&cache, "db2", &PrimaryPosition::new(42));
        let cached = cached_reached_pos(&cache, "db2").unwrap();
        assert_eq!(cached.value(), 42);

        // Other servers are unaffected
        assert!(cached_reached_pos(&cache, "db3").is_none());
    }
}
