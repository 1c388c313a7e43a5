//! Load monitor seam.
//!
//! External monitoring feeds two things into reader selection: rescaled
//! load weights (e.g. shedding a server that is melting down) and current
//! replication lag per server. Clusters without monitoring use
//! [`NullLoadMonitor`]; tests script lag with [`StaticLoadMonitor`].

use std::collections::HashMap;

use parking_lot::RwLock;

/// Observed replication lag of one server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplicaLag {
    /// Seconds behind the primary
    Seconds(f64),
    /// The replication stream is not running at all
    NotReplicating,
}

impl ReplicaLag {
    pub fn seconds(&self) -> Option<f64> {
        match self {
            ReplicaLag::Seconds(s) => Some(*s),
            ReplicaLag::NotReplicating => None,
        }
    }
}

/// Narrow capability the balancer needs from external monitoring.
pub trait LoadMonitor: Send + Sync {
    /// Rescale group load weights in place based on observed server
    /// health. Implementations may only lower weights, never invent load
    /// for a server that configured none.
    fn scale_loads(&self, weights: &mut HashMap<usize, u32>);

    /// Current replication lag for the given server indexes. Servers
    /// absent from the result are treated as not replicating.
    fn lag_times(&self, indexes: &[usize]) -> HashMap<usize, ReplicaLag>;
}

/// Monitor for clusters without external monitoring: weights pass through
/// untouched and every server reports zero lag.
#[derive(Debug, Default)]
pub struct NullLoadMonitor;

impl LoadMonitor for NullLoadMonitor {
    fn scale_loads(&self, _weights: &mut HashMap<usize, u32>) {}

    fn lag_times(&self, indexes: &[usize]) -> HashMap<usize, ReplicaLag> {
        indexes.iter().map(|&i| (i, ReplicaLag::Seconds(0.0))).collect()
    }
}

/// Monitor returning a fixed lag table. Servers without an entry report
/// zero lag.
#[derive(Debug, Default)]
pub struct StaticLoadMonitor {
    lags: RwLock<HashMap<usize, ReplicaLag>>,
}

impl StaticLoadMonitor {
    pub fn new(lags: HashMap<usize, ReplicaLag>) -> Self {
        Self {
            lags: RwLock::new(lags),
        }
    }

    pub fn set_lag(&self, index: usize, lag: ReplicaLag) {
        self.lags.write().insert(index, lag);
    }
}

impl LoadMonitor for StaticLoadMonitor {
    fn scale_loads(&self, _weights: &mut HashMap<usize, u32>) {}

    fn lag_times(&self, indexes: &[usize]) -> HashMap<usize, ReplicaLag> {
        let lags = self.lags.read();
        indexes
            .iter()
            .map(|&i| (i, lags.get(&i).copied().unwrap_or(ReplicaLag::Seconds(0.0))))
            .collect()
    }
}
