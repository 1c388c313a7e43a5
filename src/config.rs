//! Balancer configuration.
//!
//! Plain data: the server list and cluster-wide tunables. Collaborators
//! that carry behaviour (the driver factory, load monitor, caches, and the
//! chronology callback) are constructor inputs on the balancer itself and
//! never appear here.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::DatabaseDomain;
use crate::error::BalancerError;

/// The catch-all query group every group list implicitly ends in.
pub const GENERIC_GROUP: &str = "";

/// One server in the cluster. Index 0 in the config list is the writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Display name. Server names are the identity across reconfigurations.
    pub name: String,

    /// Driver type tag (informational, passed through to the factory)
    #[serde(default)]
    pub server_type: String,

    /// Nominal load weight for the generic query group
    #[serde(default)]
    pub load: u32,

    /// Per-group load weights; groups absent here get no traffic from that
    /// group on this server
    #[serde(default)]
    pub group_loads: HashMap<String, u32>,

    /// Per-server replication lag budget in seconds. `None` falls back to
    /// the cluster default; `f64::INFINITY` disables lag exclusion.
    #[serde(default)]
    pub max_lag: Option<f64>,

    /// Statically replicated archive host: content is fixed, so the
    /// replication stream (and lag) does not apply
    #[serde(default)]
    pub is_static: bool,
}

impl ServerDescriptor {
    pub fn new(name: &str, load: u32) -> Self {
        Self {
            name: name.to_string(),
            server_type: String::new(),
            load,
            group_loads: HashMap::new(),
            max_lag: None,
            is_static: false,
        }
    }

    pub fn with_group_load(mut self, group: &str, load: u32) -> Self {
        self.group_loads.insert(group.to_string(), load);
        self
    }

    pub fn with_max_lag(mut self, max_lag: f64) -> Self {
        self.max_lag = Some(max_lag);
        self
    }

    pub fn as_static(mut self) -> Self {
        self.is_static = true;
        self
    }
}

/// Cluster configuration for a [`Balancer`](crate::balancer::Balancer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Ordered server list; index 0 is the writer
    pub servers: Vec<ServerDescriptor>,

    /// The local database domain new handles default to
    pub local_domain: DatabaseDomain,

    /// Default per-server replication lag budget in seconds
    pub max_lag: f64,

    /// Default timeout for replication position waits
    pub wait_timeout: Duration,

    /// Non-empty value forces the cluster read-only with this reason
    pub read_only_reason: Option<String>,

    /// Query group to try before the generic group when callers don't name
    /// one; unknown groups silently fall back to generic
    pub default_group: Option<String>,

    /// Domain alias table: alias string to canonical domain id
    pub domain_aliases: HashMap<String, String>,

    /// Table name aliases applied to every new handle
    pub table_aliases: HashMap<String, String>,

    /// Index name aliases applied to every new handle
    pub index_aliases: HashMap<String, String>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            local_domain: DatabaseDomain::default(),
            max_lag: 6.0,
            wait_timeout: Duration::from_secs(10),
            read_only_reason: None,
            default_group: None,
            domain_aliases: HashMap::new(),
            table_aliases: HashMap::new(),
            index_aliases: HashMap::new(),
        }
    }
}

impl BalancerConfig {
    pub fn new(servers: Vec<ServerDescriptor>, local_domain: DatabaseDomain) -> Self {
        Self {
            servers,
            local_domain,
            ..Self::default()
        }
    }

    /// Validate the configuration for consistency and required fields.
    pub fn validate(&self) -> Result<(), BalancerError> {
        if self.servers.is_empty() {
            return Err(BalancerError::Config(
                "server list cannot be empty; index 0 must be the writer".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for server in &self.servers {
            if server.name.is_empty() {
                return Err(BalancerError::Config(
                    "every server needs a display name; names are the server identity".to_string(),
                ));
            }
            if !names.insert(server.name.as_str()) {
                return Err(BalancerError::Config(format!(
                    "duplicate server name '{}'; names are the server identity",
                    server.name
                )));
            }
            if let Some(max_lag) = server.max_lag {
                if max_lag.is_nan() || max_lag < 0.0 {
                    return Err(BalancerError::Config(format!(
                        "server '{}' has an invalid max_lag of {}",
                        server.name, max_lag
                    )));
                }
            }
        }

        if self.max_lag.is_nan() || self.max_lag <= 0.0 {
            return Err(BalancerError::Config(format!(
                "max_lag must be a positive number of seconds, got {}",
                self.max_lag
            )));
        }

        Ok(())
    }

    pub fn writer(&self) -> &ServerDescriptor {
        &self.servers[0]
    }

    pub fn has_replica_servers(&self) -> bool {
        self.servers.len() > 1
    }

    /// Whether any non-writer server actually streams the replication feed
    /// (statically replicated archive hosts don't).
    pub fn has_streaming_replica_servers(&self) -> bool {
        self.servers.iter().skip(1).any(|s| !s.is_static)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_empty_servers() {
        let config = BalancerConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let config = BalancerConfig::new(
            vec![
                ServerDescriptor::new("db1", 0),
                ServerDescriptor::new("db1", 10),
            ],
            DatabaseDomain::default(),
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate server name"));
    }

    #[test]
    fn test_validate_accepts_single_writer() {
        let config = BalancerConfig::new(
            vec![ServerDescriptor::new("db1", 1)],
            DatabaseDomain::from_id("appdb"),
        );
        assert!(config.validate().is_ok());
        assert!(!config.has_replica_servers());
        assert!(!config.has_streaming_replica_servers());
    }

    #[test]
    fn test_streaming_replicas_exclude_static_hosts() {
        let config = BalancerConfig::new(
            vec![
                ServerDescriptor::new("db1", 0),
                ServerDescriptor::new("archive1", 5).as_static(),
            ],
            DatabaseDomain::default(),
        );
        assert!(config.has_replica_servers());
        assert!(!config.has_streaming_replica_servers());
    }
}
