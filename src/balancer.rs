//! The balancer facade.
//!
//! One [`Balancer`] serves one logical request or script: it owns every
//! driver connection it opens, hands application code lightweight
//! [`ConnectionRef`]s that re-resolve here, picks replicas under lag and
//! load, and runs the cluster-wide transaction round over all writer
//! handles.
//!
//! The core is single-threaded and cooperative; concurrency across
//! requests comes from running independent instances.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;

use crate::cache::{InMemoryCache, KvCache};
use crate::config::{BalancerConfig, ServerDescriptor, GENERIC_GROUP};
use crate::domain::{DatabaseDomain, DomainResolver, DomainSpec};
use crate::driver::{DriverFactory, LbInfo, TopologyRole};
use crate::error::{BalancerError, Result};
use crate::monitor::{LoadMonitor, NullLoadMonitor, ReplicaLag};
use crate::pool::{ConnectionPool, Handle, HandleRef, PoolClass};
use crate::position::{
    cached_reached_pos, store_reached_pos, ChronologyCallback, PositionTracker, PrimaryPosition,
};
use crate::readonly::ReadOnlyProbe;
use crate::round::{RoundCoordinator, RoundStage};

/// Which server a connection request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetServer {
    /// The writer, index 0
    Primary,
    /// Any suitable replica picked by the reader selector
    Replica,
    /// A specific server index
    Index(usize),
}

/// Connection request flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnFlags {
    /// Use the out-of-band autocommit pool instead of the round pool
    pub autocommit: bool,
    /// Log connection failures quietly; the caller expects them
    pub silence_errors: bool,
    /// The caller intends to write; only valid against the primary
    pub intent_writable: bool,
    /// Force a fresh read-only probe on the primary
    pub refresh_read_only: bool,
}

/// Lightweight reference application code holds instead of a handle.
///
/// The reference remembers how it was acquired plus the balancer's
/// modification counter at mint time; [`Balancer::resolve`] re-acquires
/// through the normal path once the counter goes stale.
#[derive(Debug)]
pub struct ConnectionRef {
    handle: HandleRef,
    target: TargetServer,
    groups: Vec<String>,
    domain: DatabaseDomain,
    flags: ConnFlags,
    mod_count: u64,
}

impl ConnectionRef {
    pub fn handle(&self) -> &HandleRef {
        &self.handle
    }

    pub fn server_index(&self) -> usize {
        self.handle.server_index()
    }

    pub fn domain(&self) -> &DatabaseDomain {
        &self.domain
    }

    pub fn mod_count(&self) -> u64 {
        self.mod_count
    }
}

/// Load balancer and transaction round coordinator for one cluster.
pub struct Balancer<F: DriverFactory> {
    config: BalancerConfig,
    factory: F,
    monitor: Arc<dyn LoadMonitor>,
    resolver: DomainResolver,
    pool: ConnectionPool,
    round: RoundCoordinator,
    positions: PositionTracker,
    readonly: ReadOnlyProbe,
    local_cache: Arc<dyn KvCache>,
    /// group → server index → weight
    group_loads: HashMap<String, HashMap<usize, u32>>,
    /// Sticky reader choice per group for this session
    reader_index: HashMap<String, usize>,
    lagged_replica_mode: bool,
    temp_tables_only: HashSet<String>,
    mod_count: u64,
    disabled: Option<String>,
}

impl<F: DriverFactory> Balancer<F> {
    pub fn new(config: BalancerConfig, factory: F) -> Result<Self> {
        config.validate()?;

        let local_cache: Arc<dyn KvCache> = Arc::new(InMemoryCache::new());
        let cluster_cache: Arc<dyn KvCache> = Arc::new(InMemoryCache::new());
        let resolver = DomainResolver::new(
            config.local_domain.clone(),
            config.domain_aliases.clone(),
        );
        let group_loads = Self::build_group_loads(&config.servers);

        Ok(Self {
            factory,
            monitor: Arc::new(NullLoadMonitor),
            resolver,
            pool: ConnectionPool::new(),
            round: RoundCoordinator::new(),
            positions: PositionTracker::new(None),
            readonly: ReadOnlyProbe::new(local_cache.clone(), cluster_cache),
            local_cache,
            group_loads,
            reader_index: HashMap::new(),
            lagged_replica_mode: false,
            temp_tables_only: HashSet::new(),
            mod_count: 0,
            disabled: None,
            config,
        })
    }

    pub fn with_load_monitor(mut self, monitor: Arc<dyn LoadMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_caches(mut self, local: Arc<dyn KvCache>, cluster: Arc<dyn KvCache>) -> Self {
        self.readonly = ReadOnlyProbe::new(local.clone(), cluster);
        self.local_cache = local;
        self
    }

    pub fn with_chronology_callback(mut self, callback: ChronologyCallback) -> Self {
        self.positions = PositionTracker::new(Some(callback));
        self
    }

    /// Resume a round that was persisted mid-callback-stage.
    pub fn resume_round_stage(mut self, stage: RoundStage) -> Result<Self> {
        self.round = RoundCoordinator::resume(stage)?;
        Ok(self)
    }

    fn build_group_loads(
        servers: &[ServerDescriptor],
    ) -> HashMap<String, HashMap<usize, u32>> {
        let mut tables: HashMap<String, HashMap<usize, u32>> = HashMap::new();
        for (index, server) in servers.iter().enumerate() {
            tables
                .entry(GENERIC_GROUP.to_string())
                .or_default()
                .insert(index, server.load);
            for (group, weight) in &server.group_loads {
                tables.entry(group.clone()).or_default().insert(index, *weight);
            }
        }
        tables
    }

    // ------------------------------------------------------------------
    // Connection surface
    // ------------------------------------------------------------------

    /// Acquire a connection reference for `target` in `domain`.
    ///
    /// `groups` orders the query groups to try; it implicitly ends in the
    /// generic group and only applies to [`TargetServer::Replica`].
    #[tracing::instrument(skip(self, domain))]
    pub async fn get_connection(
        &mut self,
        target: TargetServer,
        groups: &[&str],
        domain: DomainSpec,
        flags: ConnFlags,
    ) -> Result<ConnectionRef> {
        if let Some(reason) = &self.disabled {
            return Err(BalancerError::AccessDenied(reason.clone()));
        }

        let domain = self.resolver.resolve(domain);
        let flags = self.sanitize_flags(flags, &domain);

        let index = match target {
            TargetServer::Primary => 0,
            TargetServer::Index(index) => {
                if index >= self.config.servers.len() {
                    return Err(BalancerError::Config(format!(
                        "server index {index} is out of range (cluster has {} servers)",
                        self.config.servers.len()
                    )));
                }
                // The default group is harmless alongside an explicit
                // index; anything more specific is a programmer error
                let default_group =
                    self.config.default_group.as_deref().unwrap_or(GENERIC_GROUP);
                if groups.iter().any(|group| *group != default_group) {
                    return Err(BalancerError::Config(
                        "an explicit server index cannot be combined with a non-default query group"
                            .to_string(),
                    ));
                }
                index
            }
            TargetServer::Replica => self.get_reader_index(groups).await?,
        };

        if flags.intent_writable && index != 0 {
            return Err(BalancerError::Config(format!(
                "writable connection requested against non-primary server index {index}"
            )));
        }

        let class = if flags.autocommit {
            PoolClass::Autocommit
        } else {
            PoolClass::Round
        };
        let handle = self.acquire(index, &domain, class, flags.silence_errors).await?;

        if index == 0 && flags.refresh_read_only {
            self.readonly.invalidate_local(&self.config.servers[0].name);
        }

        Ok(ConnectionRef {
            handle,
            target,
            groups: groups.iter().map(|g| g.to_string()).collect(),
            domain,
            flags,
            mod_count: self.mod_count,
        })
    }

    /// Re-resolve a reference. Cheap while the modification counter still
    /// matches; a stale reference is re-acquired through the normal path.
    pub async fn resolve(&mut self, conn: &mut ConnectionRef) -> Result<HandleRef> {
        if conn.mod_count == self.mod_count {
            return Ok(conn.handle.clone());
        }
        tracing::debug!(
            handle = %conn.handle.id(),
            "Reference went stale after reconfiguration; re-acquiring"
        );
        let groups: Vec<&str> = conn.groups.iter().map(String::as_str).collect();
        let fresh = self
            .get_connection(
                conn.target,
                &groups,
                DomainSpec::Domain(conn.domain.clone()),
                conn.flags,
            )
            .await?;
        *conn = fresh;
        Ok(conn.handle.clone())
    }

    /// `AUTOCOMMIT` cannot be honoured when the engine locks at the
    /// database level, or when the domain only holds temp tables (no
    /// snapshot staleness is possible there anyway).
    fn sanitize_flags(&self, mut flags: ConnFlags, domain: &DatabaseDomain) -> ConnFlags {
        if flags.autocommit {
            let attributes = self.factory.attributes();
            if attributes.db_level_locking || self.temp_tables_only.contains(&domain.canonical_id())
            {
                flags.autocommit = false;
            }
        }
        flags
    }

    async fn acquire(
        &mut self,
        index: usize,
        domain: &DatabaseDomain,
        class: PoolClass,
        silence_errors: bool,
    ) -> Result<HandleRef> {
        let independent = self.factory.attributes().databases_are_independent;
        let round_id = self.round.round_id().map(str::to_string);

        if let Some(handle) = self
            .pool
            .find_reusable(class, index, domain, independent)
            .await
        {
            {
                let mut driver = handle.driver().await;
                if driver.domain() != *domain {
                    driver
                        .switch_domain(domain)
                        .await
                        .map_err(|e| BalancerError::Driver {
                            server: handle.server_name().to_string(),
                            source: e,
                        })?;
                    let now = driver.domain();
                    if now != *domain {
                        return Err(BalancerError::DomainMismatch {
                            expected: domain.canonical_id(),
                            found: now.canonical_id(),
                        });
                    }
                }
            }
            if index == 0 && class == PoolClass::Round {
                if let Some(round_id) = &round_id {
                    handle.apply_round_flags(round_id).await;
                }
            }
            return Ok(handle);
        }

        let server = self.config.servers[index].clone();
        match self.factory.open(index, &server, domain).await {
            Ok(mut driver) => {
                let role = if index == 0 {
                    TopologyRole::Writer
                } else if server.is_static {
                    TopologyRole::StaticClone
                } else {
                    TopologyRole::Replica
                };
                driver.set_lb_info(LbInfo {
                    server_index: index,
                    pool_class: class,
                    role,
                });
                driver.set_table_aliases(self.config.table_aliases.clone());
                driver.set_index_aliases(self.config.index_aliases.clone());

                let handle = Handle::new(index, server.name.clone(), class, driver);
                self.pool.add(handle.clone());
                tracing::debug!(
                    server = %server.name,
                    handle = %handle.id(),
                    class = ?class,
                    domain = %domain,
                    "Opened connection"
                );

                if index == 0 && class == PoolClass::Round {
                    if let Some(round_id) = &round_id {
                        handle.apply_round_flags(round_id).await;
                    }
                }
                Ok(handle)
            }
            Err(e) => {
                if silence_errors {
                    tracing::debug!(server = %server.name, error = %e, "Connection attempt failed");
                } else {
                    tracing::error!(server = %server.name, error = %e, "Connection attempt failed");
                }
                Err(BalancerError::Connection {
                    server: server.name,
                    source: e,
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Reader selection
    // ------------------------------------------------------------------

    /// Normalise a group list: the caller's groups in order, then the
    /// configured default group, then the generic group. Unknown groups
    /// are dropped.
    fn resolve_groups(&self, groups: &[&str]) -> Vec<String> {
        let mut resolved: Vec<String> = Vec::with_capacity(groups.len() + 2);
        for group in groups {
            if self.group_loads.contains_key(*group) && !resolved.iter().any(|g| g == group) {
                resolved.push(group.to_string());
            }
        }
        if let Some(default) = &self.config.default_group {
            if self.group_loads.contains_key(default) && !resolved.iter().any(|g| g == default) {
                resolved.push(default.clone());
            }
        }
        if !resolved.iter().any(|g| g == GENERIC_GROUP) {
            resolved.push(GENERIC_GROUP.to_string());
        }
        resolved
    }

    /// Pick (or recall) the replica index serving reads for `groups`.
    ///
    /// The choice is sticky per group for the whole session so any
    /// wait-for-position and transactional snapshot stay valid.
    pub async fn get_reader_index(&mut self, groups: &[&str]) -> Result<usize> {
        if self.config.servers.len() == 1 {
            return Ok(0);
        }

        // First demand for a reader loads the session position, once
        self.positions.ensure_loaded();

        let groups = self.resolve_groups(groups);
        for group in &groups {
            if let Some(&index) = self.reader_index.get(group) {
                return Ok(index);
            }
        }

        for group in &groups {
            let Some(table) = self.group_loads.get(group) else {
                continue;
            };
            let weights = table.clone();
            match self.pick_reader_index(group, weights).await {
                Ok(index) => {
                    if self.positions.wait_pos().is_some()
                        && !self
                            .await_session_primary_pos(index, self.config.wait_timeout)
                            .await
                    {
                        // Keep the index; reads are just possibly stale now
                        self.set_lagged_replica_mode(
                            "chosen replica did not reach the session position",
                        );
                    }
                    self.reader_index.insert(group.clone(), index);
                    tracing::debug!(
                        group = group.as_str(),
                        server = %self.config.servers[index].name,
                        "Reader selected for group"
                    );
                    return Ok(index);
                }
                Err(e) => {
                    tracing::debug!(
                        group = group.as_str(),
                        error = %e,
                        "No reader available in group; trying next"
                    );
                }
            }
        }

        Err(BalancerError::NoReachableReplica {
            group: groups.first().cloned().unwrap_or_default(),
        })
    }

    async fn pick_reader_index(
        &mut self,
        group: &str,
        mut weights: HashMap<usize, u32>,
    ) -> Result<usize> {
        self.monitor.scale_loads(&mut weights);
        weights.retain(|_, weight| *weight > 0);

        loop {
            if weights.is_empty() {
                return Err(BalancerError::NoReachableReplica {
                    group: group.to_string(),
                });
            }

            let index = if self.lagged_replica_mode {
                Self::weighted_pick(&weights)
            } else {
                self.pick_within_lag(&weights)
            };

            let domain = self.resolver.local().clone();
            match self.acquire(index, &domain, PoolClass::Round, true).await {
                Ok(_) => return Ok(index),
                Err(e) => {
                    tracing::debug!(
                        server = %self.config.servers[index].name,
                        error = %e,
                        "Reader candidate unreachable; removing from working set"
                    );
                    weights.remove(&index);
                }
            }
        }
    }

    /// Pick by lag preference: first servers fresh enough for the session
    /// position window, then servers within their own lag budget, and as
    /// a last resort anything at all with the session degraded to
    /// lagged-replica mode.
    fn pick_within_lag(&mut self, weights: &HashMap<usize, u32>) -> usize {
        let indexes: Vec<usize> = weights.keys().copied().collect();
        let lags = self.monitor.lag_times(&indexes);
        let lag_of = |index: usize| -> ReplicaLag {
            let server = &self.config.servers[index];
            if index == 0 || server.is_static {
                ReplicaLag::Seconds(0.0)
            } else {
                lags.get(&index).copied().unwrap_or(ReplicaLag::NotReplicating)
            }
        };

        if let Some(pos) = self.positions.wait_pos() {
            if let Some(as_of) = pos.as_of() {
                let window = (Utc::now() - as_of).num_milliseconds() as f64 / 1000.0 + 1.0;
                let fresh: HashMap<usize, u32> = weights
                    .iter()
                    .filter(|(&index, _)| {
                        matches!(lag_of(index), ReplicaLag::Seconds(lag) if lag <= window)
                    })
                    .map(|(&index, &weight)| (index, weight))
                    .collect();
                if !fresh.is_empty() {
                    return Self::weighted_pick(&fresh);
                }
            }
        }

        let within_budget: HashMap<usize, u32> = weights
            .iter()
            .filter(|(&index, _)| {
                let server = &self.config.servers[index];
                match lag_of(index) {
                    ReplicaLag::Seconds(lag) => {
                        lag <= server.max_lag.unwrap_or(self.config.max_lag)
                    }
                    // A halted replication stream only passes with an
                    // explicitly infinite lag budget
                    ReplicaLag::NotReplicating => server.max_lag == Some(f64::INFINITY),
                }
            })
            .map(|(&index, &weight)| (index, weight))
            .collect();
        if !within_budget.is_empty() {
            return Self::weighted_pick(&within_budget);
        }

        self.set_lagged_replica_mode("all candidate replicas exceed their lag budget");
        Self::weighted_pick(weights)
    }

    fn weighted_pick(weights: &HashMap<usize, u32>) -> usize {
        let mut indexes: Vec<usize> = weights.keys().copied().collect();
        indexes.sort_unstable();

        let total: u64 = indexes.iter().map(|i| weights[i] as u64).sum();
        if total == 0 {
            return indexes[0];
        }
        let mut roll = rand::thread_rng().gen_range(0..total);
        for index in &indexes {
            let weight = weights[index] as u64;
            if roll < weight {
                return *index;
            }
            roll -= weight;
        }
        *indexes.last().expect("weights are non-empty")
    }

    fn set_lagged_replica_mode(&mut self, reason: &str) {
        if !self.lagged_replica_mode {
            self.lagged_replica_mode = true;
            tracing::info!(reason, "Entering lagged-replica mode; reads may be stale");
        }
    }

    /// Whether any reader was handed out while the session could not be
    /// guaranteed fresh reads. Sticky until [`close_all`](Self::close_all).
    pub fn lagged_replica_used(&self) -> bool {
        self.lagged_replica_mode
    }

    // ------------------------------------------------------------------
    // Replication position waits
    // ------------------------------------------------------------------

    /// Require the session to see `pos`. If a generic-group reader is
    /// already chosen, wait on it immediately. On exit the wait-for
    /// position is the higher of `pos` and whatever was set before.
    pub async fn wait_for(&mut self, pos: PrimaryPosition) -> bool {
        let previous = self.positions.replace(pos);
        let mut caught_up = true;

        if let Some(&index) = self.reader_index.get(GENERIC_GROUP) {
            caught_up = self
                .await_session_primary_pos(index, self.config.wait_timeout)
                .await;
            if !caught_up {
                self.set_lagged_replica_mode("generic reader did not reach the waited position");
            }
        }

        if let Some(previous) = previous {
            self.positions.merge(previous);
        }
        caught_up
    }

    /// Wait for every streaming replica that takes load to reach `pos`
    /// (or the session's known position when `pos` is `None`), sharing
    /// one time budget across all of them.
    pub async fn wait_for_all(
        &mut self,
        pos: Option<PrimaryPosition>,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        self.positions.ensure_loaded();
        let pos = match pos {
            Some(pos) => pos,
            None => self.positions.wait_pos().cloned().ok_or_else(|| {
                BalancerError::ReplicationWait(
                    "no target position supplied and none is known for the session".to_string(),
                )
            })?,
        };

        let previous = self.positions.replace(pos);
        let timeout = timeout.unwrap_or(self.config.wait_timeout);
        let started = Instant::now();
        let mut all_caught_up = true;

        for index in self.streaming_replica_indexes_with_load() {
            let Some(remaining) = timeout.checked_sub(started.elapsed()) else {
                all_caught_up = false;
                break;
            };
            if !self.await_session_primary_pos(index, remaining).await {
                all_caught_up = false;
            }
        }

        if let Some(previous) = previous {
            self.positions.merge(previous);
        }
        Ok(all_caught_up)
    }

    fn streaming_replica_indexes_with_load(&self) -> Vec<usize> {
        self.config
            .servers
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, server)| {
                !server.is_static
                    && (server.load > 0 || server.group_loads.values().any(|&w| w > 0))
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// Wait for one server to reach the session position.
    ///
    /// The writer trivially succeeds. A cached known-reached position
    /// skips the wait entirely; a successful wait refreshes that cache.
    /// Returns `false` on any failure rather than erroring: a missed wait
    /// degrades the session, it doesn't break it.
    pub async fn await_session_primary_pos(&mut self, index: usize, timeout: Duration) -> bool {
        if index == 0 {
            return true;
        }
        let Some(pos) = self.positions.wait_pos().cloned() else {
            return true;
        };
        let server = self.config.servers[index].clone();
        if server.is_static {
            // Fixed content; the replication stream does not apply
            return true;
        }

        if let Some(reached) = cached_reached_pos(&*self.local_cache, &server.name) {
            if reached.has_reached(&pos) {
                return true;
            }
        }

        let (handle, temporary) = match self.pool.any_open(index) {
            Some(handle) => (handle, false),
            None => {
                let domain = self.resolver.local().clone();
                match self.factory.open(index, &server, &domain).await {
                    Ok(driver) => (
                        Handle::new(index, server.name.clone(), PoolClass::Round, driver),
                        true,
                    ),
                    Err(e) => {
                        tracing::debug!(
                            server = %server.name,
                            error = %e,
                            "Could not open connection for position wait"
                        );
                        return false;
                    }
                }
            }
        };

        let result = handle
            .driver()
            .await
            .primary_pos_wait(&pos, timeout)
            .await;
        let caught_up = matches!(result, Some(v) if v >= 0);
        if caught_up {
            store_reached_pos(&*self.local_cache, &server.name, &pos);
        } else {
            tracing::info!(
                server = %server.name,
                pos = %pos,
                "Replica failed to reach session position within timeout"
            );
        }

        if temporary {
            handle.driver().await.close().await;
        }
        caught_up
    }

    // ------------------------------------------------------------------
    // Read-only state
    // ------------------------------------------------------------------

    /// Why the cluster refuses writes right now, or `None` if it doesn't.
    pub async fn read_only_reason(&mut self) -> Option<String> {
        if let Some(reason) = &self.config.read_only_reason {
            return Some(reason.clone());
        }
        if self.lagged_replica_mode {
            return Some("until replication lag decreases".to_string());
        }
        if self.is_primary_running_read_only().await {
            return Some("the primary server is running in read-only mode".to_string());
        }
        None
    }

    /// Whether the primary reports server-side read-only mode, through
    /// the two-tier cache. Probe failures read as writable.
    pub async fn is_primary_running_read_only(&mut self) -> bool {
        let writer = self.config.servers[0].name.clone();
        if let Some(read_only) = self.readonly.cached(&writer) {
            return read_only;
        }

        // Park a "not read-only" busy value before probing; concurrent
        // probers read the placeholder instead of opening writer
        // connections of their own
        self.readonly.store(&writer, false);

        // Out-of-band probe; must not disturb any active round
        let domain = self.resolver.local().clone();
        let probed = match self.acquire(0, &domain, PoolClass::Autocommit, true).await {
            Ok(handle) => handle.driver().await.server_is_read_only().await.ok(),
            Err(_) => None,
        };
        let read_only = probed.unwrap_or(false);
        self.readonly.store(&writer, read_only);
        read_only
    }

    // ------------------------------------------------------------------
    // Transaction rounds
    // ------------------------------------------------------------------

    pub fn round_stage(&self) -> RoundStage {
        self.round.stage()
    }

    pub fn round_id(&self) -> Option<&str> {
        self.round.round_id()
    }

    /// Start a transaction round spanning every round-class writer handle.
    pub async fn begin_primary_changes(&mut self, round_id: &str) -> Result<()> {
        let handles = self.pool.writer_round_handles();
        self.round.begin(round_id, &handles).await
    }

    /// Run pre-commit callbacks to a fixpoint and suppress post-commit
    /// callbacks until the round resolves.
    pub async fn finalize_primary_changes(&mut self) -> Result<()> {
        let handles = self.pool.writer_round_handles();
        self.round.finalize(&handles).await
    }

    /// Budget and liveness checks before the en-masse commit.
    pub async fn approve_primary_changes(
        &mut self,
        max_write_duration: Option<Duration>,
    ) -> Result<()> {
        let handles = self.pool.writer_round_handles();
        self.round.approve(&handles, max_write_duration).await
    }

    /// Commit every writer handle together.
    pub async fn commit_primary_changes(&mut self) -> Result<()> {
        let handles = self.pool.writer_round_handles();
        self.round.commit(&handles).await
    }

    /// Roll the round back from any stage.
    pub async fn rollback_primary_changes(&mut self) -> Result<()> {
        let handles = self.pool.writer_round_handles();
        self.round.rollback(&handles).await
    }

    /// Drain post-commit/rollback callbacks and return the round to rest.
    pub async fn run_idle_callbacks(&mut self) -> Result<()> {
        let handles = self.pool.writer_round_handles();
        self.round.run_idle_callbacks(&handles).await
    }

    /// Flush empty writer snapshots outside a round.
    pub async fn flush_primary_snapshots(&mut self) -> Result<()> {
        let handles = self.pool.writer_round_handles();
        self.round.flush_snapshots(&handles).await
    }

    // ------------------------------------------------------------------
    // Reconfiguration & lifecycle
    // ------------------------------------------------------------------

    pub fn mod_count(&self) -> u64 {
        self.mod_count
    }

    /// Apply a new server list.
    ///
    /// Server display names are the identity: if no name disappeared this
    /// is a no-op, and a configuration replacing a server with another of
    /// the same name is treated as unchanged. When servers were removed,
    /// group loads are rebuilt, reader stickiness and the pools reset, and
    /// the modification counter moves so outstanding references re-resolve.
    /// Handles inside a transaction are left to finish out of pool.
    pub async fn reconfigure(&mut self, servers: Vec<ServerDescriptor>) -> Result<()> {
        let new_names: HashSet<&str> = servers.iter().map(|s| s.name.as_str()).collect();
        let removed: Vec<String> = self
            .config
            .servers
            .iter()
            .filter(|s| !new_names.contains(s.name.as_str()))
            .map(|s| s.name.clone())
            .collect();
        if removed.is_empty() {
            tracing::debug!("Reconfiguration removed no servers; nothing to do");
            return Ok(());
        }

        let mut config = self.config.clone();
        config.servers = servers;
        config.validate()?;
        self.config = config;

        self.group_loads = Self::build_group_loads(&self.config.servers);
        self.reader_index.clear();

        for handle in self.pool.drain() {
            let mut driver = handle.driver().await;
            if driver.trx_level() > 0 {
                tracing::info!(
                    handle = %handle.id(),
                    server = %handle.server_name(),
                    "Leaving in-transaction handle to finish outside the pool"
                );
            } else {
                driver.close().await;
            }
        }

        self.mod_count += 1;
        tracing::info!(
            removed = ?removed,
            mod_count = self.mod_count,
            "Applied cluster reconfiguration"
        );
        Ok(())
    }

    /// Close every pooled connection and reset session reader state.
    /// Idempotent.
    pub async fn close_all(&mut self) {
        let handles = self.pool.drain();
        let count = handles.len();
        for handle in handles {
            handle.driver().await.close().await;
        }
        self.reader_index.clear();
        self.lagged_replica_mode = false;
        if count > 0 {
            tracing::debug!(closed = count, "Closed all pooled connections");
        }
    }

    /// Close a specific handle, wherever it lives.
    pub async fn close_connection(&mut self, handle: &HandleRef) {
        self.pool.close_handle(handle).await;
    }

    /// Refuse all further opens.
    pub fn disable(&mut self, reason: &str) {
        self.disabled = Some(reason.to_string());
    }

    /// Swap the local domain's table prefix and re-target every open
    /// handle that lives in the local database/schema.
    pub async fn set_local_domain_prefix(&mut self, prefix: &str) -> Result<()> {
        self.resolver.set_local_prefix(prefix);
        let local = self.resolver.local().clone();

        for handle in self.pool.all_handles() {
            let mut driver = handle.driver().await;
            let current = driver.domain();
            if current.database() == local.database() && current.schema() == local.schema() {
                let retargeted = current.with_prefix(prefix);
                driver
                    .switch_domain(&retargeted)
                    .await
                    .map_err(|e| BalancerError::Driver {
                        server: handle.server_name().to_string(),
                        source: e,
                    })?;
            }
        }
        Ok(())
    }

    /// Mark a domain as holding only temp tables, which disables the
    /// autocommit pool split for it.
    pub fn set_temp_tables_only_mode(&mut self, on: bool, domain: DomainSpec) {
        let id = self.resolver.resolve(domain).canonical_id();
        if on {
            self.temp_tables_only.insert(id);
        } else {
            self.temp_tables_only.remove(&id);
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn server_count(&self) -> usize {
        self.config.servers.len()
    }

    pub fn server_name(&self, index: usize) -> Option<&str> {
        self.config.servers.get(index).map(|s| s.name.as_str())
    }

    pub fn has_replica_servers(&self) -> bool {
        self.config.has_replica_servers()
    }

    pub fn has_streaming_replica_servers(&self) -> bool {
        self.config.has_streaming_replica_servers()
    }

    /// Current lag per server index, straight from the monitor.
    pub fn lag_times(&self) -> HashMap<usize, ReplicaLag> {
        let indexes: Vec<usize> = (0..self.config.servers.len()).collect();
        self.monitor.lag_times(&indexes)
    }

    pub fn local_domain(&self) -> &DatabaseDomain {
        self.resolver.local()
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}
