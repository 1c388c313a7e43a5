//! Driver seam.
//!
//! The balancer never executes SQL itself; it coordinates driver
//! connections through the [`DatabaseDriver`] trait and opens them through
//! a [`DriverFactory`]. This module also ships [`MockDriver`] and
//! [`MockDriverFactory`], scriptable implementations used throughout the
//! crate's tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ServerDescriptor;
use crate::domain::DatabaseDomain;
use crate::pool::PoolClass;
use crate::position::PrimaryPosition;

/// Result type for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Errors surfaced by a driver connection.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The connection could not be established
    #[error("Connect failed: {0}")]
    Connect(String),

    /// A statement or control operation failed on an open connection
    #[error("Query failed: {0}")]
    Query(String),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Static properties of the driver implementation behind a factory.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverAttributes {
    /// Databases are independent catalogs: a dbname change needs a new
    /// connection rather than a schema switch
    pub databases_are_independent: bool,

    /// The engine takes database-level locks, so concurrent autocommit
    /// writes are unsupported
    pub db_level_locking: bool,
}

/// Scope of a commit or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Only this connection
    One,
    /// This connection as one of all round peers being flushed together
    AllPeers,
}

impl FlushMode {
    fn as_str(&self) -> &'static str {
        match self {
            FlushMode::One => "one",
            FlushMode::AllPeers => "all-peers",
        }
    }
}

/// What just finished, for transaction listener callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionTrigger {
    Commit,
    Rollback,
}

impl TransactionTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            TransactionTrigger::Commit => "commit",
            TransactionTrigger::Rollback => "rollback",
        }
    }
}

/// Where a connection's server sits in the cluster topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyRole {
    Writer,
    Replica,
    StaticClone,
}

/// Balancer bookkeeping attached to every opened connection.
#[derive(Debug, Clone, Copy)]
pub struct LbInfo {
    pub server_index: usize,
    pub pool_class: PoolClass,
    pub role: TopologyRole,
}

/// Outcome of one callback sweep on one connection. Callback errors are
/// accumulated by the caller rather than aborting the sweep.
#[derive(Debug, Default)]
pub struct CallbackSweep {
    /// Number of callbacks that ran
    pub ran: usize,
    /// First error any of them produced
    pub first_error: Option<DriverError>,
}

/// One driver connection as the balancer sees it.
///
/// The driver owns the connection's transaction state (level, pending
/// writes, session locks) and its registered callbacks; the balancer only
/// ever drives those through this interface.
#[async_trait]
pub trait DatabaseDriver: Send {
    /// Current effective domain of the connection.
    fn domain(&self) -> DatabaseDomain;

    /// Re-target the connection at another domain.
    async fn switch_domain(&mut self, domain: &DatabaseDomain) -> DriverResult<()>;

    /// Transaction nesting level; 0 means no transaction is open.
    fn trx_level(&self) -> u32;

    /// Whether an explicitly demarcated atomic section is still open.
    fn explicit_trx_active(&self) -> bool;

    /// Whether uncommitted writes are pending.
    fn writes_pending(&self) -> bool;

    /// Estimated wall-clock seconds the pending writes took to issue.
    fn pending_write_duration(&self) -> f64;

    /// Whether session-scoped locks are held.
    fn has_session_locks(&self) -> bool;

    /// Whether the connection is configured to prefer implicit
    /// transactions (its default flags ask for transactional mode).
    fn wants_trx_mode(&self) -> bool;

    /// Whether implicit-transaction mode is currently on.
    fn in_trx_mode(&self) -> bool;

    fn set_trx_mode(&mut self, on: bool);

    fn set_lb_info(&mut self, info: LbInfo);

    fn set_table_aliases(&mut self, aliases: HashMap<String, String>);

    fn set_index_aliases(&mut self, aliases: HashMap<String, String>);

    /// Commit-or-discard any empty implicit snapshot so stale reads do not
    /// leak into what follows. Fails if writes are pending.
    async fn flush_snapshot(&mut self) -> DriverResult<()>;

    async fn commit(&mut self, mode: FlushMode) -> DriverResult<()>;

    async fn rollback(&mut self, mode: FlushMode) -> DriverResult<()>;

    /// Liveness check; `false` means the connection was silently dropped.
    async fn ping(&mut self) -> bool;

    /// Block until this replica reaches `pos` or `timeout` elapses.
    /// `None` and negative values both mean the wait failed.
    async fn primary_pos_wait(
        &mut self,
        pos: &PrimaryPosition,
        timeout: Duration,
    ) -> Option<i64>;

    /// Whether the server itself is in read-only mode.
    async fn server_is_read_only(&mut self) -> DriverResult<bool>;

    /// Run queued pre-commit callbacks to exhaustion on this connection,
    /// returning how many ran. Errors abort the round finalization.
    async fn run_pre_commit_callbacks(&mut self) -> DriverResult<usize>;

    fn suppress_post_commit_callbacks(&mut self, suppress: bool);

    fn post_commit_callbacks_suppressed(&self) -> bool;

    /// Run the currently queued post-commit/idle callbacks once.
    async fn run_idle_callbacks(&mut self) -> CallbackSweep;

    /// Run the long-lived transaction listener hooks.
    async fn run_listener_callbacks(&mut self, trigger: TransactionTrigger) -> CallbackSweep;

    async fn close(&mut self);
}

/// Opens driver connections for the balancer.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    /// Static driver properties, known without opening a connection.
    fn attributes(&self) -> DriverAttributes;

    async fn open(
        &self,
        index: usize,
        server: &ServerDescriptor,
        domain: &DatabaseDomain,
    ) -> DriverResult<Box<dyn DatabaseDriver>>;
}

// ============================================================================
// Mock implementation
// ============================================================================

use parking_lot::Mutex;

type MockCallback = Box<dyn FnOnce() -> DriverResult<()> + Send>;

struct MockConnInner {
    domain: DatabaseDomain,
    trx_level: u32,
    explicit_trx: bool,
    writes_pending: bool,
    write_duration: f64,
    session_locks: bool,
    wants_trx_mode: bool,
    trx_mode: bool,
    post_commit_suppressed: bool,
    read_only: bool,
    probe_error: bool,
    fail_commit: Option<String>,
    ping_ok: bool,
    reached_pos: Option<u64>,
    lb_info: Option<LbInfo>,
    table_aliases: HashMap<String, String>,
    index_aliases: HashMap<String, String>,
    ops: Vec<String>,
    pre_commit: VecDeque<MockCallback>,
    idle: VecDeque<MockCallback>,
    listeners: Vec<(String, Option<String>)>,
    closed: bool,
}

struct MockConnState {
    server_index: usize,
    server_name: String,
    inner: Mutex<MockConnInner>,
}

/// Shared control over one mock connection.
///
/// The factory hands out one control per opened connection; tests keep the
/// control while the driver itself moves into the balancer's pool.
#[derive(Clone)]
pub struct MockConnControl {
    state: Arc<MockConnState>,
}

impl MockConnControl {
    pub fn server_index(&self) -> usize {
        self.state.server_index
    }

    pub fn server_name(&self) -> &str {
        &self.state.server_name
    }

    pub fn domain_id(&self) -> String {
        self.state.inner.lock().domain.canonical_id()
    }

    pub fn trx_level(&self) -> u32 {
        self.state.inner.lock().trx_level
    }

    pub fn trx_mode(&self) -> bool {
        self.state.inner.lock().trx_mode
    }

    pub fn post_commit_suppressed(&self) -> bool {
        self.state.inner.lock().post_commit_suppressed
    }

    pub fn closed(&self) -> bool {
        self.state.inner.lock().closed
    }

    pub fn lb_info(&self) -> Option<LbInfo> {
        self.state.inner.lock().lb_info
    }

    pub fn table_aliases(&self) -> HashMap<String, String> {
        self.state.inner.lock().table_aliases.clone()
    }

    pub fn index_aliases(&self) -> HashMap<String, String> {
        self.state.inner.lock().index_aliases.clone()
    }

    /// Every driver call made on this connection, in order.
    pub fn ops(&self) -> Vec<String> {
        self.state.inner.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.inner.lock().ops.clear();
    }

    pub fn set_trx_level(&self, level: u32) {
        self.state.inner.lock().trx_level = level;
    }

    pub fn set_explicit_trx(&self, active: bool) {
        self.state.inner.lock().explicit_trx = active;
    }

    /// Mark writes pending; also opens an implicit transaction if none is.
    pub fn set_writes_pending(&self, pending: bool) {
        let mut inner = self.state.inner.lock();
        inner.writes_pending = pending;
        if pending && inner.trx_level == 0 {
            inner.trx_level = 1;
        }
    }

    pub fn set_write_duration(&self, seconds: f64) {
        self.state.inner.lock().write_duration = seconds;
    }

    pub fn set_session_locks(&self, held: bool) {
        self.state.inner.lock().session_locks = held;
    }

    pub fn set_wants_trx_mode(&self, wants: bool) {
        self.state.inner.lock().wants_trx_mode = wants;
    }

    pub fn set_fail_commit(&self, message: Option<&str>) {
        self.state.inner.lock().fail_commit = message.map(str::to_string);
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.state.inner.lock().ping_ok = ok;
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.state.inner.lock().read_only = read_only;
    }

    pub fn set_probe_error(&self, error: bool) {
        self.state.inner.lock().probe_error = error;
    }

    /// Highest primary position this replica will report having reached.
    pub fn set_reached_pos(&self, pos: Option<u64>) {
        self.state.inner.lock().reached_pos = pos;
    }

    pub fn queue_pre_commit<C>(&self, callback: C)
    where
        C: FnOnce() -> DriverResult<()> + Send + 'static,
    {
        self.state.inner.lock().pre_commit.push_back(Box::new(callback));
    }

    pub fn queue_idle<C>(&self, callback: C)
    where
        C: FnOnce() -> DriverResult<()> + Send + 'static,
    {
        self.state.inner.lock().idle.push_back(Box::new(callback));
    }

    pub fn add_listener(&self, name: &str, error: Option<&str>) {
        self.state
            .inner
            .lock()
            .listeners
            .push((name.to_string(), error.map(str::to_string)));
    }
}

/// Scriptable in-memory driver connection.
pub struct MockDriver {
    state: Arc<MockConnState>,
}

#[async_trait]
impl DatabaseDriver for MockDriver {
    fn domain(&self) -> DatabaseDomain {
        self.state.inner.lock().domain.clone()
    }

    async fn switch_domain(&mut self, domain: &DatabaseDomain) -> DriverResult<()> {
        let mut inner = self.state.inner.lock();
        inner.ops.push(format!("switch_domain:{}", domain.canonical_id()));
        inner.domain = domain.clone();
        Ok(())
    }

    fn trx_level(&self) -> u32 {
        self.state.inner.lock().trx_level
    }

    fn explicit_trx_active(&self) -> bool {
        self.state.inner.lock().explicit_trx
    }

    fn writes_pending(&self) -> bool {
        self.state.inner.lock().writes_pending
    }

    fn pending_write_duration(&self) -> f64 {
        self.state.inner.lock().write_duration
    }

    fn has_session_locks(&self) -> bool {
        self.state.inner.lock().session_locks
    }

    fn wants_trx_mode(&self) -> bool {
        self.state.inner.lock().wants_trx_mode
    }

    fn in_trx_mode(&self) -> bool {
        self.state.inner.lock().trx_mode
    }

    fn set_trx_mode(&mut self, on: bool) {
        let mut inner = self.state.inner.lock();
        inner.ops.push(format!("set_trx_mode:{on}"));
        inner.trx_mode = on;
    }

    fn set_lb_info(&mut self, info: LbInfo) {
        self.state.inner.lock().lb_info = Some(info);
    }

    fn set_table_aliases(&mut self, aliases: HashMap<String, String>) {
        self.state.inner.lock().table_aliases = aliases;
    }

    fn set_index_aliases(&mut self, aliases: HashMap<String, String>) {
        self.state.inner.lock().index_aliases = aliases;
    }

    async fn flush_snapshot(&mut self) -> DriverResult<()> {
        let mut inner = self.state.inner.lock();
        if inner.writes_pending {
            return Err(DriverError::Query(
                "cannot flush snapshot with writes pending".to_string(),
            ));
        }
        inner.ops.push("flush_snapshot".to_string());
        inner.trx_level = 0;
        Ok(())
    }

    async fn commit(&mut self, mode: FlushMode) -> DriverResult<()> {
        let mut inner = self.state.inner.lock();
        inner.ops.push(format!("commit:{}", mode.as_str()));
        if let Some(message) = inner.fail_commit.clone() {
            return Err(DriverError::Query(message));
        }
        inner.trx_level = 0;
        inner.writes_pending = false;
        inner.write_duration = 0.0;
        inner.explicit_trx = false;
        Ok(())
    }

    async fn rollback(&mut self, mode: FlushMode) -> DriverResult<()> {
        let mut inner = self.state.inner.lock();
        inner.ops.push(format!("rollback:{}", mode.as_str()));
        inner.trx_level = 0;
        inner.writes_pending = false;
        inner.write_duration = 0.0;
        inner.explicit_trx = false;
        Ok(())
    }

    async fn ping(&mut self) -> bool {
        let mut inner = self.state.inner.lock();
        inner.ops.push("ping".to_string());
        inner.ping_ok
    }

    async fn primary_pos_wait(
        &mut self,
        pos: &PrimaryPosition,
        _timeout: Duration,
    ) -> Option<i64> {
        let mut inner = self.state.inner.lock();
        inner.ops.push(format!("pos_wait:{}", pos.value()));
        match inner.reached_pos {
            Some(reached) if reached >= pos.value() => Some(0),
            Some(_) => Some(-1),
            None => None,
        }
    }

    async fn server_is_read_only(&mut self) -> DriverResult<bool> {
        let mut inner = self.state.inner.lock();
        inner.ops.push("read_only_probe".to_string());
        if inner.probe_error {
            return Err(DriverError::Query("probe failed".to_string()));
        }
        Ok(inner.read_only)
    }

    async fn run_pre_commit_callbacks(&mut self) -> DriverResult<usize> {
        let mut ran = 0;
        loop {
            let callback = self.state.inner.lock().pre_commit.pop_front();
            match callback {
                Some(callback) => {
                    callback()?;
                    ran += 1;
                }
                None => return Ok(ran),
            }
        }
    }

    fn suppress_post_commit_callbacks(&mut self, suppress: bool) {
        self.state.inner.lock().post_commit_suppressed = suppress;
    }

    fn post_commit_callbacks_suppressed(&self) -> bool {
        self.state.inner.lock().post_commit_suppressed
    }

    async fn run_idle_callbacks(&mut self) -> CallbackSweep {
        let mut sweep = CallbackSweep::default();
        if self.state.inner.lock().post_commit_suppressed {
            return sweep;
        }
        loop {
            let callback = self.state.inner.lock().idle.pop_front();
            match callback {
                Some(callback) => {
                    sweep.ran += 1;
                    if let Err(e) = callback() {
                        sweep.first_error.get_or_insert(e);
                    }
                }
                None => return sweep,
            }
        }
    }

    async fn run_listener_callbacks(&mut self, trigger: TransactionTrigger) -> CallbackSweep {
        let mut sweep = CallbackSweep::default();
        let listeners = {
            let mut inner = self.state.inner.lock();
            inner.ops.push(format!("listeners:{}", trigger.as_str()));
            inner.listeners.clone()
        };
        for (name, error) in listeners {
            sweep.ran += 1;
            if let Some(message) = error {
                sweep
                    .first_error
                    .get_or_insert(DriverError::Query(format!("listener '{name}': {message}")));
            }
        }
        sweep
    }

    async fn close(&mut self) {
        let mut inner = self.state.inner.lock();
        inner.ops.push("close".to_string());
        inner.closed = true;
    }
}

struct MockFactoryInner {
    attributes: Mutex<DriverAttributes>,
    fail_connect: Mutex<HashSet<usize>>,
    opens: Mutex<Vec<(usize, String)>>,
    controls: Mutex<Vec<MockConnControl>>,
    wants_trx_mode: Mutex<bool>,
    default_reached_pos: Mutex<Option<u64>>,
}

/// Factory producing [`MockDriver`] connections.
///
/// Connection failures are scripted per server index; every successful
/// open registers a [`MockConnControl`] retrievable by tests.
#[derive(Clone)]
pub struct MockDriverFactory {
    inner: Arc<MockFactoryInner>,
}

impl MockDriverFactory {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockFactoryInner {
                attributes: Mutex::new(DriverAttributes::default()),
                fail_connect: Mutex::new(HashSet::new()),
                opens: Mutex::new(Vec::new()),
                controls: Mutex::new(Vec::new()),
                wants_trx_mode: Mutex::new(true),
                default_reached_pos: Mutex::new(None),
            }),
        }
    }

    pub fn set_attributes(&self, attributes: DriverAttributes) {
        *self.inner.attributes.lock() = attributes;
    }

    /// Default implicit-transaction preference for new connections.
    pub fn set_wants_trx_mode(&self, wants: bool) {
        *self.inner.wants_trx_mode.lock() = wants;
    }

    /// Default reached replication position for new connections.
    pub fn set_default_reached_pos(&self, pos: Option<u64>) {
        *self.inner.default_reached_pos.lock() = pos;
    }

    pub fn fail_connections_to(&self, index: usize) {
        self.inner.fail_connect.lock().insert(index);
    }

    pub fn allow_connections_to(&self, index: usize) {
        self.inner.fail_connect.lock().remove(&index);
    }

    /// `(server index, domain id)` per successful or attempted open.
    pub fn opens(&self) -> Vec<(usize, String)> {
        self.inner.opens.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.inner.opens.lock().len()
    }

    pub fn controls(&self) -> Vec<MockConnControl> {
        self.inner.controls.lock().clone()
    }

    pub fn controls_for(&self, index: usize) -> Vec<MockConnControl> {
        self.inner
            .controls
            .lock()
            .iter()
            .filter(|c| c.server_index() == index)
            .cloned()
            .collect()
    }

    pub fn last_control(&self) -> MockConnControl {
        self.inner
            .controls
            .lock()
            .last()
            .cloned()
            .expect("no connections opened")
    }
}

impl Default for MockDriverFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriverFactory for MockDriverFactory {
    fn attributes(&self) -> DriverAttributes {
        *self.inner.attributes.lock()
    }

    async fn open(
        &self,
        index: usize,
        server: &ServerDescriptor,
        domain: &DatabaseDomain,
    ) -> DriverResult<Box<dyn DatabaseDriver>> {
        self.inner
            .opens
            .lock()
            .push((index, domain.canonical_id()));

        if self.inner.fail_connect.lock().contains(&index) {
            return Err(DriverError::Connect(format!(
                "mock: connections to '{}' refused",
                server.name
            )));
        }

        let state = Arc::new(MockConnState {
            server_index: index,
            server_name: server.name.clone(),
            inner: Mutex::new(MockConnInner {
                domain: domain.clone(),
                trx_level: 0,
                explicit_trx: false,
                writes_pending: false,
                write_duration: 0.0,
                session_locks: false,
                wants_trx_mode: *self.inner.wants_trx_mode.lock(),
                trx_mode: false,
                post_commit_suppressed: false,
                read_only: false,
                probe_error: false,
                fail_commit: None,
                ping_ok: true,
                reached_pos: *self.inner.default_reached_pos.lock(),
                lb_info: None,
                table_aliases: HashMap::new(),
                index_aliases: HashMap::new(),
                ops: Vec::new(),
                pre_commit: VecDeque::new(),
                idle: VecDeque::new(),
                listeners: Vec::new(),
                closed: false,
            }),
        });
        self.inner.controls.lock().push(MockConnControl {
            state: state.clone(),
        });
        Ok(Box::new(MockDriver { state }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_mock(factory: &MockDriverFactory) -> (Box<dyn DatabaseDriver>, MockConnControl) {
        let server = ServerDescriptor::new("db1", 0);
        let domain = DatabaseDomain::from_id("appdb");
        let driver = factory.open(0, &server, &domain).await.unwrap();
        (driver, factory.last_control())
    }

    #[tokio::test]
    async fn test_scripted_connect_failure() {
        let factory = MockDriverFactory::new();
        factory.fail_connections_to(1);

        let server = ServerDescriptor::new("db2", 10);
        let domain = DatabaseDomain::from_id("appdb");
        let result = factory.open(1, &server, &domain).await;
        assert!(matches!(result, Err(DriverError::Connect(_))));

        factory.allow_connections_to(1);
        assert!(factory.open(1, &server, &domain).await.is_ok());
        assert_eq!(factory.open_count(), 2);
    }

    #[tokio::test]
    async fn test_commit_resets_transaction_state() {
        let factory = MockDriverFactory::new();
        let (mut driver, control) = open_mock(&factory).await;

        control.set_writes_pending(true);
        control.set_write_duration(2.5);
        assert_eq!(driver.trx_level(), 1);
        assert!(driver.writes_pending());

        driver.commit(FlushMode::AllPeers).await.unwrap();
        assert_eq!(driver.trx_level(), 0);
        assert!(!driver.writes_pending());
        assert_eq!(driver.pending_write_duration(), 0.0);
        assert!(control.ops().contains(&"commit:all-peers".to_string()));
    }

    #[tokio::test]
    async fn test_commit_failure_is_scripted() {
        let factory = MockDriverFactory::new();
        let (mut driver, control) = open_mock(&factory).await;

        control.set_fail_commit(Some("disk full"));
        let err = driver.commit(FlushMode::One).await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }

    #[tokio::test]
    async fn test_pre_commit_callbacks_drain_to_exhaustion() {
        let factory = MockDriverFactory::new();
        let (mut driver, control) = open_mock(&factory).await;

        // A callback that queues another on the same connection
        let chained = control.clone();
        control.queue_pre_commit(move || {
            chained.queue_pre_commit(|| Ok(()));
            Ok(())
        });

        let ran = driver.run_pre_commit_callbacks().await.unwrap();
        assert_eq!(ran, 2);
        assert_eq!(driver.run_pre_commit_callbacks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_idle_callbacks_accumulate_errors() {
        let factory = MockDriverFactory::new();
        let (mut driver, control) = open_mock(&factory).await;

        control.queue_idle(|| Err(DriverError::Query("first".to_string())));
        control.queue_idle(|| Ok(()));
        control.queue_idle(|| Err(DriverError::Query("second".to_string())));

        let sweep = driver.run_idle_callbacks().await;
        assert_eq!(sweep.ran, 3);
        assert!(sweep.first_error.unwrap().to_string().contains("first"));
    }

    #[tokio::test]
    async fn test_idle_callbacks_respect_suppression() {
        let factory = MockDriverFactory::new();
        let (mut driver, control) = open_mock(&factory).await;

        control.queue_idle(|| Ok(()));
        driver.suppress_post_commit_callbacks(true);
        assert_eq!(driver.run_idle_callbacks().await.ran, 0);

        driver.suppress_post_commit_callbacks(false);
        assert_eq!(driver.run_idle_callbacks().await.ran, 1);
    }

    #[tokio::test]
    async fn test_pos_wait_outcomes() {
        let factory = MockDriverFactory::new();
        let (mut driver, control) = open_mock(&factory).await;
        let target = PrimaryPosition::new(50);
        let timeout = Duration::from_secs(1);

        // Not replicating at all
        assert_eq!(driver.primary_pos_wait(&target, timeout).await, None);

        control.set_reached_pos(Some(10));
        assert_eq!(driver.primary_pos_wait(&target, timeout).await, Some(-1));

        control.set_reached_pos(Some(50));
        assert_eq!(driver.primary_pos_wait(&target, timeout).await, Some(0));
    }
}
