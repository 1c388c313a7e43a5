//! Connection pooling.
//!
//! Handles live in one of two disjoint pools per server: the `Round` pool
//! for connections that participate in transaction rounds and the
//! `Autocommit` pool for out-of-band work. The segregation is load-bearing:
//! a short out-of-band commit must never flush or bloat the main round's
//! snapshot, so an autocommit handle can never be handed out for round
//! work or vice versa.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::DatabaseDomain;
use crate::driver::DatabaseDriver;

/// Which pool a handle belongs to, fixed for the handle's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolClass {
    /// Participates in transaction rounds
    Round,
    /// Out-of-band autocommit work, never touched by round flags
    Autocommit,
}

/// A unique identifier for a pooled connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(Uuid);

impl HandleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short readable form, "conn_xxxxxxxx".
    pub fn to_short_string(&self) -> String {
        let hex = format!("{:032x}", self.0.as_u128());
        format!("conn_{}", &hex[..8])
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

/// Round participation bookkeeping for one handle.
#[derive(Debug, Default)]
struct RoundParticipation {
    round_id: Option<String>,
    prior_trx_mode: Option<bool>,
}

/// One pooled driver connection plus the balancer's bookkeeping for it.
///
/// The balancer exclusively owns every handle; application code holds
/// lightweight references that re-resolve here on use.
pub struct Handle {
    id: HandleId,
    server_index: usize,
    server_name: String,
    pool_class: PoolClass,
    driver: tokio::sync::Mutex<Box<dyn DatabaseDriver>>,
    round: parking_lot::Mutex<RoundParticipation>,
}

pub type HandleRef = Arc<Handle>;

impl Handle {
    pub fn new(
        server_index: usize,
        server_name: String,
        pool_class: PoolClass,
        driver: Box<dyn DatabaseDriver>,
    ) -> HandleRef {
        Arc::new(Self {
            id: HandleId::new(),
            server_index,
            server_name,
            pool_class,
            driver: tokio::sync::Mutex::new(driver),
            round: parking_lot::Mutex::new(RoundParticipation::default()),
        })
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn server_index(&self) -> usize {
        self.server_index
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn pool_class(&self) -> PoolClass {
        self.pool_class
    }

    /// Exclusive access to the underlying driver connection.
    pub async fn driver(&self) -> tokio::sync::MutexGuard<'_, Box<dyn DatabaseDriver>> {
        self.driver.lock().await
    }

    /// The round this handle is currently flagged into, if any.
    pub fn round_id(&self) -> Option<String> {
        self.round.lock().round_id.clone()
    }

    /// Flag the handle into a round: remember the driver's transaction
    /// mode and force it on if the connection wants implicit transactions.
    /// Autocommit-class handles are never touched.
    pub(crate) async fn apply_round_flags(&self, round_id: &str) {
        if self.pool_class == PoolClass::Autocommit {
            return;
        }
        if self.round.lock().round_id.as_deref() == Some(round_id) {
            return;
        }

        let prior = {
            let mut driver = self.driver.lock().await;
            let prior = driver.in_trx_mode();
            if driver.wants_trx_mode() && !prior {
                driver.set_trx_mode(true);
            }
            prior
        };

        let mut round = self.round.lock();
        round.round_id = Some(round_id.to_string());
        round.prior_trx_mode = Some(prior);
    }

    /// Undo [`apply_round_flags`](Self::apply_round_flags): restore the
    /// prior transaction mode and clear the round tag.
    pub(crate) async fn undo_round_flags(&self) {
        let prior = {
            let mut round = self.round.lock();
            round.round_id = None;
            round.prior_trx_mode.take()
        };
        if let Some(prior) = prior {
            let mut driver = self.driver.lock().await;
            if driver.in_trx_mode() != prior {
                driver.set_trx_mode(prior);
            }
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("server_index", &self.server_index)
            .field("server_name", &self.server_name)
            .field("pool_class", &self.pool_class)
            .finish()
    }
}

/// The two pools: class → server index → live handles.
#[derive(Default)]
pub struct ConnectionPool {
    round: HashMap<usize, Vec<HandleRef>>,
    autocommit: HashMap<usize, Vec<HandleRef>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn class_pool(&self, class: PoolClass) -> &HashMap<usize, Vec<HandleRef>> {
        match class {
            PoolClass::Round => &self.round,
            PoolClass::Autocommit => &self.autocommit,
        }
    }

    fn class_pool_mut(&mut self, class: PoolClass) -> &mut HashMap<usize, Vec<HandleRef>> {
        match class {
            PoolClass::Round => &mut self.round,
            PoolClass::Autocommit => &mut self.autocommit,
        }
    }

    pub fn add(&mut self, handle: HandleRef) {
        self.class_pool_mut(handle.pool_class())
            .entry(handle.server_index())
            .or_default()
            .push(handle);
    }

    /// Find a pooled handle on `index` that can serve `domain`.
    ///
    /// A handle is shareable across a domain switch unless databases are
    /// independent catalogs and the target dbname differs from the
    /// handle's current dbname.
    pub async fn find_reusable(
        &self,
        class: PoolClass,
        index: usize,
        domain: &DatabaseDomain,
        databases_independent: bool,
    ) -> Option<HandleRef> {
        let handles = self.class_pool(class).get(&index)?;
        for handle in handles {
            if databases_independent {
                let current = handle.driver().await.domain();
                if current.database() != domain.database() {
                    continue;
                }
            }
            return Some(handle.clone());
        }
        None
    }

    /// Remove a handle from whichever pool contains it.
    pub fn remove(&mut self, id: HandleId) -> Option<HandleRef> {
        for pool in [&mut self.round, &mut self.autocommit] {
            for handles in pool.values_mut() {
                if let Some(at) = handles.iter().position(|h| h.id() == id) {
                    return Some(handles.remove(at));
                }
            }
        }
        None
    }

    pub fn contains(&self, id: HandleId) -> bool {
        [&self.round, &self.autocommit]
            .iter()
            .any(|pool| pool.values().any(|hs| hs.iter().any(|h| h.id() == id)))
    }

    /// Every pooled handle, both classes.
    pub fn all_handles(&self) -> Vec<HandleRef> {
        self.round
            .values()
            .chain(self.autocommit.values())
            .flatten()
            .cloned()
            .collect()
    }

    /// Round-class handles on the writer; the set a transaction round
    /// spans.
    pub fn writer_round_handles(&self) -> Vec<HandleRef> {
        self.round.get(&0).cloned().unwrap_or_default()
    }

    /// Any open handle on a server, preferring the round class.
    pub fn any_open(&self, index: usize) -> Option<HandleRef> {
        self.round
            .get(&index)
            .and_then(|hs| hs.first())
            .or_else(|| self.autocommit.get(&index).and_then(|hs| hs.first()))
            .cloned()
    }

    /// Remove and return every handle.
    pub fn drain(&mut self) -> Vec<HandleRef> {
        let mut handles = Vec::new();
        for pool in [&mut self.round, &mut self.autocommit] {
            for (_, mut list) in pool.drain() {
                handles.append(&mut list);
            }
        }
        handles
    }

    pub fn total(&self) -> usize {
        self.round.values().map(Vec::len).sum::<usize>()
            + self.autocommit.values().map(Vec::len).sum::<usize>()
    }

    /// Close a handle's connection, removing it from its pool. A handle
    /// absent from both pools is an orphan; log and close it anyway.
    pub async fn close_handle(&mut self, handle: &HandleRef) {
        if self.remove(handle.id()).is_none() {
            tracing::warn!(
                handle = %handle.id(),
                server = %handle.server_name(),
                "Closing orphaned handle not present in any pool"
            );
        }
        handle.driver().await.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerDescriptor;
    use crate::driver::{DriverFactory, MockDriverFactory};

    async fn open_handle(
        factory: &MockDriverFactory,
        index: usize,
        class: PoolClass,
        domain: &str,
    ) -> HandleRef {
        let server = ServerDescriptor::new(&format!("db{}", index + 1), 1);
        let domain = DatabaseDomain::from_id(domain);
        let driver = factory.open(index, &server, &domain).await.unwrap();
        Handle::new(index, server.name.clone(), class, driver)
    }

    #[tokio::test]
    async fn test_handle_appears_in_exactly_one_pool() {
        let factory = MockDriverFactory::new();
        let mut pool = ConnectionPool::new();

        let round = open_handle(&factory, 1, PoolClass::Round, "appdb").await;
        let auto = open_handle(&factory, 1, PoolClass::Autocommit, "appdb").await;
        pool.add(round.clone());
        pool.add(auto.clone());
        assert_eq!(pool.total(), 2);

        // Each class only ever sees its own handles
        let reused = pool
            .find_reusable(PoolClass::Round, 1, &DatabaseDomain::from_id("appdb"), false)
            .await
            .unwrap();
        assert_eq!(reused.id(), round.id());

        let reused = pool
            .find_reusable(PoolClass::Autocommit, 1, &DatabaseDomain::from_id("appdb"), false)
            .await
            .unwrap();
        assert_eq!(reused.id(), auto.id());

        pool.remove(round.id());
        assert!(!pool.contains(round.id()));
        assert!(pool.contains(auto.id()));
        assert_eq!(pool.total(), 1);
    }

    #[tokio::test]
    async fn test_reuse_respects_database_independence() {
        let factory = MockDriverFactory::new();
        let mut pool = ConnectionPool::new();

        let handle = open_handle(&factory, 1, PoolClass::Round, "appdb-x_").await;
        pool.add(handle.clone());

        let other_db = DatabaseDomain::from_id("otherdb-x_");

        // Shared-catalog engines can switch databases on a live connection
        let reused = pool
            .find_reusable(PoolClass::Round, 1, &other_db, false)
            .await;
        assert!(reused.is_some());

        // Independent catalogs force a fresh connection for a new dbname
        let reused = pool.find_reusable(PoolClass::Round, 1, &other_db, true).await;
        assert!(reused.is_none());

        // Same dbname with a different prefix stays shareable either way
        let same_db = DatabaseDomain::from_id("appdb-y_");
        let reused = pool.find_reusable(PoolClass::Round, 1, &same_db, true).await;
        assert!(reused.is_some());
    }

    #[tokio::test]
    async fn test_close_handle_removes_and_closes() {
        let factory = MockDriverFactory::new();
        let mut pool = ConnectionPool::new();

        let handle = open_handle(&factory, 0, PoolClass::Round, "appdb").await;
        pool.add(handle.clone());

        pool.close_handle(&handle).await;
        assert_eq!(pool.total(), 0);
        assert!(factory.last_control().closed());

        // Closing again hits the orphan path but still works
        pool.close_handle(&handle).await;
        assert_eq!(pool.total(), 0);
    }

    #[tokio::test]
    async fn test_round_flags_remember_prior_mode() {
        let factory = MockDriverFactory::new();
        let handle = open_handle(&factory, 0, PoolClass::Round, "appdb").await;
        let control = factory.last_control();

        assert!(!control.trx_mode());
        handle.apply_round_flags("r1").await;
        assert!(control.trx_mode());
        assert_eq!(handle.round_id().as_deref(), Some("r1"));

        // Re-applying the same round is a no-op
        handle.apply_round_flags("r1").await;

        handle.undo_round_flags().await;
        assert!(!control.trx_mode());
        assert!(handle.round_id().is_none());
    }

    #[tokio::test]
    async fn test_round_flags_skip_autocommit_handles() {
        let factory = MockDriverFactory::new();
        let handle = open_handle(&factory, 0, PoolClass::Autocommit, "appdb").await;
        let control = factory.last_control();

        handle.apply_round_flags("r1").await;
        assert!(!control.trx_mode());
        assert!(handle.round_id().is_none());
    }

    #[tokio::test]
    async fn test_drain_empties_both_pools() {
        let factory = MockDriverFactory::new();
        let mut pool = ConnectionPool::new();
        pool.add(open_handle(&factory, 0, PoolClass::Round, "appdb").await);
        pool.add(open_handle(&factory, 1, PoolClass::Round, "appdb").await);
        pool.add(open_handle(&factory, 1, PoolClass::Autocommit, "appdb").await);

        let drained = pool.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(pool.total(), 0);
        assert!(pool.drain().is_empty());
    }
}
