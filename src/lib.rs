//! Database cluster load balancing with transaction round coordination.
//!
//! This crate mediates every database handle acquisition for a cluster of
//! one writable primary and any number of read replicas:
//! - Picks readers per query group under weighted load, replication lag
//!   budgets, and session wait-for-position consistency
//! - Pools connections segregated by transaction-round participation,
//!   reusing handles across database-domain switches
//! - Coordinates a cluster-wide two-phase commit round over every writer
//!   handle: pre-commit callbacks to a fixpoint, budget checks, en-masse
//!   commit or rollback, then post-commit callbacks
//! - Escalates to logical read-only when replicas lag or the primary
//!   reports server-side read-only mode, cached through two tiers
//!
//! The SQL driver, load monitor, and caches are trait seams; mock
//! implementations ship in-crate for tests.
//!
//! # Example
//! ```ignore
//! use spindle::{Balancer, BalancerConfig, ConnFlags, DomainSpec, TargetServer};
//!
//! let mut balancer = Balancer::new(config, factory)?;
//!
//! // Reads go to a suitable replica, sticky for the session
//! let conn = balancer
//!     .get_connection(TargetServer::Replica, &[], DomainSpec::Local, ConnFlags::default())
//!     .await?;
//!
//! // Writes join the session-wide transaction round
//! balancer.begin_primary_changes("req-1").await?;
//! // ... writes on primary handles ...
//! balancer.finalize_primary_changes().await?;
//! balancer.approve_primary_changes(None).await?;
//! balancer.commit_primary_changes().await?;
//! balancer.run_idle_callbacks().await?;
//! ```

pub mod balancer;
pub mod cache;
pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod monitor;
pub mod pool;
pub mod position;
pub mod readonly;
pub mod round;

// Re-export commonly used types
pub use balancer::{Balancer, ConnFlags, ConnectionRef, TargetServer};
pub use cache::{InMemoryCache, KvCache};
pub use config::{BalancerConfig, ServerDescriptor, GENERIC_GROUP};
pub use domain::{DatabaseDomain, DomainSpec};
pub use driver::{
    DatabaseDriver, DriverAttributes, DriverError, DriverFactory, FlushMode, MockConnControl,
    MockDriver, MockDriverFactory, TransactionTrigger,
};
pub use error::{BalancerError, Result};
pub use monitor::{LoadMonitor, NullLoadMonitor, ReplicaLag, StaticLoadMonitor};
pub use pool::{Handle, HandleId, HandleRef, PoolClass};
pub use position::{PrimaryPosition, PositionTracker};
pub use round::RoundStage;
