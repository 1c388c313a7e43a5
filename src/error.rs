use thiserror::Error;

use crate::round::RoundStage;

/// Result type for balancer operations.
pub type Result<T> = std::result::Result<T, BalancerError>;

/// Errors that can occur in the load balancer.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// Invalid configuration (empty server list, bad weights, unknown
    /// group combined with an explicit server index, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A driver connection could not be opened
    #[error("Could not connect to server '{server}': {source}")]
    Connection {
        server: String,
        #[source]
        source: crate::driver::DriverError,
    },

    /// The reader selection loop ran out of candidate replicas
    #[error("No reachable replica in query group '{group}'")]
    NoReachableReplica { group: String },

    /// A reused handle ended up on a domain incompatible with the request
    #[error("Domain mismatch on handle: expected '{expected}', found '{found}'")]
    DomainMismatch { expected: String, found: String },

    /// A round method was called in the wrong stage
    #[error("Round protocol violation during {operation}: expected stage {expected:?}, found {found:?}")]
    RoundProtocol {
        operation: &'static str,
        expected: RoundStage,
        found: RoundStage,
    },

    /// `begin` was called while a round was already active
    #[error("Transaction round '{round_id}' is already active")]
    RoundActive { round_id: String },

    /// An explicitly demarcated atomic section was still open at approve
    #[error("Explicit atomic section still open on server '{server}' at approve time")]
    AtomicSectionOpen { server: String },

    /// A driver operation failed mid-round
    #[error("Driver error on server '{server}': {source}")]
    Driver {
        server: String,
        #[source]
        source: crate::driver::DriverError,
    },

    /// The pending write time on a handle exceeded the approve budget
    #[error("Transaction write duration of {estimate:.3}s on server '{server}' exceeds the limit of {limit:.3}s")]
    WriteDurationExceeded {
        server: String,
        estimate: f64,
        limit: f64,
    },

    /// One or more per-handle commit failures during the en-masse commit
    #[error("Commit failed on {failed} of {total} servers: {diagnostics}")]
    CommitAggregate {
        failed: usize,
        total: usize,
        diagnostics: String,
    },

    /// A replication position was needed but could not be obtained
    #[error("Replication wait failed: {0}")]
    ReplicationWait(String),

    /// The balancer was disabled; all opens fail
    #[error("Connection access is disabled: {0}")]
    AccessDenied(String),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
