//! Transaction round coordination.
//!
//! A round spans every round-class writer handle acquired during a
//! request: begin flags them all in, finalize drives pre-commit callbacks
//! to a fixpoint, approve enforces the write budget and liveness, commit
//! and rollback flush all peers together, and the idle-callback sweep
//! drains post-commit work before the round returns to rest.
//!
//! Every mutator parks the stage in [`RoundStage::Error`] before touching
//! any handle and only sets the target stage once the mutation completes,
//! so an interruption mid-mutation leaves the round observably failed and
//! recoverable only through rollback.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::{DriverError, FlushMode, TransactionTrigger};
use crate::error::{BalancerError, Result};
use crate::pool::HandleRef;

/// Stage of the current transaction round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoundStage {
    /// At rest; no round mutation in progress
    Cursory,
    /// Pre-commit callbacks ran and post-commit callbacks are suppressed
    Finalized,
    /// Budget and liveness checks passed; ready to commit
    Approved,
    /// Committed; idle callbacks pending
    CommitCallbacks,
    /// Rolled back; idle callbacks pending
    RollbackCallbacks,
    /// A mutation failed or was interrupted; rollback to recover
    Error,
}

/// Callback passes are bounded so mutually re-queueing callbacks surface
/// as an error instead of spinning forever.
const MAX_CALLBACK_PASSES: usize = 100;

/// State machine coordinating one transaction round across writer handles.
pub struct RoundCoordinator {
    stage: RoundStage,
    round_id: Option<String>,
}

impl Default for RoundCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundCoordinator {
    pub fn new() -> Self {
        Self {
            stage: RoundStage::Cursory,
            round_id: None,
        }
    }

    /// Resume a round persisted mid-callback-stage (e.g. a job runner
    /// picking up after the commit already happened).
    pub fn resume(stage: RoundStage) -> Result<Self> {
        match stage {
            RoundStage::CommitCallbacks | RoundStage::RollbackCallbacks => Ok(Self {
                stage,
                round_id: None,
            }),
            other => Err(BalancerError::Config(format!(
                "cannot resume a round in stage {other:?}; only the callback stages persist"
            ))),
        }
    }

    pub fn stage(&self) -> RoundStage {
        self.stage
    }

    pub fn round_id(&self) -> Option<&str> {
        self.round_id.as_deref()
    }

    fn expect_stage(&self, operation: &'static str, expected: RoundStage) -> Result<()> {
        if self.stage != expected {
            return Err(BalancerError::RoundProtocol {
                operation,
                expected,
                found: self.stage,
            });
        }
        Ok(())
    }

    fn driver_err(handle: &HandleRef, source: DriverError) -> BalancerError {
        BalancerError::Driver {
            server: handle.server_name().to_string(),
            source,
        }
    }

    /// Start a round over `handles`: flush empty snapshots so implicit
    /// reads don't leak into the round's view, then flag every handle in.
    #[tracing::instrument(skip(self, handles))]
    pub async fn begin(&mut self, round_id: &str, handles: &[HandleRef]) -> Result<()> {
        self.expect_stage("begin", RoundStage::Cursory)?;
        if let Some(active) = &self.round_id {
            return Err(BalancerError::RoundActive {
                round_id: active.clone(),
            });
        }

        self.stage = RoundStage::Error;
        for handle in handles {
            handle
                .driver()
                .await
                .flush_snapshot()
                .await
                .map_err(|e| Self::driver_err(handle, e))?;
            handle.apply_round_flags(round_id).await;
        }
        self.round_id = Some(round_id.to_string());
        self.stage = RoundStage::Cursory;
        tracing::debug!(round_id, handles = handles.len(), "Transaction round began");
        Ok(())
    }

    /// Run pre-commit callbacks across all handles until a full pass adds
    /// nothing new, then suppress post-commit callback execution.
    ///
    /// The fixpoint matters: a pre-commit callback on one handle may queue
    /// callbacks on another.
    pub async fn finalize(&mut self, handles: &[HandleRef]) -> Result<()> {
        self.expect_stage("finalize", RoundStage::Cursory)?;

        self.stage = RoundStage::Error;
        let mut passes = 0;
        loop {
            let mut ran = 0;
            for handle in handles {
                ran += handle
                    .driver()
                    .await
                    .run_pre_commit_callbacks()
                    .await
                    .map_err(|e| Self::driver_err(handle, e))?;
            }
            if ran == 0 {
                break;
            }
            passes += 1;
            if passes > MAX_CALLBACK_PASSES {
                return Err(anyhow::anyhow!(
                    "pre-commit callbacks kept queueing new work after {MAX_CALLBACK_PASSES} passes"
                )
                .into());
            }
        }

        for handle in handles {
            handle
                .driver()
                .await
                .suppress_post_commit_callbacks(true);
        }
        self.stage = RoundStage::Finalized;
        Ok(())
    }

    /// Final pre-commit checks: no open atomic sections, pending write
    /// time within budget, and connections with work still alive.
    pub async fn approve(
        &mut self,
        handles: &[HandleRef],
        max_write_duration: Option<Duration>,
    ) -> Result<()> {
        self.expect_stage("approve", RoundStage::Finalized)?;

        self.stage = RoundStage::Error;
        for handle in handles {
            let mut driver = handle.driver().await;
            if driver.explicit_trx_active() {
                return Err(BalancerError::AtomicSectionOpen {
                    server: handle.server_name().to_string(),
                });
            }

            let estimate = driver.pending_write_duration();
            if let Some(limit) = max_write_duration {
                if estimate > limit.as_secs_f64() {
                    return Err(BalancerError::WriteDurationExceeded {
                        server: handle.server_name().to_string(),
                        estimate,
                        limit: limit.as_secs_f64(),
                    });
                }
            }

            // A silently dropped connection must fail here, not half-way
            // through the en-masse commit
            if (driver.writes_pending() || driver.has_session_locks()) && !driver.ping().await {
                return Err(Self::driver_err(
                    handle,
                    DriverError::Connect("connection lost before commit".to_string()),
                ));
            }
        }
        self.stage = RoundStage::Approved;
        Ok(())
    }

    /// Commit every handle, flushing all peers together. Any failure
    /// leaves the round in `Error` with an aggregate diagnostic; the
    /// caller is expected to roll back.
    pub async fn commit(&mut self, handles: &[HandleRef]) -> Result<()> {
        self.expect_stage("commit", RoundStage::Approved)?;

        self.stage = RoundStage::Error;
        let mut failures: Vec<String> = Vec::new();
        for handle in handles {
            if let Err(e) = handle.driver().await.commit(FlushMode::AllPeers).await {
                tracing::warn!(
                    server = %handle.server_name(),
                    error = %e,
                    "Commit failed on round participant"
                );
                failures.push(format!("{}: {}", handle.server_name(), e));
            }
        }
        if !failures.is_empty() {
            return Err(BalancerError::CommitAggregate {
                failed: failures.len(),
                total: handles.len(),
                diagnostics: failures.join("; "),
            });
        }

        for handle in handles {
            handle.undo_round_flags().await;
        }
        self.stage = RoundStage::CommitCallbacks;
        tracing::debug!(handles = handles.len(), "Transaction round committed");
        Ok(())
    }

    /// Roll back every handle unconditionally. Callable from any stage;
    /// per-handle errors are logged and the first returned, but the
    /// transition to `RollbackCallbacks` always happens.
    pub async fn rollback(&mut self, handles: &[HandleRef]) -> Result<()> {
        self.stage = RoundStage::Error;
        let mut first: Option<BalancerError> = None;
        for handle in handles {
            if let Err(e) = handle.driver().await.rollback(FlushMode::AllPeers).await {
                tracing::warn!(
                    server = %handle.server_name(),
                    error = %e,
                    "Rollback failed on round participant"
                );
                if first.is_none() {
                    first = Some(Self::driver_err(handle, e));
                }
            }
            handle.undo_round_flags().await;
        }
        self.round_id = None;
        self.stage = RoundStage::RollbackCallbacks;
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drain post-commit/rollback callbacks, then run transaction
    /// listeners, then return the round to rest.
    ///
    /// Callback errors are accumulated and the first is returned after
    /// the sweep completes; they never abort it.
    pub async fn run_idle_callbacks(&mut self, handles: &[HandleRef]) -> Result<()> {
        let trigger = match self.stage {
            RoundStage::CommitCallbacks => TransactionTrigger::Commit,
            RoundStage::RollbackCallbacks => TransactionTrigger::Rollback,
            found => {
                return Err(BalancerError::RoundProtocol {
                    operation: "run_idle_callbacks",
                    expected: RoundStage::CommitCallbacks,
                    found,
                })
            }
        };

        self.stage = RoundStage::Error;
        for handle in handles {
            handle
                .driver()
                .await
                .suppress_post_commit_callbacks(false);
        }

        let mut first: Option<BalancerError> = None;
        let mut passes = 0;
        loop {
            let mut ran = 0;
            for handle in handles {
                let mut driver = handle.driver().await;
                if driver.trx_level() == 0 {
                    let sweep = driver.run_idle_callbacks().await;
                    ran += sweep.ran;
                    if let Some(e) = sweep.first_error {
                        if first.is_none() {
                            first = Some(Self::driver_err(handle, e));
                        }
                    }
                }
            }

            // Callbacks may have opened fresh empty transactions; flush
            // them so the next pass sees idle connections again
            for handle in handles {
                let mut driver = handle.driver().await;
                if driver.trx_level() > 0 && !driver.writes_pending() {
                    if let Err(e) = driver.commit(FlushMode::AllPeers).await {
                        if first.is_none() {
                            first = Some(Self::driver_err(handle, e));
                        }
                    }
                }
            }

            if ran == 0 {
                break;
            }
            passes += 1;
            if passes > MAX_CALLBACK_PASSES {
                if first.is_none() {
                    first = Some(
                        anyhow::anyhow!(
                            "idle callbacks kept queueing new work after {MAX_CALLBACK_PASSES} passes"
                        )
                        .into(),
                    );
                }
                break;
            }
        }

        for handle in handles {
            let sweep = handle.driver().await.run_listener_callbacks(trigger).await;
            if let Some(e) = sweep.first_error {
                if first.is_none() {
                    first = Some(Self::driver_err(handle, e));
                }
            }
        }

        self.round_id = None;
        self.stage = RoundStage::Cursory;
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flush empty implicit snapshots outside a round.
    pub async fn flush_snapshots(&mut self, handles: &[HandleRef]) -> Result<()> {
        self.expect_stage("flush_snapshots", RoundStage::Cursory)?;

        self.stage = RoundStage::Error;
        for handle in handles {
            handle
                .driver()
                .await
                .flush_snapshot()
                .await
                .map_err(|e| Self::driver_err(handle, e))?;
        }
        self.stage = RoundStage::Cursory;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerDescriptor;
    use crate::domain::DatabaseDomain;
    use crate::driver::{DriverFactory, MockConnControl, MockDriverFactory};
    use crate::pool::{Handle, PoolClass};

    async fn writer_handle(factory: &MockDriverFactory) -> (HandleRef, MockConnControl) {
        let server = ServerDescriptor::new("db1", 0);
        let domain = DatabaseDomain::from_id("appdb");
        let driver = factory.open(0, &server, &domain).await.unwrap();
        let handle = Handle::new(0, server.name.clone(), PoolClass::Round, driver);
        (handle, factory.last_control())
    }

    #[tokio::test]
    async fn test_begin_flags_handles_and_flushes_snapshots() {
        let factory = MockDriverFactory::new();
        let (h1, c1) = writer_handle(&factory).await;
        let (h2, c2) = writer_handle(&factory).await;
        let handles = vec![h1.clone(), h2.clone()];

        let mut round = RoundCoordinator::new();
        round.begin("r1", &handles).await.unwrap();

        assert_eq!(round.stage(), RoundStage::Cursory);
        assert_eq!(round.round_id(), Some("r1"));
        for control in [&c1, &c2] {
            assert!(control.ops().contains(&"flush_snapshot".to_string()));
            assert!(control.trx_mode());
        }
        assert_eq!(h1.round_id().as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_double_begin_is_rejected() {
        let factory = MockDriverFactory::new();
        let (h1, _) = writer_handle(&factory).await;
        let handles = vec![h1];

        let mut round = RoundCoordinator::new();
        round.begin("r1", &handles).await.unwrap();
        let err = round.begin("r2", &handles).await.unwrap_err();
        assert!(matches!(err, BalancerError::RoundActive { .. }));
    }

    #[tokio::test]
    async fn test_finalize_runs_cross_handle_callbacks_to_fixpoint() {
        let factory = MockDriverFactory::new();
        let (h1, c1) = writer_handle(&factory).await;
        let (h2, c2) = writer_handle(&factory).await;
        let handles = vec![h1, h2];

        let mut round = RoundCoordinator::new();
        round.begin("r1", &handles).await.unwrap();

        // A pre-commit callback on h1 queues a write callback on h2, which
        // in turn queues one more on h2. All must run before finalize
        // returns.
        let peer = c2.clone();
        c1.queue_pre_commit(move || {
            let again = peer.clone();
            peer.queue_pre_commit(move || {
                again.queue_pre_commit(|| Ok(()));
                Ok(())
            });
            Ok(())
        });

        round.finalize(&handles).await.unwrap();
        assert_eq!(round.stage(), RoundStage::Finalized);

        // Post-commit callbacks are suppressed through the window
        assert!(c1.post_commit_suppressed());
        assert!(c2.post_commit_suppressed());
    }

    #[tokio::test]
    async fn test_approve_rejects_open_atomic_section() {
        let factory = MockDriverFactory::new();
        let (h1, c1) = writer_handle(&factory).await;
        let handles = vec![h1];

        let mut round = RoundCoordinator::new();
        round.begin("r1", &handles).await.unwrap();
        round.finalize(&handles).await.unwrap();

        c1.set_explicit_trx(true);
        let err = round.approve(&handles, None).await.unwrap_err();
        assert!(matches!(err, BalancerError::AtomicSectionOpen { .. }));
        assert_eq!(round.stage(), RoundStage::Error);
    }

    #[tokio::test]
    async fn test_approve_enforces_write_duration_budget() {
        let factory = MockDriverFactory::new();
        let (h1, c1) = writer_handle(&factory).await;
        let handles = vec![h1];

        let mut round = RoundCoordinator::new();
        round.begin("r1", &handles).await.unwrap();
        round.finalize(&handles).await.unwrap();

        c1.set_writes_pending(true);
        c1.set_write_duration(7.0);
        let err = round
            .approve(&handles, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::WriteDurationExceeded { .. }));
        assert_eq!(round.stage(), RoundStage::Error);

        // Rollback is the only way out
        round.rollback(&handles).await.unwrap();
        assert_eq!(round.stage(), RoundStage::RollbackCallbacks);
    }

    #[tokio::test]
    async fn test_approve_pings_handles_with_pending_work() {
        let factory = MockDriverFactory::new();
        let (h1, c1) = writer_handle(&factory).await;
        let handles = vec![h1];

        let mut round = RoundCoordinator::new();
        round.begin("r1", &handles).await.unwrap();
        round.finalize(&handles).await.unwrap();

        c1.set_session_locks(true);
        c1.set_ping_ok(false);
        let err = round.approve(&handles, None).await.unwrap_err();
        assert!(matches!(err, BalancerError::Driver { .. }));
        assert!(c1.ops().contains(&"ping".to_string()));
    }

    #[tokio::test]
    async fn test_commit_success_lands_in_commit_callbacks() {
        let factory = MockDriverFactory::new();
        let (h1, c1) = writer_handle(&factory).await;
        let (h2, c2) = writer_handle(&factory).await;
        let handles = vec![h1.clone(), h2];

        let mut round = RoundCoordinator::new();
        round.begin("r1", &handles).await.unwrap();
        c1.set_writes_pending(true);
        c2.set_writes_pending(true);
        round.finalize(&handles).await.unwrap();
        round
            .approve(&handles, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        round.commit(&handles).await.unwrap();

        assert_eq!(round.stage(), RoundStage::CommitCallbacks);
        for control in [&c1, &c2] {
            assert!(control.ops().contains(&"commit:all-peers".to_string()));
            // Round flags are undone after a successful commit
            assert!(!control.trx_mode());
        }
    }

    #[tokio::test]
    async fn test_commit_failure_aggregates_and_requires_rollback() {
        let factory = MockDriverFactory::new();
        let (h1, _c1) = writer_handle(&factory).await;
        let (h2, c2) = writer_handle(&factory).await;
        let handles = vec![h1, h2];

        let mut round = RoundCoordinator::new();
        round.begin("r1", &handles).await.unwrap();
        round.finalize(&handles).await.unwrap();
        round.approve(&handles, None).await.unwrap();

        c2.set_fail_commit(Some("deadlock detected"));
        let err = round.commit(&handles).await.unwrap_err();
        match err {
            BalancerError::CommitAggregate {
                failed,
                total,
                diagnostics,
            } => {
                assert_eq!(failed, 1);
                assert_eq!(total, 2);
                assert!(diagnostics.contains("deadlock detected"));
            }
            other => panic!("expected CommitAggregate, got {other:?}"),
        }
        assert_eq!(round.stage(), RoundStage::Error);

        round.rollback(&handles).await.unwrap();
        assert_eq!(round.stage(), RoundStage::RollbackCallbacks);
        assert!(c2.ops().contains(&"rollback:all-peers".to_string()));
    }

    #[tokio::test]
    async fn test_idle_callbacks_drain_and_commit_new_empty_transactions() {
        let factory = MockDriverFactory::new();
        let (h1, c1) = writer_handle(&factory).await;
        let handles = vec![h1];

        let mut round = RoundCoordinator::new();
        round.begin("r1", &handles).await.unwrap();
        round.finalize(&handles).await.unwrap();
        round.approve(&handles, None).await.unwrap();
        round.commit(&handles).await.unwrap();

        // An idle callback that opens a fresh empty transaction and queues
        // a follow-up
        let reopen = c1.clone();
        c1.queue_idle(move || {
            reopen.set_trx_level(1);
            reopen.queue_idle(|| Ok(()));
            Ok(())
        });

        round.run_idle_callbacks(&handles).await.unwrap();
        assert_eq!(round.stage(), RoundStage::Cursory);
        assert_eq!(round.round_id(), None);
        assert_eq!(c1.trx_level(), 0);
        assert!(!c1.post_commit_suppressed());
        assert!(c1.ops().contains(&"listeners:commit".to_string()));
    }

    #[tokio::test]
    async fn test_idle_callback_errors_are_returned_but_do_not_abort() {
        let factory = MockDriverFactory::new();
        let (h1, c1) = writer_handle(&factory).await;
        let handles = vec![h1];

        let mut round = RoundCoordinator::new();
        round.begin("r1", &handles).await.unwrap();
        round.finalize(&handles).await.unwrap();
        round.approve(&handles, None).await.unwrap();
        round.commit(&handles).await.unwrap();

        c1.queue_idle(|| Err(DriverError::Query("purge failed".to_string())));
        c1.queue_idle(|| Ok(()));
        c1.add_listener("stats", None);

        let err = round.run_idle_callbacks(&handles).await.unwrap_err();
        assert!(err.to_string().contains("purge failed"));
        // The sweep still completed: listeners ran and the round is at rest
        assert_eq!(round.stage(), RoundStage::Cursory);
        assert!(c1.ops().contains(&"listeners:commit".to_string()));
    }

    #[tokio::test]
    async fn test_rollback_listener_trigger() {
        let factory = MockDriverFactory::new();
        let (h1, c1) = writer_handle(&factory).await;
        let handles = vec![h1];

        let mut round = RoundCoordinator::new();
        round.begin("r1", &handles).await.unwrap();
        round.rollback(&handles).await.unwrap();
        round.run_idle_callbacks(&handles).await.unwrap();

        assert!(c1.ops().contains(&"listeners:rollback".to_string()));
        assert_eq!(round.stage(), RoundStage::Cursory);
    }

    #[tokio::test]
    async fn test_wrong_stage_calls_are_protocol_errors() {
        let factory = MockDriverFactory::new();
        let (h1, _) = writer_handle(&factory).await;
        let handles = vec![h1];

        let mut round = RoundCoordinator::new();

        let err = round.approve(&handles, None).await.unwrap_err();
        assert!(matches!(err, BalancerError::RoundProtocol { .. }));

        let err = round.commit(&handles).await.unwrap_err();
        assert!(matches!(err, BalancerError::RoundProtocol { .. }));

        let err = round.run_idle_callbacks(&handles).await.unwrap_err();
        assert!(matches!(err, BalancerError::RoundProtocol { .. }));
    }

    #[test]
    fn test_resume_only_allows_callback_stages() {
        assert!(RoundCoordinator::resume(RoundStage::CommitCallbacks).is_ok());
        assert!(RoundCoordinator::resume(RoundStage::RollbackCallbacks).is_ok());
        assert!(RoundCoordinator::resume(RoundStage::Approved).is_err());
        assert!(RoundCoordinator::resume(RoundStage::Cursory).is_err());
    }

    #[tokio::test]
    async fn test_flush_snapshots_outside_round() {
        let factory = MockDriverFactory::new();
        let (h1, c1) = writer_handle(&factory).await;
        let handles = vec![h1];

        let mut round = RoundCoordinator::new();
        round.flush_snapshots(&handles).await.unwrap();
        assert_eq!(round.stage(), RoundStage::Cursory);
        assert!(c1.ops().contains(&"flush_snapshot".to_string()));
    }
}
