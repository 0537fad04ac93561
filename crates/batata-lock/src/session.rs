//! Scoped lock acquisition
//!
//! `LockSession::using` acquires a quorum lock, runs the caller's action
//! under a lease watchdog and releases the lock on every exit path: normal
//! return, error, panic, or the `using` future being dropped by its caller.

use std::future::Future;

use tokio::time::Instant;
use tracing::{debug, warn};

use batata_common::{BatataError, lock_key};

use crate::coordinator::QuorumLockCoordinator;
use crate::extender::LeaseExtender;
use crate::model::{CancellationSignal, ExpirationOrConfig, LockSessionState};
use crate::observer::FailureReason;

/// Public entry point for running critical sections under a quorum lock
#[derive(Clone)]
pub struct LockSession {
    coordinator: QuorumLockCoordinator,
}

impl LockSession {
    pub fn new(coordinator: QuorumLockCoordinator) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &QuorumLockCoordinator {
        &self.coordinator
    }

    /// Run `action` while holding `lock_type:key`.
    ///
    /// `expiration` is either a bare expiration in milliseconds (100 retries,
    /// one hundredth of the expiration between rounds) or a full
    /// `LockConfiguration`.
    ///
    /// Fails with `BatataError::LockTimeout` if quorum is not reached within
    /// the retry/time budget. Otherwise the action's result is returned
    /// unchanged, errors included. The release is started before returning
    /// but not awaited, so a slow store never delays the result.
    ///
    /// The action receives a `CancellationSignal` that the watchdog raises on
    /// every extension cycle and when it gives up extending. The signal is
    /// advisory: the action is never interrupted and may outlive its lease if
    /// it ignores the signal.
    pub async fn using<T, E, F, Fut>(
        &self,
        lock_type: &str,
        key: &str,
        expiration: impl Into<ExpirationOrConfig>,
        action: F,
    ) -> Result<T, E>
    where
        F: FnOnce(CancellationSignal) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<BatataError>,
    {
        let config = expiration.into().into_configuration()?;
        let mut lease = ScopedLease::new(self.coordinator.clone(), lock_type, key);

        if !self.coordinator.lock(lock_type, key, &config).await {
            lease.transition(LockSessionState::Failed);
            return Err(BatataError::LockTimeout(lease.lock_key.clone()).into());
        }

        let signal = CancellationSignal::new();
        let extender = LeaseExtender::start(
            self.coordinator.clone(),
            lock_type,
            &lease.lock_key,
            &config,
            signal.clone(),
        );
        lease.hold(extender);

        let result = action(signal).await;

        lease.release();
        result
    }
}

/// Per-invocation lock state.
///
/// If dropped while `Held` (panic in the action, or the `using` future was
/// dropped) it stops the watchdog and hands the release to the runtime.
struct ScopedLease {
    coordinator: QuorumLockCoordinator,
    lock_type: String,
    lock_key: String,
    state: LockSessionState,
    extender: Option<LeaseExtender>,
    held_since: Option<Instant>,
}

impl ScopedLease {
    fn new(coordinator: QuorumLockCoordinator, lock_type: &str, key: &str) -> Self {
        let lease = Self {
            coordinator,
            lock_type: lock_type.to_string(),
            lock_key: lock_key(lock_type, key),
            state: LockSessionState::Acquiring,
            extender: None,
            held_since: None,
        };
        debug!(lock_key = %lease.lock_key, state = %lease.state, "Lock session started");
        lease
    }

    fn transition(&mut self, state: LockSessionState) {
        debug!(
            lock_key = %self.lock_key,
            from = %self.state,
            to = %state,
            "Lock session state changed"
        );
        self.state = state;
    }

    fn hold(&mut self, extender: LeaseExtender) {
        self.extender = Some(extender);
        self.held_since = Some(Instant::now());
        self.transition(LockSessionState::Held);
    }

    /// Stop the watchdog and release on every store without waiting for it
    fn release(mut self) {
        self.begin_release();
    }

    /// Move from `Held` to `Releasing`: stop the watchdog, record the held
    /// duration and spawn the release.
    ///
    /// The release task reports its own outcome; failures are logged and
    /// counted, never propagated to the caller.
    fn begin_release(&mut self) {
        if self.state != LockSessionState::Held {
            return;
        }
        self.transition(LockSessionState::Releasing);

        if let Some(extender) = self.extender.take() {
            extender.stop();
        }
        if let Some(held_since) = self.held_since.take() {
            self.coordinator
                .observer()
                .record_held_duration(&self.lock_type, held_since.elapsed());
        }

        let coordinator = self.coordinator.clone();
        let lock_type = self.lock_type.clone();
        let lock_key = self.lock_key.clone();
        tokio::spawn(async move {
            let stores = coordinator.store_count();
            let confirmed = coordinator.release_counted(&lock_key).await;
            if confirmed < stores {
                coordinator
                    .observer()
                    .increment_failure(&lock_type, FailureReason::ReleaseFailed);
                warn!(
                    lock_key = %lock_key,
                    confirmed,
                    stores,
                    "Lock release not confirmed by every store"
                );
            }
        });
    }
}

impl Drop for ScopedLease {
    fn drop(&mut self) {
        if self.state != LockSessionState::Held {
            return;
        }
        warn!(
            lock_key = %self.lock_key,
            "Lock session dropped while held, releasing in background"
        );
        if tokio::runtime::Handle::try_current().is_err() {
            // No runtime left to release on; the lease expires on its own
            if let Some(extender) = self.extender.take() {
                extender.stop();
            }
            return;
        }
        self.begin_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::model::LockConfiguration;
    use crate::store::{LockStore, LockStoreRef, MemoryLockStore};

    fn session_over(stores: &[Arc<MemoryLockStore>]) -> LockSession {
        let refs: Vec<LockStoreRef> = stores
            .iter()
            .map(|s| s.clone() as Arc<dyn LockStore>)
            .collect();
        LockSession::new(QuorumLockCoordinator::new(refs).unwrap())
    }

    fn memory_stores(n: usize) -> Vec<Arc<MemoryLockStore>> {
        (0..n).map(|_| Arc::new(MemoryLockStore::new())).collect()
    }

    /// Let spawned release tasks run
    async fn run_background_tasks() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_using_returns_action_result_and_releases() {
        let stores = memory_stores(3);
        let session = session_over(&stores);

        let held = stores.clone();
        let value: Result<u32, BatataError> = session
            .using("job", "sum", 30000u64, |_signal| async move {
                assert!(held.iter().any(|s| s.get("job:sum").is_some()));
                Ok(42)
            })
            .await;

        assert_eq!(value.unwrap(), 42);
        run_background_tasks().await;
        for store in &stores {
            assert!(store.get("job:sum").is_none());
        }
    }

    #[tokio::test]
    async fn test_using_propagates_action_error_and_releases() {
        #[derive(Debug)]
        enum JobError {
            Lock(BatataError),
            Failed(&'static str),
        }
        impl From<BatataError> for JobError {
            fn from(e: BatataError) -> Self {
                JobError::Lock(e)
            }
        }

        let stores = memory_stores(3);
        let session = session_over(&stores);

        let result: Result<(), JobError> = session
            .using("job", "err", 30000u64, |_signal| async {
                Err(JobError::Failed("boom"))
            })
            .await;

        assert!(matches!(result, Err(JobError::Failed("boom"))));
        run_background_tasks().await;
        for store in &stores {
            assert!(store.get("job:err").is_none());
        }
    }

    #[tokio::test]
    async fn test_using_fails_with_lock_timeout() {
        let stores = memory_stores(3);
        for store in &stores {
            store.set_if_absent("job:busy", "other", 60000).await.unwrap();
        }
        let session = session_over(&stores);
        let config = LockConfiguration::new(1000)
            .unwrap()
            .with_max_retries(2)
            .with_retry_interval_ms(1);

        let mut ran = false;
        let result: Result<(), BatataError> = session
            .using("job", "busy", config, |_signal| {
                ran = true;
                async { Ok(()) }
            })
            .await;

        assert!(!ran);
        match result {
            Err(BatataError::LockTimeout(key)) => assert_eq!(key, "job:busy"),
            other => panic!("expected lock timeout, got {:?}", other),
        }
        // Holder's keys are untouched
        for store in &stores {
            assert_eq!(store.get("job:busy").as_deref(), Some("other"));
        }
    }

    #[tokio::test]
    async fn test_using_rejects_invalid_configuration() {
        let stores = memory_stores(1);
        let session = session_over(&stores);

        let result: Result<(), BatataError> = session
            .using("job", "bad", 0u64, |_signal| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(BatataError::IllegalArgument(_))));
    }

    #[tokio::test]
    async fn test_dropped_session_releases_in_background() {
        let stores = memory_stores(3);
        let session = session_over(&stores);

        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let task_session = session.clone();
        let handle = tokio::spawn(async move {
            let _: Result<(), BatataError> = task_session
                .using("job", "hang", 30000u64, |_signal| async move {
                    let _ = entered_tx.send(());
                    std::future::pending::<()>().await;
                    Ok(())
                })
                .await;
        });

        entered_rx.await.unwrap();
        assert!(stores.iter().any(|s| s.get("job:hang").is_some()));

        handle.abort();
        let _ = handle.await;
        run_background_tasks().await;
        for store in &stores {
            assert!(store.get("job:hang").is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_raised_during_long_action() {
        let stores = memory_stores(3);
        let session = session_over(&stores);

        let result: Result<bool, BatataError> = session
            .using("job", "long", 100u64, |signal| async move {
                assert!(!signal.is_aborted());
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(signal.is_aborted())
            })
            .await;

        assert!(result.unwrap());
        assert_eq!(session.coordinator().stats().extensions, 1);
    }
}
