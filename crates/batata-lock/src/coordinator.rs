//! Quorum Lock Coordinator
//!
//! Fans every acquisition round out to all N stores concurrently and resolves
//! it as soon as the outcome is decided:
//! - success once `floor(N/2) + 1` stores granted the key
//! - failure once enough stores refused that quorum is unreachable
//!
//! A failed round deletes the key from the stores that did grant it, sleeps,
//! and retries until the retry count or the key expiration runs out.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use batata_common::{BatataError, BatataResult, lock_key};

use crate::model::{AcquiredLock, LockAttempt, LockConfiguration};
use crate::observer::{FailureReason, LockObserver, MetricsLockObserver};
use crate::store::LockStoreRef;

/// Default bound on a single store call
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-coordinator options
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Log rounds and extensions at `info` instead of `debug`
    pub verbose: bool,
    /// Bound on each individual store call; a timed out call counts as a failure
    pub store_timeout: Duration,
    /// Value written by set-if-absent
    pub lock_value: String,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            lock_value: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Lock statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    /// Successful `lock` calls
    pub acquisitions: u64,
    /// `lock` calls that ran out of retries or time
    pub failed_acquisitions: u64,
    /// Acquisition rounds issued
    pub rounds: u64,
    /// Rounds issued after a failed round
    pub retries: u64,
    /// Failed rounds whose minority grants were deleted
    pub rollbacks: u64,
    pub releases: u64,
    /// Lease extension cycles started by watchdogs
    pub extensions: u64,
    /// Watchdogs that stopped at the extension ceiling
    pub extension_timeouts: u64,
}

#[derive(Default)]
pub(crate) struct LockStatsCollector {
    acquisitions: AtomicU64,
    failed_acquisitions: AtomicU64,
    rounds: AtomicU64,
    retries: AtomicU64,
    rollbacks: AtomicU64,
    releases: AtomicU64,
    pub(crate) extensions: AtomicU64,
    pub(crate) extension_timeouts: AtomicU64,
}

impl LockStatsCollector {
    fn snapshot(&self) -> LockStats {
        LockStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            failed_acquisitions: self.failed_acquisitions.load(Ordering::Relaxed),
            rounds: self.rounds.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            extensions: self.extensions.load(Ordering::Relaxed),
            extension_timeouts: self.extension_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// How one acquisition round settled
#[derive(Debug, Clone, PartialEq, Eq)]
enum RoundOutcome {
    Acquired(AcquiredLock),
    /// Quorum unreachable; `granted` lists stores to roll back
    Failed { granted: Vec<usize> },
}

/// Store calls of one acquisition round still being tallied.
///
/// Dropped before it settles (the `lock` future was cancelled), it hands the
/// grants so far and the calls still in flight to a background rollback.
struct RoundInFlight {
    coordinator: QuorumLockCoordinator,
    lock_key: String,
    pending: FuturesUnordered<JoinHandle<LockAttempt>>,
    granted: Vec<usize>,
    settled: bool,
}

impl RoundInFlight {
    fn settle(&mut self) -> Vec<usize> {
        self.settled = true;
        std::mem::take(&mut self.granted)
    }
}

impl Drop for RoundInFlight {
    fn drop(&mut self) {
        if self.settled || (self.granted.is_empty() && self.pending.is_empty()) {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        warn!(
            lock_key = %self.lock_key,
            granted = ?self.granted,
            in_flight = self.pending.len(),
            "Lock round abandoned, rolling back grants in background"
        );
        let granted = std::mem::take(&mut self.granted);
        let pending = std::mem::take(&mut self.pending);
        self.coordinator
            .drain_late_grants(&self.lock_key, granted, pending);
    }
}

struct CoordinatorInner {
    stores: Vec<LockStoreRef>,
    options: CoordinatorOptions,
    observer: Arc<dyn LockObserver>,
    stats: LockStatsCollector,
}

/// Quorum-based lock coordinator over N independent stores.
///
/// Cheap to clone; clones share stores, options and statistics.
#[derive(Clone)]
pub struct QuorumLockCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl QuorumLockCoordinator {
    /// Coordinator with default options publishing to the `metrics` facade
    pub fn new(stores: Vec<LockStoreRef>) -> BatataResult<Self> {
        Self::with_config(
            stores,
            CoordinatorOptions::default(),
            Arc::new(MetricsLockObserver),
        )
    }

    pub fn with_config(
        stores: Vec<LockStoreRef>,
        options: CoordinatorOptions,
        observer: Arc<dyn LockObserver>,
    ) -> BatataResult<Self> {
        if stores.is_empty() {
            return Err(BatataError::IllegalArgument(
                "at least one lock store is required".to_string(),
            ));
        }

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                stores,
                options,
                observer,
                stats: LockStatsCollector::default(),
            }),
        })
    }

    pub fn store_count(&self) -> usize {
        self.inner.stores.len()
    }

    /// Minimum number of granting stores: `floor(N/2) + 1`
    pub fn quorum(&self) -> usize {
        quorum_of(self.store_count())
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.inner.options
    }

    pub fn stats(&self) -> LockStats {
        self.inner.stats.snapshot()
    }

    pub(crate) fn observer(&self) -> &Arc<dyn LockObserver> {
        &self.inner.observer
    }

    pub(crate) fn stats_collector(&self) -> &LockStatsCollector {
        &self.inner.stats
    }

    /// Acquire `lock_type:key` on a quorum of stores.
    ///
    /// Gives up and returns `false` after `max_retries` retries or once
    /// `key_expiration_ms` has elapsed since the first round, whichever comes
    /// first. A lock worth holding for one expiration is useless if it took
    /// longer than that to get.
    pub async fn lock(&self, lock_type: &str, key: &str, config: &LockConfiguration) -> bool {
        let lock_key = lock_key(lock_type, key);
        if let Err(e) = config.validate() {
            warn!(lock_key = %lock_key, error = %e, "Rejected lock configuration");
            return false;
        }

        let stats = &self.inner.stats;
        let started = Instant::now();
        let mut rounds: u32 = 0;

        loop {
            rounds = rounds.saturating_add(1);
            let retries = rounds - 1;
            stats.rounds.fetch_add(1, Ordering::Relaxed);
            match self.acquire_round(&lock_key, config.key_expiration_ms).await {
                RoundOutcome::Acquired(acquired) => {
                    stats.acquisitions.fetch_add(1, Ordering::Relaxed);
                    verbose_log!(
                        self.inner.options.verbose,
                        lock_key = %lock_key,
                        stores = ?acquired.store_indices,
                        retries,
                        "Lock acquired"
                    );
                    if retries > 0 {
                        let elapsed = started.elapsed();
                        self.inner
                            .observer
                            .record_acquire_duration(lock_type, elapsed);
                        info!(
                            lock_key = %lock_key,
                            retries,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Lock acquired after {} retries",
                            retries
                        );
                    }
                    return true;
                }
                RoundOutcome::Failed { granted } => {
                    verbose_log!(
                        self.inner.options.verbose,
                        lock_key = %lock_key,
                        granted = ?granted,
                        retries,
                        "Lock round failed"
                    );
                    if !granted.is_empty() {
                        stats.rollbacks.fetch_add(1, Ordering::Relaxed);
                        // Runs on its own task so a caller dropping `lock`
                        // mid-rollback does not leave the grants behind
                        let coordinator = self.clone();
                        let rollback_key = lock_key.clone();
                        let _ = tokio::spawn(async move {
                            coordinator.delete_on(&rollback_key, &granted).await
                        })
                        .await;
                    }
                }
            }

            if retries >= config.max_retries || started.elapsed() >= config.key_expiration() {
                break;
            }

            stats.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(config.retry_interval()).await;

            if started.elapsed() >= config.key_expiration() {
                break;
            }
        }

        stats.failed_acquisitions.fetch_add(1, Ordering::Relaxed);
        self.inner
            .observer
            .increment_failure(lock_type, FailureReason::AcquireTimeout);
        warn!(
            lock_key = %lock_key,
            rounds,
            retries = rounds - 1,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Failed to acquire lock"
        );
        false
    }

    /// Delete `lock_key` on every store.
    ///
    /// Targets all N stores, not only the ones known to have granted the key:
    /// a successful round stops listening before every store has answered, so
    /// the exact holder set is never known. Errors are logged and swallowed.
    pub async fn release(&self, lock_key: &str) {
        self.release_counted(lock_key).await;
    }

    /// Release on every store, returning how many confirmed the delete
    pub(crate) async fn release_counted(&self, lock_key: &str) -> usize {
        self.inner.stats.releases.fetch_add(1, Ordering::Relaxed);
        let all: Vec<usize> = (0..self.store_count()).collect();
        let confirmed = self.delete_on(lock_key, &all).await;
        verbose_log!(
            self.inner.options.verbose,
            lock_key = %lock_key,
            confirmed,
            "Lock released"
        );
        confirmed
    }

    /// Refresh the TTL of `lock_key` on every store (best-effort)
    pub async fn extend(&self, lock_key: &str, ttl_ms: u64) {
        let timeout = self.inner.options.store_timeout;
        let refreshes = self
            .inner
            .stores
            .iter()
            .enumerate()
            .map(|(index, store)| async move {
                match tokio::time::timeout(timeout, store.refresh_ttl(lock_key, ttl_ms)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        debug!(lock_key = %lock_key, store = index, error = %e, "Lock refresh failed");
                        false
                    }
                    Err(_) => {
                        debug!(lock_key = %lock_key, store = index, "Lock refresh timed out");
                        false
                    }
                }
            });

        let refreshed = join_all(refreshes).await.into_iter().filter(|ok| *ok).count();
        if refreshed < self.quorum() {
            warn!(
                lock_key = %lock_key,
                refreshed,
                quorum = self.quorum(),
                "Lock refresh confirmed by less than a quorum of stores"
            );
        }
    }

    /// Run one set-if-absent round against every store.
    ///
    /// Each store call runs in its own task. Once the outcome is decided the
    /// remaining tasks are detached and still run to completion. After a
    /// successful round their results are ignored; after a failed round any
    /// late grant is deleted in the background. If the round itself is
    /// dropped before it settles, grants so far and late grants are deleted
    /// the same way.
    async fn acquire_round(&self, lock_key: &str, ttl_ms: u64) -> RoundOutcome {
        let total = self.store_count();
        let quorum = self.quorum();
        let timeout = self.inner.options.store_timeout;

        let pending: FuturesUnordered<JoinHandle<LockAttempt>> = self
            .inner
            .stores
            .iter()
            .enumerate()
            .map(|(store_index, store)| {
                let store = store.clone();
                let lock_key = lock_key.to_string();
                let value = self.inner.options.lock_value.clone();
                tokio::spawn(async move {
                    let succeeded = match tokio::time::timeout(
                        timeout,
                        store.set_if_absent(&lock_key, &value, ttl_ms),
                    )
                    .await
                    {
                        Ok(Ok(granted)) => granted,
                        Ok(Err(e)) => {
                            debug!(lock_key = %lock_key, store = store_index, error = %e, "Lock store error");
                            false
                        }
                        Err(_) => {
                            debug!(lock_key = %lock_key, store = store_index, "Lock store call timed out");
                            false
                        }
                    };
                    LockAttempt {
                        store_index,
                        succeeded,
                    }
                })
            })
            .collect();

        let mut round = RoundInFlight {
            coordinator: self.clone(),
            lock_key: lock_key.to_string(),
            pending,
            granted: Vec::with_capacity(quorum),
            settled: false,
        };
        let mut refused = 0usize;

        while let Some(joined) = round.pending.next().await {
            match joined {
                Ok(LockAttempt {
                    store_index,
                    succeeded: true,
                }) => round.granted.push(store_index),
                Ok(_) => refused += 1,
                Err(e) => {
                    warn!(lock_key = %lock_key, error = %e, "Lock store task failed");
                    refused += 1;
                }
            }

            match settle(total, round.granted.len(), refused) {
                Some(true) => {
                    return RoundOutcome::Acquired(AcquiredLock {
                        store_indices: round.settle(),
                    });
                }
                Some(false) => {
                    let pending = std::mem::take(&mut round.pending);
                    if !pending.is_empty() {
                        self.drain_late_grants(lock_key, Vec::new(), pending);
                    }
                    return RoundOutcome::Failed {
                        granted: round.settle(),
                    };
                }
                None => {}
            }
        }

        RoundOutcome::Failed {
            granted: round.settle(),
        }
    }

    /// Delete `already` plus any grant that lands from `pending`, in the
    /// background. Used once a round has been given up, either because quorum
    /// became unreachable or because the caller stopped waiting for it.
    fn drain_late_grants<S>(&self, lock_key: &str, already: Vec<usize>, mut pending: S)
    where
        S: futures::Stream<Item = Result<LockAttempt, tokio::task::JoinError>>
            + Unpin
            + Send
            + 'static,
    {
        let coordinator = self.clone();
        let lock_key = lock_key.to_string();
        tokio::spawn(async move {
            let mut stale = already;
            while let Some(joined) = pending.next().await {
                if let Ok(LockAttempt {
                    store_index,
                    succeeded: true,
                }) = joined
                {
                    stale.push(store_index);
                }
            }
            if !stale.is_empty() {
                debug!(lock_key = %lock_key, stores = ?stale, "Rolling back abandoned lock grants");
                coordinator.delete_on(&lock_key, &stale).await;
            }
        });
    }

    /// Delete `lock_key` on the given stores concurrently, returning how many
    /// confirmed
    async fn delete_on(&self, lock_key: &str, indices: &[usize]) -> usize {
        let timeout = self.inner.options.store_timeout;
        let deletes = indices.iter().filter_map(|&index| {
            let store = self.inner.stores.get(index)?;
            Some(async move {
                match tokio::time::timeout(timeout, store.delete(lock_key)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        warn!(lock_key = %lock_key, store = index, error = %e, "Lock delete failed");
                        false
                    }
                    Err(_) => {
                        warn!(lock_key = %lock_key, store = index, "Lock delete timed out");
                        false
                    }
                }
            })
        });

        join_all(deletes).await.into_iter().filter(|ok| *ok).count()
    }
}

/// Minimum number of agreeing stores out of `total`
pub fn quorum_of(total: usize) -> usize {
    total / 2 + 1
}

/// Decide a round from the responses so far.
///
/// `Some(true)` once quorum is reached, `Some(false)` once more than
/// `total - quorum` stores refused (quorum unreachable), `None` while undecided.
fn settle(total: usize, granted: usize, refused: usize) -> Option<bool> {
    let quorum = quorum_of(total);
    if granted >= quorum {
        Some(true)
    } else if refused > total - quorum || granted + refused >= total {
        Some(false)
    } else {
        None
    }
}
