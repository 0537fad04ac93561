// Lock contention drill
// Runs concurrent workers through LockSession::using over shared stores and
// checks that no two workers are ever inside the critical section together

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use batata_common::BatataError;
use batata_lock::{
    LockSession, LockSettings, LockStats, LockStore, LockStoreRef, MemoryLockStore,
    MetricsLockObserver, QuorumLockCoordinator,
};

/// Drill parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrillParams {
    pub lock_type: String,
    pub key: String,
    pub workers: usize,
    /// Critical sections per worker
    pub rounds: usize,
    pub hold_ms: u64,
    /// Leading stores replaced by unavailable ones
    pub failing_stores: usize,
}

impl Default for DrillParams {
    fn default() -> Self {
        Self {
            lock_type: "drill".to_string(),
            key: "shared".to_string(),
            workers: 4,
            rounds: 3,
            hold_ms: 20,
            failing_stores: 0,
        }
    }
}

/// Drill outcome
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrillReport {
    pub stores: usize,
    pub failing_stores: usize,
    pub quorum: usize,
    pub workers: usize,
    /// Critical sections that ran to completion
    pub completed: usize,
    /// `using` calls that failed with a lock timeout
    pub lock_timeouts: usize,
    /// Times a worker entered while another was inside (must be 0)
    pub overlaps: usize,
    /// Critical sections that saw the watchdog signal
    pub signalled: usize,
    pub elapsed_ms: u64,
    /// Summed coordinator statistics across workers
    pub stats: LockStats,
}

/// A store that is down: every call fails
struct UnavailableStore;

impl UnavailableStore {
    fn unavailable(operation: &str, key: &str) -> anyhow::Error {
        BatataError::StoreError(format!("{} {}: store unavailable", operation, key)).into()
    }
}

#[async_trait]
impl LockStore for UnavailableStore {
    async fn set_if_absent(&self, key: &str, _value: &str, _ttl_ms: u64) -> anyhow::Result<bool> {
        Err(Self::unavailable("set", key))
    }

    async fn refresh_ttl(&self, key: &str, _ttl_ms: u64) -> anyhow::Result<()> {
        Err(Self::unavailable("refresh", key))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        Err(Self::unavailable("delete", key))
    }
}

fn build_stores(count: usize, failing: usize) -> Vec<LockStoreRef> {
    (0..count)
        .map(|index| {
            if index < failing {
                Arc::new(UnavailableStore) as Arc<dyn LockStore>
            } else {
                Arc::new(MemoryLockStore::new()) as Arc<dyn LockStore>
            }
        })
        .collect()
}

fn add_stats(total: &mut LockStats, stats: &LockStats) {
    total.acquisitions += stats.acquisitions;
    total.failed_acquisitions += stats.failed_acquisitions;
    total.rounds += stats.rounds;
    total.retries += stats.retries;
    total.rollbacks += stats.rollbacks;
    total.releases += stats.releases;
    total.extensions += stats.extensions;
    total.extension_timeouts += stats.extension_timeouts;
}

#[derive(Default)]
struct DrillCounters {
    inside: AtomicUsize,
    completed: AtomicUsize,
    lock_timeouts: AtomicUsize,
    overlaps: AtomicUsize,
    signalled: AtomicUsize,
}

/// Run the drill. Every worker is a separate coordinator with its own lock
/// value, standing in for a separate process sharing the same stores.
pub async fn run(settings: &LockSettings, params: &DrillParams) -> Result<DrillReport, BatataError> {
    let config = settings.lock_configuration()?;
    let stores = build_stores(settings.store_count, params.failing_stores);
    let counters = Arc::new(DrillCounters::default());
    let started = Instant::now();

    let mut sessions = Vec::with_capacity(params.workers);
    for worker in 0..params.workers {
        let mut options = settings.coordinator_options();
        options.lock_value = format!("{}-worker-{}", options.lock_value, worker);
        let coordinator = QuorumLockCoordinator::with_config(
            stores.clone(),
            options,
            Arc::new(MetricsLockObserver),
        )?;
        sessions.push(LockSession::new(coordinator));
    }
    let quorum = sessions
        .first()
        .map(|s| s.coordinator().quorum())
        .unwrap_or_default();

    info!(
        stores = settings.store_count,
        failing = params.failing_stores,
        quorum,
        workers = params.workers,
        rounds = params.rounds,
        "Starting lock drill"
    );

    let handles: Vec<_> = sessions
        .iter()
        .cloned()
        .enumerate()
        .map(|(worker, session)| {
            let counters = counters.clone();
            let params = params.clone();
            let config = config.clone();
            tokio::spawn(async move {
                for round in 0..params.rounds {
                    let counters_inner = counters.clone();
                    let hold = Duration::from_millis(params.hold_ms);
                    let result: Result<(), BatataError> = session
                        .using(&params.lock_type, &params.key, config.clone(), |signal| async move {
                            if counters_inner.inside.fetch_add(1, Ordering::SeqCst) != 0 {
                                counters_inner.overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            tokio::time::sleep(hold).await;
                            if signal.is_aborted() {
                                counters_inner.signalled.fetch_add(1, Ordering::SeqCst);
                            }
                            counters_inner.inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .await;

                    match result {
                        Ok(()) => {
                            counters.completed.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) if e.is_lock_timeout() => {
                            counters.lock_timeouts.fetch_add(1, Ordering::SeqCst);
                            warn!(worker, round, error = %e, "Worker could not acquire lock");
                        }
                        Err(e) => {
                            warn!(worker, round, error = %e, "Worker failed");
                        }
                    }
                }
            })
        })
        .collect();

    for joined in futures::future::join_all(handles).await {
        joined.map_err(|e| BatataError::InternalError(format!("drill worker panicked: {}", e)))?;
    }

    let mut stats = LockStats::default();
    for session in &sessions {
        add_stats(&mut stats, &session.coordinator().stats());
    }

    let report = DrillReport {
        stores: settings.store_count,
        failing_stores: params.failing_stores.min(settings.store_count),
        quorum,
        workers: params.workers,
        completed: counters.completed.load(Ordering::SeqCst),
        lock_timeouts: counters.lock_timeouts.load(Ordering::SeqCst),
        overlaps: counters.overlaps.load(Ordering::SeqCst),
        signalled: counters.signalled.load(Ordering::SeqCst),
        elapsed_ms: started.elapsed().as_millis() as u64,
        stats,
    };

    info!(
        completed = report.completed,
        lock_timeouts = report.lock_timeouts,
        overlaps = report.overlaps,
        elapsed_ms = report.elapsed_ms,
        "Lock drill finished"
    );
    Ok(report)
}
