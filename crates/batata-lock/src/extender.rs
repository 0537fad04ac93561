//! Lease extension watchdog
//!
//! Keeps a held lock alive while a long critical section runs. The first
//! extension fires at 90% of the key expiration, later ones at 90% of the
//! extension TTL. Every firing raises the session's `CancellationSignal`
//! before refreshing, so the action learns that its lease is being renewed
//! and may lapse before the refresh lands.
//!
//! Once the lock has been held for more than ten key expirations the watchdog
//! assumes the action is stuck, stops refreshing and lets the lease run out.
//! The action itself keeps running: cancellation is advisory only.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use crate::coordinator::QuorumLockCoordinator;
use crate::model::{CancellationSignal, LockConfiguration};
use crate::observer::FailureReason;

/// Held duration beyond which extension stops, in key expirations
pub const EXTEND_CEILING_FACTOR: u32 = 10;

/// Extensions fire at this per-mille of the current TTL
const EXTEND_AT_PER_MILLE: u64 = 900;

/// Handle to a running watchdog.
///
/// Dropping the handle stops the watchdog as well; `stop` makes it explicit.
pub struct LeaseExtender {
    lock_key: String,
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

struct ExtensionTask {
    coordinator: QuorumLockCoordinator,
    lock_type: String,
    lock_key: String,
    key_expiration_ms: u64,
    extend_ttl_ms: u64,
    signal: CancellationSignal,
    held_since: Instant,
}

impl LeaseExtender {
    /// Start watching `lock_key`, held since now
    pub fn start(
        coordinator: QuorumLockCoordinator,
        lock_type: &str,
        lock_key: &str,
        config: &LockConfiguration,
        signal: CancellationSignal,
    ) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let task = ExtensionTask {
            coordinator,
            lock_type: lock_type.to_string(),
            lock_key: lock_key.to_string(),
            key_expiration_ms: config.key_expiration_ms,
            extend_ttl_ms: config.effective_extend_ttl_ms(),
            signal,
            held_since: Instant::now(),
        };

        Self {
            lock_key: lock_key.to_string(),
            stop_tx,
            handle: tokio::spawn(task.run(stop_rx)),
        }
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Whether the watchdog still schedules extensions
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel any pending extension
    pub fn stop(self) {
        let _ = self.stop_tx.try_send(());
    }
}

impl ExtensionTask {
    async fn run(self, mut stop_rx: mpsc::Receiver<()>) {
        let verbose = self.coordinator.options().verbose;
        let mut delay = extend_delay(self.key_expiration_ms);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_rx.recv() => {
                    tracing::debug!(lock_key = %self.lock_key, "Lease extender stopped");
                    break;
                }
            }

            self.signal.abort();

            let held = self.held_since.elapsed();
            if held > self.ceiling() {
                self.coordinator
                    .stats_collector()
                    .extension_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                self.coordinator
                    .observer()
                    .increment_failure(&self.lock_type, FailureReason::ExtendTimeout);
                warn!(
                    lock_key = %self.lock_key,
                    held_ms = held.as_millis() as u64,
                    "EXTEND_TIMEOUT: lock held past {} key expirations, giving up extension",
                    EXTEND_CEILING_FACTOR
                );
                break;
            }

            self.coordinator
                .stats_collector()
                .extensions
                .fetch_add(1, Ordering::Relaxed);
            self.coordinator.observer().record_extension(&self.lock_type);
            verbose_log!(
                verbose,
                lock_key = %self.lock_key,
                held_ms = held.as_millis() as u64,
                ttl_ms = self.extend_ttl_ms,
                "EXTEND"
            );

            // Next firing is scheduled before the refresh so a slow store
            // does not stretch the cadence.
            delay = extend_delay(self.extend_ttl_ms);
            let coordinator = self.coordinator.clone();
            let lock_key = self.lock_key.clone();
            let ttl_ms = self.extend_ttl_ms;
            tokio::spawn(async move {
                coordinator.extend(&lock_key, ttl_ms).await;
            });
        }
    }

    fn ceiling(&self) -> Duration {
        Duration::from_millis(self.key_expiration_ms) * EXTEND_CEILING_FACTOR
    }
}

fn extend_delay(ttl_ms: u64) -> Duration {
    // Split on whole seconds so the product cannot overflow
    let millis = ttl_ms / 1000 * EXTEND_AT_PER_MILLE + ttl_ms % 1000 * EXTEND_AT_PER_MILLE / 1000;
    Duration::from_millis(millis)
}
