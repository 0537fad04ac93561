// Metrics hooks for lock acquisition, hold time, failures and lease extensions
// The coordinator and the watchdog only call these as fire-and-forget sinks

use std::fmt;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};

pub const LOCK_ACQUIRE_DURATION: &str = "lock_acquire_duration_seconds";
pub const LOCK_HELD_DURATION: &str = "lock_held_duration_seconds";
pub const LOCK_FAILURES_TOTAL: &str = "lock_failures_total";
pub const LOCK_EXTENSIONS_TOTAL: &str = "lock_extensions_total";

/// Why a lock operation is reported as failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// Quorum not reached within the retry/time budget
    AcquireTimeout,
    /// Release could not be confirmed on every store
    ReleaseFailed,
    /// Watchdog passed the extension ceiling and stopped refreshing
    ExtendTimeout,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::AcquireTimeout => "ACQUIRE_TIMEOUT",
            FailureReason::ReleaseFailed => "RELEASE_FAILED",
            FailureReason::ExtendTimeout => "EXTEND_TIMEOUT",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Collaborator hooks invoked by the lock core
pub trait LockObserver: Send + Sync {
    /// Time spent acquiring a lock that needed at least one retry
    fn record_acquire_duration(&self, lock_type: &str, elapsed: Duration);

    /// Time a lock was held by a `using` invocation
    fn record_held_duration(&self, lock_type: &str, elapsed: Duration);

    fn increment_failure(&self, lock_type: &str, reason: FailureReason);

    /// A lease extension cycle started
    fn record_extension(&self, lock_type: &str);
}

/// Register metric descriptions.
/// Should be called once at application startup
pub fn describe_lock_metrics() {
    describe_histogram!(
        LOCK_ACQUIRE_DURATION,
        "Time spent acquiring a contended lock in seconds"
    );
    describe_histogram!(
        LOCK_HELD_DURATION,
        "Time a lock was held by a critical section in seconds"
    );
    describe_counter!(
        LOCK_FAILURES_TOTAL,
        "Total number of lock failures by reason"
    );
    describe_counter!(
        LOCK_EXTENSIONS_TOTAL,
        "Total number of lease extension cycles"
    );
}

/// `LockObserver` publishing through the `metrics` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsLockObserver;

impl LockObserver for MetricsLockObserver {
    fn record_acquire_duration(&self, lock_type: &str, elapsed: Duration) {
        histogram!(LOCK_ACQUIRE_DURATION, "type" => lock_type.to_string())
            .record(elapsed.as_secs_f64());
    }

    fn record_held_duration(&self, lock_type: &str, elapsed: Duration) {
        histogram!(LOCK_HELD_DURATION, "type" => lock_type.to_string())
            .record(elapsed.as_secs_f64());
    }

    fn increment_failure(&self, lock_type: &str, reason: FailureReason) {
        counter!(LOCK_FAILURES_TOTAL, "type" => lock_type.to_string(), "reason" => reason.as_str())
            .increment(1);
    }

    fn record_extension(&self, lock_type: &str) {
        counter!(LOCK_EXTENSIONS_TOTAL, "type" => lock_type.to_string()).increment(1);
    }
}
