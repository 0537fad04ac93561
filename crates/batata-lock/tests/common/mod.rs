//! Shared fixtures for lock integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use batata_lock::{
    BatataError, CoordinatorOptions, FailureReason, LockObserver, LockStore, LockStoreRef, MemoryLockStore,
    QuorumLockCoordinator,
};

/// How a scripted store answers set-if-absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Grant,
    Refuse,
    Error,
}

/// Store with a fixed answer and response delay, counting every call
pub struct ScriptedStore {
    answer: Answer,
    delay: Duration,
    delete_delay: Duration,
    fail_delete: bool,
    pub set_calls: AtomicUsize,
    pub set_completed: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
}

impl ScriptedStore {
    pub fn new(answer: Answer) -> Self {
        Self {
            answer,
            delay: Duration::ZERO,
            delete_delay: Duration::ZERO,
            fail_delete: false,
            set_calls: AtomicUsize::new(0),
            set_completed: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    pub fn delayed(answer: Answer, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(answer)
        }
    }

    pub fn slow_delete(answer: Answer, delete_delay: Duration) -> Self {
        Self {
            delete_delay,
            ..Self::new(answer)
        }
    }

    pub fn failing_delete(answer: Answer) -> Self {
        Self {
            fail_delete: true,
            ..Self::new(answer)
        }
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn set_completed(&self) -> usize {
        self.set_completed.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockStore for ScriptedStore {
    async fn set_if_absent(&self, _key: &str, _value: &str, _ttl_ms: u64) -> anyhow::Result<bool> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.set_completed.fetch_add(1, Ordering::SeqCst);
        match self.answer {
            Answer::Grant => Ok(true),
            Answer::Refuse => Ok(false),
            Answer::Error => Err(BatataError::StoreError("store unavailable".to_string()).into()),
        }
    }

    async fn refresh_ttl(&self, _key: &str, _ttl_ms: u64) -> anyhow::Result<()> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, _key: &str) -> anyhow::Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delete_delay.is_zero() {
            tokio::time::sleep(self.delete_delay).await;
        }
        if self.fail_delete {
            anyhow::bail!("delete rejected");
        }
        Ok(())
    }
}

/// Observer event captured by `RecordingObserver`
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    AcquireDuration(String, Duration),
    HeldDuration(String, Duration),
    Failure(String, FailureReason),
    Extension(String, Instant),
}

#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<Recorded>>,
}

impl RecordingObserver {
    pub fn failures(&self) -> Vec<FailureReason> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::Failure(_, reason) => Some(*reason),
                _ => None,
            })
            .collect()
    }

    pub fn extension_times(&self) -> Vec<Instant> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::Extension(_, at) => Some(*at),
                _ => None,
            })
            .collect()
    }

    pub fn acquire_durations(&self) -> Vec<Duration> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::AcquireDuration(_, d) => Some(*d),
                _ => None,
            })
            .collect()
    }

    pub fn held_durations(&self) -> Vec<Duration> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::HeldDuration(_, d) => Some(*d),
                _ => None,
            })
            .collect()
    }
}

impl LockObserver for RecordingObserver {
    fn record_acquire_duration(&self, lock_type: &str, elapsed: Duration) {
        self.events
            .lock()
            .push(Recorded::AcquireDuration(lock_type.to_string(), elapsed));
    }

    fn record_held_duration(&self, lock_type: &str, elapsed: Duration) {
        self.events
            .lock()
            .push(Recorded::HeldDuration(lock_type.to_string(), elapsed));
    }

    fn increment_failure(&self, lock_type: &str, reason: FailureReason) {
        self.events
            .lock()
            .push(Recorded::Failure(lock_type.to_string(), reason));
    }

    fn record_extension(&self, lock_type: &str) {
        self.events
            .lock()
            .push(Recorded::Extension(lock_type.to_string(), Instant::now()));
    }
}

/// Let spawned release and rollback tasks run to completion
pub async fn run_background_tasks() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

pub fn scripted(answers: &[Answer]) -> Vec<Arc<ScriptedStore>> {
    answers
        .iter()
        .map(|a| Arc::new(ScriptedStore::new(*a)))
        .collect()
}

pub fn memory_stores(n: usize) -> Vec<Arc<MemoryLockStore>> {
    (0..n).map(|_| Arc::new(MemoryLockStore::new())).collect()
}

pub fn refs<S: LockStore + 'static>(stores: &[Arc<S>]) -> Vec<LockStoreRef> {
    stores
        .iter()
        .map(|s| s.clone() as Arc<dyn LockStore>)
        .collect()
}

/// Coordinator with a long store timeout and a recording observer
pub fn coordinator_with(
    stores: Vec<LockStoreRef>,
    lock_value: &str,
) -> (QuorumLockCoordinator, Arc<RecordingObserver>) {
    let observer = Arc::new(RecordingObserver::default());
    let options = CoordinatorOptions {
        verbose: true,
        store_timeout: Duration::from_secs(60),
        lock_value: lock_value.to_string(),
    };
    let coordinator =
        QuorumLockCoordinator::with_config(stores, options, observer.clone()).unwrap();
    (coordinator, observer)
}
