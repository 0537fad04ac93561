//! Batata Lock - Quorum-based distributed mutual exclusion
//!
//! A named critical section runs on at most one process at a time, backed by
//! N independently operated key/value stores instead of a single point of
//! failure:
//! - `LockStore`: the store contract (atomic set-if-absent, refresh TTL, delete)
//! - `QuorumLockCoordinator`: fan-out acquisition with quorum tally, bounded
//!   retries and rollback of minority locks
//! - `LeaseExtender`: watchdog refreshing the lock TTL while a critical
//!   section runs, with a runaway-extension ceiling
//! - `LockSession`: scoped acquisition that always releases on exit
//!
//! Cancellation is cooperative only. The watchdog raises a
//! `CancellationSignal` the action may check; nothing interrupts the action.

#[macro_use]
mod macros;

pub mod coordinator;
pub mod extender;
pub mod model;
pub mod observer;
pub mod session;
pub mod settings;
pub mod store;

pub use coordinator::{CoordinatorOptions, LockStats, QuorumLockCoordinator};
pub use extender::LeaseExtender;
pub use model::*;
pub use observer::{FailureReason, LockObserver, MetricsLockObserver, describe_lock_metrics};
pub use session::LockSession;
pub use settings::LockSettings;
pub use store::{LockStore, LockStoreRef, MemoryLockStore};

pub use batata_common::{BatataError, BatataResult, lock_key};
