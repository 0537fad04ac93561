//! Lock store contract
//!
//! A `LockStore` is one of the N independently operated key/value backends
//! that vote on a lock. Stores are addressed by their index in the
//! coordinator's store list; nothing else identifies them.

mod memory;

pub use memory::MemoryLockStore;

use std::sync::Arc;

use async_trait::async_trait;

/// One independent key/value backend
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically set `key` to `value` with a TTL unless a live key exists.
    ///
    /// Returns `false` when the key is already held. Two concurrent callers
    /// must never both observe `true` for the same live key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> anyhow::Result<bool>;

    /// Reset the TTL of `key` (best-effort)
    async fn refresh_ttl(&self, key: &str, ttl_ms: u64) -> anyhow::Result<()>;

    /// Remove `key` (best-effort, idempotent)
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

pub type LockStoreRef = Arc<dyn LockStore>;
