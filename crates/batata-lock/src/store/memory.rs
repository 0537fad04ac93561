// In-memory lock store
// Provides atomic set-if-absent with per-key TTL expiry

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::debug;

use super::LockStore;

/// A stored lock value
#[derive(Debug, Clone)]
struct LockEntry {
    value: String,
    expires_at: Instant,
}

/// Cap for TTLs too large to add to the clock
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn expires_at(ttl_ms: u64) -> Instant {
    let now = Instant::now();
    now.checked_add(Duration::from_millis(ttl_ms))
        .unwrap_or(now + MAX_TTL)
}

impl LockEntry {
    fn new(value: &str, ttl_ms: u64) -> Self {
        Self {
            value: value.to_string(),
            expires_at: expires_at(ttl_ms),
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// `LockStore` backed by a `DashMap`.
///
/// Expiry is measured on the tokio clock so paused-time tests see keys lapse
/// as the clock advances. Expired entries are treated as absent on every
/// operation and physically removed by `purge_expired`.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    entries: DashMap<String, LockEntry>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live value of `key`, if any
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone())
    }

    /// Remaining TTL of a live `key`
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.expires_at.saturating_duration_since(Instant::now()))
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired entries, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.entries.len())
    }

    /// Periodically purge expired entries until the store is dropped
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(count = purged, "Cleaned up expired lock entries");
                }
            }
        })
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> anyhow::Result<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired() {
                    return Ok(false);
                }
                occupied.insert(LockEntry::new(value, ttl_ms));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LockEntry::new(value, ttl_ms));
            }
        }
        Ok(true)
    }

    async fn refresh_ttl(&self, key: &str, ttl_ms: u64) -> anyhow::Result<()> {
        if let Some(mut entry) = self.entries.get_mut(key)
            && !entry.is_expired()
        {
            entry.expires_at = expires_at(ttl_ms);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
