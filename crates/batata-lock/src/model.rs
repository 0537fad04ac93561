//! Quorum Lock Data Model

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use batata_common::{BatataError, BatataResult};

/// Retries used when only an expiration is supplied
pub const DEFAULT_MAX_RETRIES: u32 = 100;

/// Retry interval is this fraction of the key expiration when not supplied
const DEFAULT_RETRY_INTERVAL_DIVISOR: u64 = 100;

/// Lock acquisition and lease settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLockConfiguration")]
pub struct LockConfiguration {
    /// Key time-to-live on every store in milliseconds (must be > 0)
    pub key_expiration_ms: u64,
    /// Retries after the first round before giving up
    pub max_retries: u32,
    /// Sleep between two rounds in milliseconds
    pub retry_interval_ms: u64,
    /// TTL applied by lease extensions (defaults to `key_expiration_ms`)
    pub extend_ttl_ms: Option<u64>,
}

/// Wire form of `LockConfiguration` with the derived defaults still unresolved
#[derive(Debug, Deserialize)]
struct RawLockConfiguration {
    key_expiration_ms: u64,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    retry_interval_ms: Option<u64>,
    #[serde(default)]
    extend_ttl_ms: Option<u64>,
}

impl TryFrom<RawLockConfiguration> for LockConfiguration {
    type Error = BatataError;

    fn try_from(raw: RawLockConfiguration) -> Result<Self, Self::Error> {
        let mut config = LockConfiguration::new(raw.key_expiration_ms)?;
        if let Some(max_retries) = raw.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(retry_interval_ms) = raw.retry_interval_ms {
            config.retry_interval_ms = retry_interval_ms;
        }
        config.extend_ttl_ms = raw.extend_ttl_ms;
        Ok(config)
    }
}

impl LockConfiguration {
    /// Configuration derived from an expiration alone: 100 retries, one
    /// hundredth of the expiration between rounds, extensions reuse the
    /// expiration as TTL.
    pub fn new(key_expiration_ms: u64) -> BatataResult<Self> {
        let config = Self {
            key_expiration_ms,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval_ms: key_expiration_ms / DEFAULT_RETRY_INTERVAL_DIVISOR,
            extend_ttl_ms: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_interval_ms(mut self, retry_interval_ms: u64) -> Self {
        self.retry_interval_ms = retry_interval_ms;
        self
    }

    pub fn with_extend_ttl_ms(mut self, extend_ttl_ms: u64) -> Self {
        self.extend_ttl_ms = Some(extend_ttl_ms);
        self
    }

    pub fn validate(&self) -> BatataResult<()> {
        if self.key_expiration_ms == 0 {
            return Err(BatataError::IllegalArgument(
                "key_expiration_ms must be greater than 0".to_string(),
            ));
        }
        if self.extend_ttl_ms == Some(0) {
            return Err(BatataError::IllegalArgument(
                "extend_ttl_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn key_expiration(&self) -> Duration {
        Duration::from_millis(self.key_expiration_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// TTL written by each lease extension
    pub fn effective_extend_ttl_ms(&self) -> u64 {
        self.extend_ttl_ms.unwrap_or(self.key_expiration_ms)
    }
}

/// Either a bare expiration or a complete configuration, as accepted by
/// `LockSession::using`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpirationOrConfig {
    /// Key expiration in milliseconds
    Expiration(u64),
    Config(LockConfiguration),
}

impl ExpirationOrConfig {
    /// Normalize into a validated configuration
    pub fn into_configuration(self) -> BatataResult<LockConfiguration> {
        match self {
            ExpirationOrConfig::Expiration(ms) => LockConfiguration::new(ms),
            ExpirationOrConfig::Config(config) => {
                config.validate()?;
                Ok(config)
            }
        }
    }
}

impl From<u64> for ExpirationOrConfig {
    fn from(value: u64) -> Self {
        ExpirationOrConfig::Expiration(value)
    }
}

impl From<Duration> for ExpirationOrConfig {
    fn from(value: Duration) -> Self {
        ExpirationOrConfig::Expiration(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}

impl From<LockConfiguration> for ExpirationOrConfig {
    fn from(value: LockConfiguration) -> Self {
        ExpirationOrConfig::Config(value)
    }
}

/// Outcome of one set-if-absent call against one store in one round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockAttempt {
    pub store_index: usize,
    pub succeeded: bool,
}

/// Stores that granted the lock in a successful round.
///
/// Only the stores that answered before quorum was reached are listed.
/// Stragglers are not tracked, which is why release targets every store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquiredLock {
    pub store_indices: Vec<usize>,
}

impl AcquiredLock {
    pub fn len(&self) -> usize {
        self.store_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store_indices.is_empty()
    }
}

/// Lifecycle of one `using` invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockSessionState {
    /// Waiting for quorum
    #[default]
    Acquiring,
    /// Quorum reached, action running under the watchdog
    Held,
    /// Action finished, release in flight
    Releasing,
    /// Quorum not reached within the retry/time budget
    Failed,
}

impl LockSessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockSessionState::Acquiring => "acquiring",
            LockSessionState::Held => "held",
            LockSessionState::Releasing => "releasing",
            LockSessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for LockSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Advisory flag shared between the lease watchdog and the critical section.
///
/// The watchdog raises it at the start of every extension cycle to warn the
/// action that the lock may lapse before the refresh lands. Nothing stops the
/// action; it may checkpoint, recheck state, or ignore the flag entirely.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    aborted: Arc<AtomicBool>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}
