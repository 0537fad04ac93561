//! Lock settings as loaded from configuration sources

use std::time::Duration;

use serde::{Deserialize, Serialize};

use batata_common::BatataResult;

use crate::coordinator::{CoordinatorOptions, DEFAULT_STORE_TIMEOUT};
use crate::model::{DEFAULT_MAX_RETRIES, LockConfiguration};

fn default_store_count() -> usize {
    3
}

fn default_key_expiration_ms() -> u64 {
    30000
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT.as_millis() as u64
}

/// Coordinator and default lock configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSettings {
    /// Number of independent stores voting on each lock
    #[serde(default = "default_store_count")]
    pub store_count: usize,
    #[serde(default = "default_key_expiration_ms")]
    pub key_expiration_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Defaults to one hundredth of `key_expiration_ms`
    #[serde(default)]
    pub retry_interval_ms: Option<u64>,
    #[serde(default)]
    pub extend_ttl_ms: Option<u64>,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Log acquisition rounds and extensions at info level
    #[serde(default)]
    pub verbose: bool,
    /// Value written to the stores; random per coordinator when unset
    #[serde(default)]
    pub lock_value: Option<String>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            store_count: default_store_count(),
            key_expiration_ms: default_key_expiration_ms(),
            max_retries: default_max_retries(),
            retry_interval_ms: None,
            extend_ttl_ms: None,
            store_timeout_ms: default_store_timeout_ms(),
            verbose: false,
            lock_value: None,
        }
    }
}

impl LockSettings {
    /// Default lock configuration for sessions built from these settings
    pub fn lock_configuration(&self) -> BatataResult<LockConfiguration> {
        let mut config =
            LockConfiguration::new(self.key_expiration_ms)?.with_max_retries(self.max_retries);
        if let Some(retry_interval_ms) = self.retry_interval_ms {
            config = config.with_retry_interval_ms(retry_interval_ms);
        }
        if let Some(extend_ttl_ms) = self.extend_ttl_ms {
            config = config.with_extend_ttl_ms(extend_ttl_ms);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        let mut options = CoordinatorOptions {
            verbose: self.verbose,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            ..Default::default()
        };
        if let Some(ref value) = self.lock_value {
            options.lock_value = value.clone();
        }
        options
    }
}
