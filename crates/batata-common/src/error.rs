//! Error types for Batata lock crates
//!
//! `BatataError` is the only error the lock library surfaces to callers.
//! Store-level failures are reported as `anyhow::Error` by `LockStore`
//! implementations and never escape a single acquisition round.

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum BatataError {
    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Quorum was not reached within the retry/time budget
    #[error("lock timeout: {0}")]
    LockTimeout(String),

    /// A lock store could not serve a call
    #[error("store error: {0}")]
    StoreError(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl BatataError {
    /// Whether this error is a lock acquisition timeout
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, BatataError::LockTimeout(_))
    }
}

impl From<anyhow::Error> for BatataError {
    fn from(value: anyhow::Error) -> Self {
        match value.downcast::<BatataError>() {
            Ok(e) => e,
            Err(e) => BatataError::InternalError(format!("{:#}", e)),
        }
    }
}

pub type BatataResult<T> = Result<T, BatataError>;
