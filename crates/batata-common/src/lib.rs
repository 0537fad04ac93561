//! Batata Common - Shared types for the Batata lock crates
//!
//! This crate provides the error type surfaced by the quorum lock library and
//! the operator tooling built on top of it.

pub mod error;

// Re-exports for convenience
pub use error::{BatataError, BatataResult};

/// Separator between lock type and lock key in a store key
pub const LOCK_KEY_SEPARATOR: &str = ":";

/// Build the store key for a lock of the given type
pub fn lock_key(lock_type: &str, key: &str) -> String {
    format!("{}{}{}", lock_type, LOCK_KEY_SEPARATOR, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key() {
        assert_eq!(lock_key("order", "42"), "order:42");
        assert_eq!(lock_key("", "42"), ":42");
    }
}
