//! Domain errors for the storage engine
//!
//! Argument arity and raw-string parsing failures belong to the dispatch
//! layer upstream; only failures the core itself can detect live here.

use thiserror::Error;

/// Errors surfaced by the sorted-set engine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// A score, increment or increment result is not a finite float.
    #[error("value is not a valid float")]
    InvalidScore,

    /// The key exists but holds a value of another type.
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// The shard that owns the key is no longer running.
    #[error("shard unavailable")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            StoreError::InvalidScore.to_string(),
            "value is not a valid float"
        );
        assert!(StoreError::WrongType.to_string().starts_with("WRONGTYPE"));
    }
}
