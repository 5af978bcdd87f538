//! Error handling, definitions, and utilities.
//!
//! Every crate in the workspace funnels failures through [`OxherdError`] so
//! that action results, fan-out aggregates, and stream terminations all
//! carry the same surface vocabulary.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// General error type used across the oxherd codebase.
#[derive(Clone, Serialize, Deserialize, Error, Debug, PartialEq, Eq)]
pub enum OxherdError {
    /// A topology node was not found.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// A topology node already exists.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// A compare-and-swap write lost the race: the node changed under us.
    #[error("version mismatch on {path}: expected {expected}, stored {actual}")]
    VersionMismatch {
        /// The node that was written.
        path: String,
        /// The version the caller read.
        expected: u64,
        /// The version currently stored.
        actual: u64,
    },

    /// A delete hit a node that still has children.
    #[error("node not empty: {0}")]
    NotEmpty(String),

    /// A bounded wait expired. The underlying work may still be running.
    #[error("timed out {during}")]
    Timeout {
        /// A textual description of what was being waited on.
        during: String,
    },

    /// A precondition check failed and the operation was not started.
    #[error("aborted: {0}")]
    Aborted(String),

    /// A non-resolvable failure: corrupt data, an unrecognized action, or a
    /// panic captured during dispatch.
    #[error("fatal: {0}")]
    Fatal(String),

    /// A multi-tablet fan-out finished with some per-tablet failures. The
    /// individual errors are joined with newlines.
    #[error("partial failure:\n{errors}")]
    Partial {
        /// Joined per-tablet error descriptions.
        errors: String,
    },

    /// A binlog decoding failure. Terminates the affected stream only.
    #[error("parse error: {0}")]
    Parse(String),

    /// An internal invariant was violated. Should never happen.
    #[error("internal invariant failed: {0}")]
    Internal(String),

    /// Serializing or deserializing a stored record failed.
    #[error("failed to (de)serialize: {0}")]
    Serialization(String),

    /// An I/O error, stringified so the enum stays serializable.
    #[error("io error: {0}")]
    Io(String),

    /// A hook invocation failed outright (not a nonzero exit).
    #[error("hook failed: {0}")]
    HookFailed(String),

    /// An action finished in the failed state; carries the error recorded
    /// on the action log.
    #[error("action {path} failed: {error}")]
    ActionFailed {
        /// The queue path of the action.
        path: String,
        /// The error string recorded by the agent.
        error: String,
    },
}

impl From<serde_json::Error> for OxherdError {
    fn from(e: serde_json::Error) -> Self {
        OxherdError::Serialization(e.to_string())
    }
}

impl From<io::Error> for OxherdError {
    fn from(e: io::Error) -> Self {
        OxherdError::Io(e.to_string())
    }
}

/// Result type alias used across the workspace.
pub type OxherdResult<T> = Result<T, OxherdError>;

impl OxherdError {
    /// True for errors that indicate the caller raced with another writer
    /// and may retry after re-reading.
    pub fn is_retry_after_reread(&self) -> bool {
        matches!(
            self,
            OxherdError::VersionMismatch { .. } | OxherdError::NodeExists(_)
        )
    }
}

/// Construct an [`OxherdError::Internal`] from a format string.
#[macro_export]
macro_rules! internal_err {
    ($($tt:tt)*) => {
        $crate::OxherdError::Internal(format!($($tt)*))
    };
}

/// Return early with an [`OxherdError::Internal`].
#[macro_export]
macro_rules! internal {
    ($($tt:tt)*) => {
        return Err($crate::internal_err!($($tt)*).into())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mismatch_is_retryable() {
        let err = OxherdError::VersionMismatch {
            path: "/a".into(),
            expected: 1,
            actual: 2,
        };
        assert!(err.is_retry_after_reread());
        assert!(!OxherdError::Timeout { during: "x".into() }.is_retry_after_reread());
    }

    #[test]
    fn errors_round_trip_through_json() {
        let err = OxherdError::Partial {
            errors: "a\nb".into(),
        };
        let encoded = serde_json::to_string(&err).unwrap();
        let decoded: OxherdError = serde_json::from_str(&encoded).unwrap();
        assert_eq!(err, decoded);
    }
}
