//! Stable error codes surfaced to tool callers.
//!
//! Every failure response carries one of these codes in `error_code`,
//! alongside a human-readable `error` string.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Referenced entity absent.
    NotFound,
    /// Malformed identifier, out-of-range field, unknown enum, empty
    /// required field.
    InvalidArgument,
    /// The operation would break a structural invariant (rank, cycle,
    /// progress range, missing execution instructions).
    InvariantViolation,
    /// Status transition not permitted by the state machine.
    InvalidTransition,
    /// Manual sync resolution required; payload lists diverging fields.
    Conflict,
    /// Delete without cascade on an item that has children.
    HasChildren,
    /// The embedding provider failed.
    EmbeddingUnavailable,
    /// FTS or vector index unusable and no fallback succeeded.
    IndexUnavailable,
    /// Operation exceeded its deadline.
    Timeout,
    /// Operation was cancelled.
    Cancelled,
    /// Anything else.
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::InvalidArgument => "InvalidArgument",
            Self::InvariantViolation => "InvariantViolation",
            Self::InvalidTransition => "InvalidTransition",
            Self::Conflict => "Conflict",
            Self::HasChildren => "HasChildren",
            Self::EmbeddingUnavailable => "EmbeddingUnavailable",
            Self::IndexUnavailable => "IndexUnavailable",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
