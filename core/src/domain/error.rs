// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use thiserror::Error;

/// Library-wide error type. Every failure carries an enumerated kind and a
/// human-readable message; callers match on the variant, users read the text.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("no usable backend: {0}")]
    BackendUnavailable(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("unknown approval: {0}")]
    UnknownApproval(String),

    #[error("unknown thread: {0}")]
    UnknownThread(String),

    #[error("illegal state transition: {0}")]
    IllegalStateTransition(String),

    #[error("file {path} is locked by {holder}")]
    LockBusy { path: String, holder: String },

    #[error("lock on {0} is no longer held under this token")]
    LockStolen(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoordError {
    /// True for transient backend failures a caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordError::Backend(_) | CoordError::Timeout(_))
    }
}

impl From<redis::RedisError> for CoordError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            CoordError::BackendUnavailable(err.to_string())
        } else {
            CoordError::Backend(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        CoordError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for CoordError {
    fn from(err: std::io::Error) -> Self {
        CoordError::Backend(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;
