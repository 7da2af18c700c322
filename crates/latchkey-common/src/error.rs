//! Error types for Latchkey
//!
//! This module defines:
//! - `LockError`: every failure a lock, lease or election call can surface
//! - `ReleaseOutcome`: the non-error results of a token-checked release
//! - `Result`: crate-wide result alias

use std::fmt::{Display, Formatter};

/// Error type shared by all lock backends and drivers
#[derive(thiserror::Error, Debug)]
pub enum LockError {
    /// The backend reported the lock as held elsewhere. Absorbed by the
    /// local wait loop and never surfaced unless retries run out.
    #[error("lock '{name}' is held elsewhere")]
    NotAcquired { name: String },

    #[error("failed to acquire lock '{name}' after {tries} tries")]
    RetriesExhausted { name: String, tries: u32 },

    #[error("context cancelled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("lock '{name}' is not held by this process")]
    NotHeld { name: String },

    #[error("unexpected reply to {op}: {reply}")]
    UnexpectedReply { op: &'static str, reply: String },

    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl LockError {
    pub fn not_acquired(name: impl Into<String>) -> Self {
        LockError::NotAcquired { name: name.into() }
    }

    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        LockError::Backend(Box::new(err))
    }

    /// Backend error built from a plain message
    pub fn backend_msg(msg: impl Into<String>) -> Self {
        let msg: String = msg.into();
        LockError::Backend(msg.into())
    }

    /// Whether the local wait loop should absorb this error and retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::NotAcquired { .. })
    }

    /// Whether this error comes from the caller's context ending
    pub fn is_cancellation(&self) -> bool {
        matches!(self, LockError::Cancelled | LockError::DeadlineExceeded)
    }
}

impl From<config::ConfigError> for LockError {
    fn from(value: config::ConfigError) -> Self {
        LockError::Config(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Outcome of a token-checked release
///
/// A release presenting the wrong token is not an error: the backend is left
/// untouched and `NotOwner` is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    AlreadyGone,
    NotOwner,
}

impl ReleaseOutcome {
    pub fn is_released(self) -> bool {
        self == ReleaseOutcome::Released
    }
}

impl Display for ReleaseOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReleaseOutcome::Released => write!(f, "released"),
            ReleaseOutcome::AlreadyGone => write!(f, "already gone"),
            ReleaseOutcome::NotOwner => write!(f, "not owner"),
        }
    }
}
