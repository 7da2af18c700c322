//! Backend adapter interface
//!
//! Every backend exposes the same small surface to the local arbitration unit:
//! a non-blocking try-acquire, a release, and (for lease-based backends) a
//! token-checked renewal. `NotAcquired` is the only retryable error.

use async_trait::async_trait;

use latchkey_common::{LockOptions, ReleaseOutcome, Result};

/// Which family of coordination service backs a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Session-scoped advisory lock (e.g. MySQL `GET_LOCK`)
    Advisory,
    /// Key with an expiry, guarded by an ownership token (e.g. Redis `SET NX PX`)
    Ttl,
    /// Exclusive OS lock on a file
    File,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Advisory => "advisory",
            BackendKind::Ttl => "ttl",
            BackendKind::File => "file",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One backend connection as seen by a lock object
#[async_trait]
pub trait LockBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Attempt to take the lock once. Returns `LockError::NotAcquired` when
    /// the lock is held elsewhere; any other error is a hard failure.
    async fn try_acquire(&self, name: &str, opts: &LockOptions) -> Result<()>;

    async fn release(&self, name: &str, opts: &LockOptions) -> Result<ReleaseOutcome>;

    /// Extend the lease if `opts.value` still owns it. `Ok(false)` means
    /// ownership is gone. Backends without leases report `Ok(true)`.
    async fn renew(&self, name: &str, opts: &LockOptions) -> Result<bool>;

    /// Confirm that this holder still owns the lock, without giving it up
    async fn reassert(&self, name: &str, opts: &LockOptions) -> Result<bool>;

    /// Whether a held lock needs a background renewal task
    fn uses_lease(&self) -> bool {
        self.kind() == BackendKind::Ttl
    }
}
