//! Advisory-lock backend adapter
//!
//! Maps try-acquire/release onto a session-scoped exclusive advisory lock
//! (`GET_LOCK(name, wait)` / `RELEASE_LOCK(name)` on MySQL). Ownership is
//! implicit in the session: the registry pins one connection per name, so no
//! token is needed.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use latchkey_common::{LockError, LockOptions, ReleaseOutcome, Result};

use crate::backend::{BackendKind, LockBackend};

/// The two primitives an advisory-lock service must provide
///
/// Replies follow MySQL: `Some(1)` success, `Some(0)` refused, `None` for
/// NULL (error, or lock unknown on release).
#[async_trait]
pub trait AdvisoryClient: Send + Sync {
    async fn get_lock(&self, name: &str, wait_secs: u64) -> Result<Option<i64>>;

    async fn release_lock(&self, name: &str) -> Result<Option<i64>>;
}

#[async_trait]
impl<T: AdvisoryClient + ?Sized> AdvisoryClient for Arc<T> {
    async fn get_lock(&self, name: &str, wait_secs: u64) -> Result<Option<i64>> {
        (**self).get_lock(name, wait_secs).await
    }

    async fn release_lock(&self, name: &str) -> Result<Option<i64>> {
        (**self).release_lock(name).await
    }
}

/// [`LockBackend`] over an [`AdvisoryClient`]
pub struct AdvisoryLockBackend<C> {
    client: C,
}

impl<C: AdvisoryClient> AdvisoryLockBackend<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

#[async_trait]
impl<C: AdvisoryClient> LockBackend for AdvisoryLockBackend<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::Advisory
    }

    async fn try_acquire(&self, name: &str, opts: &LockOptions) -> Result<()> {
        match self.client.get_lock(name, opts.advisory_wait_secs()).await? {
            Some(1) => Ok(()),
            Some(0) => Err(LockError::not_acquired(name)),
            reply => Err(LockError::UnexpectedReply {
                op: "GET_LOCK",
                reply: format!("{:?}", reply),
            }),
        }
    }

    async fn release(&self, name: &str, _opts: &LockOptions) -> Result<ReleaseOutcome> {
        match self.client.release_lock(name).await? {
            Some(1) => Ok(ReleaseOutcome::Released),
            reply => Err(LockError::UnexpectedReply {
                op: "RELEASE_LOCK",
                reply: format!("{:?}", reply),
            }),
        }
    }

    async fn renew(&self, _name: &str, _opts: &LockOptions) -> Result<bool> {
        Ok(true)
    }

    /// Re-take the lock with a zero wait and drop the extra level again.
    /// Relies on the service counting nested acquisitions per session
    /// (MySQL 5.7+).
    async fn reassert(&self, name: &str, _opts: &LockOptions) -> Result<bool> {
        match self.client.get_lock(name, 0).await? {
            Some(1) => {}
            Some(0) => return Ok(false),
            reply => {
                return Err(LockError::UnexpectedReply {
                    op: "GET_LOCK",
                    reply: format!("{:?}", reply),
                });
            }
        }
        let released = self.client.release_lock(name).await?;
        debug!(name = %name, reply = ?released, "Advisory lock reasserted");
        Ok(released == Some(1))
    }
}
