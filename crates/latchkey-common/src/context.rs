//! Cancellable call contexts
//!
//! Every blocking point (backend round trip, local wakeup wait, renewal tick,
//! election retry wait) races against a `CallContext`. A context ends when its
//! token is cancelled or its deadline passes; children end with their parent.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::error::{LockError, Result};

/// Cancellation token plus optional deadline, threaded through every call
#[derive(Clone, Debug)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

impl CallContext {
    /// A root context that never ends on its own
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Wrap an existing token, for callers that already manage shutdown with one
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Child context with its own cancel, keeping the parent's deadline
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Child context that follows the parent's cancellation but not its deadline
    pub fn detached_child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: None,
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Child context ending at `deadline` or at the parent's deadline, whichever is earlier
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The error this context ended with, if it has ended
    pub fn err(&self) -> Option<LockError> {
        if self.token.is_cancelled() {
            return Some(LockError::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Some(LockError::DeadlineExceeded);
        }
        None
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Wait until the context ends and return why
    pub async fn done(&self) -> LockError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => LockError::Cancelled,
                    _ = sleep_until(deadline) => LockError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                LockError::Cancelled
            }
        }
    }

    /// Race `fut` against the context; the context wins ties
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }

    /// Sleep for `duration` unless the context ends first
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            _ = sleep(duration) => Ok(()),
        }
    }
}
