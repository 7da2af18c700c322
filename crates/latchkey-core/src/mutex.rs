//! Local arbitration unit
//!
//! One `DistributedMutex` exists per lock name per registry. It funnels all
//! local callers through a single held flag, a waiter count and a single-slot
//! wakeup so that contention is settled in-process before hitting the backend.
//!
//! Lock algorithm:
//! 1. If the lock is held locally or callers are already waiting, skip the
//!    backend and join the wait loop (the attempt is known to fail).
//! 2. Otherwise try the backend once; success returns immediately.
//! 3. On `NotAcquired`, wait for a wakeup or the caller's context, retry the
//!    backend on every wakeup, until success, a hard error, cancellation or
//!    the retry cap.
//!
//! The wakeup slot holds at most one pending post and wakes one arbitrary
//! waiter; there is no fairness between waiters.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use latchkey_common::{CallContext, LockError, LockOptions, ReleaseOutcome, Result};

use crate::backend::{BackendKind, LockBackend};
use crate::metrics;
use crate::renewal::{RenewalHandle, RenewalState};

/// A named lock shared by every local caller of a registry
pub struct DistributedMutex {
    name: String,
    backend: Arc<dyn LockBackend>,
    options: LockOptions,
    /// True while some local caller owns the backend lock
    held: AtomicBool,
    waiters: AtomicI32,
    wakeup: Notify,
    /// Options the current holder acquired with; release and reassert reuse its token
    holder_options: Mutex<Option<LockOptions>>,
    renewal: Mutex<Option<RenewalHandle>>,
}

impl std::fmt::Debug for DistributedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedMutex")
            .field("name", &self.name)
            .field("backend", &self.backend.kind())
            .field("held", &self.is_held())
            .field("waiters", &self.waiters())
            .finish()
    }
}

impl DistributedMutex {
    pub fn new(name: impl Into<String>, backend: Arc<dyn LockBackend>, options: LockOptions) -> Self {
        Self {
            name: name.into(),
            backend,
            options,
            held: AtomicBool::new(false),
            waiters: AtomicI32::new(0),
            wakeup: Notify::new(),
            holder_options: Mutex::new(None),
            renewal: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Options stored at creation, used when a call passes no override
    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Whether this process believes it holds the backend lock
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Local callers currently in the wait loop
    pub fn waiters(&self) -> i32 {
        self.waiters.load(Ordering::Acquire)
    }

    /// Context of the running lease renewal, if the lock is held on a TTL backend
    pub fn lease_context(&self) -> Option<CallContext> {
        self.renewal
            .lock()
            .as_ref()
            .map(|handle| handle.context().clone())
    }

    pub fn renewal_state(&self) -> Option<RenewalState> {
        self.renewal.lock().as_ref().map(|handle| handle.state())
    }

    pub async fn lock(&self, ctx: &CallContext) -> Result<()> {
        self.lock_with(ctx, None).await
    }

    /// Acquire, using `override_opts` instead of the stored options when given
    pub async fn lock_with(
        &self,
        ctx: &CallContext,
        override_opts: Option<&LockOptions>,
    ) -> Result<()> {
        let opts = LockOptions::effective(&self.options, override_opts);
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        if self.is_held() || self.waiters() > 0 {
            // Waiters racing the backend need a post to make progress; a
            // local holder posts on unlock
            if !self.is_held() {
                self.notify();
            }
        } else {
            match self.try_acquire(ctx, opts).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() => {}
                Err(err) => return Err(err),
            }
        }

        let _waiting = WaiterGuard::enter(self);
        self.wait_loop(ctx, opts).await
    }

    async fn wait_loop(&self, ctx: &CallContext, opts: &LockOptions) -> Result<()> {
        let mut tries: u32 = 0;
        loop {
            tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                _ = self.wakeup.notified() => {}
            }

            tries += 1;
            match self.try_acquire(ctx, opts).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() => {
                    if opts.tries > 0 && tries >= opts.tries {
                        metrics::record_retries_exhausted();
                        return Err(LockError::RetriesExhausted {
                            name: self.name.clone(),
                            tries,
                        });
                    }
                    if !opts.retry_delay.is_zero() {
                        ctx.sleep(opts.retry_delay).await?;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One backend attempt. The held flag is claimed first so that at most
    /// one local caller is ever between "attempting" and "holding".
    async fn try_acquire(&self, ctx: &CallContext, opts: &LockOptions) -> Result<()> {
        let Some(claim) = HeldClaim::acquire(self) else {
            return Err(LockError::not_acquired(&self.name));
        };

        match ctx.run(self.backend.try_acquire(&self.name, opts)).await {
            Ok(()) => {
                claim.commit();
                self.on_acquired(ctx, opts);
                Ok(())
            }
            Err(err) => {
                if err.is_retryable() {
                    metrics::record_contended(self.backend.kind());
                    debug!(name = %self.name, "Lock held elsewhere");
                }
                // Dropping the claim clears the flag and wakes another waiter
                Err(err)
            }
        }
    }

    fn on_acquired(&self, ctx: &CallContext, opts: &LockOptions) {
        metrics::record_acquired(self.backend.kind());
        debug!(name = %self.name, backend = %self.backend.kind(), "Lock acquired");
        *self.holder_options.lock() = Some(opts.clone());

        if self.backend.uses_lease() {
            let handle = RenewalHandle::spawn(
                self.backend.clone(),
                self.name.clone(),
                opts.clone(),
                ctx.detached_child(),
            );
            if let Some(previous) = self.renewal.lock().replace(handle) {
                previous.cancel();
            }
        }
    }

    pub async fn unlock(&self, ctx: &CallContext) -> Result<ReleaseOutcome> {
        self.unlock_with(ctx, None).await
    }

    /// Release the backend lock and wake one local waiter
    ///
    /// Renewal is cancelled before the release call so it cannot extend a
    /// lease that is being dropped. Without an override, the token the
    /// holder acquired with is presented.
    pub async fn unlock_with(
        &self,
        ctx: &CallContext,
        override_opts: Option<&LockOptions>,
    ) -> Result<ReleaseOutcome> {
        if let Some(handle) = self.renewal.lock().take() {
            handle.cancel();
        }
        // Cleared once the release resolves or the call is dropped
        let _released = HeldClaim::releasing(self);

        let held_opts = self.holder_options.lock().take();
        let opts = match override_opts {
            Some(opts) => opts,
            None => held_opts.as_ref().unwrap_or(&self.options),
        };

        let result = ctx.run(self.backend.release(&self.name, opts)).await;
        match &result {
            Ok(outcome) => debug!(name = %self.name, outcome = %outcome, "Lock released"),
            Err(err) => debug!(name = %self.name, error = %err, "Lock release failed"),
        }
        result
    }

    /// Confirm that the lock held by this process is still owned
    ///
    /// Used for periodic re-assertion by a holder (e.g. an elected leader).
    /// Fails with `NotHeld` when the lock is not held locally or the backend
    /// no longer recognizes this holder.
    pub async fn reassert(&self, ctx: &CallContext) -> Result<()> {
        if !self.is_held() || self.renewal_state() == Some(RenewalState::Lost) {
            return Err(LockError::NotHeld {
                name: self.name.clone(),
            });
        }

        let opts = self
            .holder_options
            .lock()
            .clone()
            .unwrap_or_else(|| self.options.clone());
        if ctx.run(self.backend.reassert(&self.name, &opts)).await? {
            Ok(())
        } else {
            Err(LockError::NotHeld {
                name: self.name.clone(),
            })
        }
    }

    /// Post a wakeup; a post made while one is already pending is dropped
    pub(crate) fn notify(&self) {
        self.wakeup.notify_one();
    }
}

/// Ownership of the held flag between claiming it and a committed acquire
///
/// Dropped uncommitted (failed attempt, unlock, or a caller dropping its
/// future mid-call) it clears the flag and posts a wakeup.
struct HeldClaim<'a> {
    mutex: &'a DistributedMutex,
    committed: bool,
}

impl<'a> HeldClaim<'a> {
    fn acquire(mutex: &'a DistributedMutex) -> Option<Self> {
        mutex
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                mutex,
                committed: false,
            })
    }

    fn releasing(mutex: &'a DistributedMutex) -> Self {
        Self {
            mutex,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for HeldClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.mutex.held.store(false, Ordering::Release);
            self.mutex.notify();
        }
    }
}

/// Counts one caller in the wait loop for as long as it lives
struct WaiterGuard<'a> {
    mutex: &'a DistributedMutex,
}

impl<'a> WaiterGuard<'a> {
    fn enter(mutex: &'a DistributedMutex) -> Self {
        let waiting = mutex.waiters.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::set_waiters(&mutex.name, waiting);
        Self { mutex }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let waiting = self.mutex.waiters.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::set_waiters(&self.mutex.name, waiting);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::advisory::AdvisoryLockBackend;
    use crate::memory::{MemoryAdvisoryServer, MemoryKvStore};
    use crate::ttl::TtlLockBackend;

    fn ttl_mutex(store: &MemoryKvStore, value: &str) -> DistributedMutex {
        DistributedMutex::new(
            "orders",
            Arc::new(TtlLockBackend::new(store.client())),
            LockOptions::new()
                .with_value(value)
                .with_expiry(Duration::from_secs(6)),
        )
    }

    #[tokio::test]
    async fn test_uncontended_lock_takes_fast_path() {
        let store = MemoryKvStore::new();
        let mutex = ttl_mutex(&store, "A");
        let ctx = CallContext::background();

        mutex.lock(&ctx).await.unwrap();
        assert!(mutex.is_held());
        assert_eq!(mutex.waiters(), 0);
        assert!(mutex.lease_context().is_some());
        assert_eq!(store.get("orders").as_deref(), Some("A"));

        assert_eq!(mutex.unlock(&ctx).await.unwrap(), ReleaseOutcome::Released);
        assert!(!mutex.is_held());
        assert!(mutex.lease_context().is_none());
        assert!(store.get("orders").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_waiter_is_woken_by_unlock() {
        let store = MemoryKvStore::new();
        let mutex = Arc::new(ttl_mutex(&store, "A"));
        let ctx = CallContext::background();

        mutex.lock(&ctx).await.unwrap();
        let waiter = tokio::spawn({
            let mutex = mutex.clone();
            async move {
                let ctx = CallContext::background();
                mutex.lock(&ctx).await?;
                mutex.unlock(&ctx).await
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mutex.waiters(), 1);

        mutex.unlock(&ctx).await.unwrap();
        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, ReleaseOutcome::Released);
        assert_eq!(mutex.waiters(), 0);
        assert!(!mutex.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_holder_exhausts_tries() {
        let store = MemoryKvStore::new();
        let remote = ttl_mutex(&store, "remote");
        let local = ttl_mutex(&store, "local");
        let ctx = CallContext::background();

        remote.lock(&ctx).await.unwrap();
        let opts = local.options().clone().with_tries(3);
        let err = local.lock_with(&ctx, Some(&opts)).await.unwrap_err();
        assert!(matches!(err, LockError::RetriesExhausted { tries: 3, .. }));
        assert_eq!(local.waiters(), 0);
        assert!(!local.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_prompt() {
        let store = MemoryKvStore::new();
        let remote = ttl_mutex(&store, "remote");
        let local = ttl_mutex(&store, "local");

        remote.lock(&CallContext::background()).await.unwrap();

        let ctx = CallContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = local.lock(&ctx).await.unwrap_err();
        assert!(matches!(err, LockError::Cancelled));
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(local.waiters(), 0);
    }

    #[tokio::test]
    async fn test_already_cancelled_context_never_touches_backend() {
        let store = MemoryKvStore::new();
        let mutex = ttl_mutex(&store, "A");
        let ctx = CallContext::background();
        ctx.cancel();

        assert!(matches!(mutex.lock(&ctx).await, Err(LockError::Cancelled)));
        assert!(store.get("orders").is_none());
    }

    #[tokio::test]
    async fn test_backend_error_propagates() {
        let store = MemoryKvStore::new();
        let client = store.client();
        client.set_unreachable(true);
        let mutex = DistributedMutex::new(
            "orders",
            Arc::new(TtlLockBackend::new(client)),
            LockOptions::new(),
        );

        let err = mutex.lock(&CallContext::background()).await.unwrap_err();
        assert!(matches!(err, LockError::Backend(_)));
        assert!(!mutex.is_held());
        assert_eq!(mutex.waiters(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_stops_renewal_first() {
        let store = MemoryKvStore::new();
        let mutex = DistributedMutex::new(
            "orders",
            Arc::new(TtlLockBackend::new(store.client())),
            LockOptions::new()
                .with_value("A")
                .with_expiry(Duration::from_secs(2)),
        );
        let ctx = CallContext::background();

        mutex.lock(&ctx).await.unwrap();
        let lease = mutex.lease_context().unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.get("orders").as_deref(), Some("A"));

        mutex.unlock(&ctx).await.unwrap();
        assert!(lease.is_done());
        assert!(store.get("orders").is_none());
    }

    #[tokio::test]
    async fn test_override_token_is_used_for_release() {
        let store = MemoryKvStore::new();
        let mutex = ttl_mutex(&store, "stored");
        let ctx = CallContext::background();
        let call = mutex.options().clone().with_value("per-call");

        mutex.lock_with(&ctx, Some(&call)).await.unwrap();
        assert_eq!(store.get("orders").as_deref(), Some("per-call"));

        // The holder's token is remembered even when unlock passes no override
        assert_eq!(mutex.unlock(&ctx).await.unwrap(), ReleaseOutcome::Released);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reassert_detects_lost_lease() {
        let store = MemoryKvStore::new();
        let mutex = ttl_mutex(&store, "A");
        let ctx = CallContext::background();

        assert!(matches!(
            mutex.reassert(&ctx).await,
            Err(LockError::NotHeld { .. })
        ));

        mutex.lock(&ctx).await.unwrap();
        mutex.reassert(&ctx).await.unwrap();

        store.flush();
        assert!(matches!(
            mutex.reassert(&ctx).await,
            Err(LockError::NotHeld { .. })
        ));
    }

    #[tokio::test]
    async fn test_advisory_mutex_has_no_lease() {
        let server = MemoryAdvisoryServer::new();
        let mutex = DistributedMutex::new(
            "orders",
            Arc::new(AdvisoryLockBackend::new(server.session())),
            LockOptions::new().with_advisory_wait(Duration::ZERO),
        );
        let ctx = CallContext::background();

        mutex.lock(&ctx).await.unwrap();
        assert_eq!(mutex.backend_kind(), BackendKind::Advisory);
        assert!(mutex.lease_context().is_none());
        mutex.reassert(&ctx).await.unwrap();
        assert_eq!(mutex.unlock(&ctx).await.unwrap(), ReleaseOutcome::Released);
        assert!(server.holder("orders").is_none());
    }

    /// Advisory backend whose release never answers
    struct StalledRelease(AdvisoryLockBackend<Arc<crate::memory::MemoryAdvisorySession>>);

    #[async_trait]
    impl LockBackend for StalledRelease {
        fn kind(&self) -> BackendKind {
            self.0.kind()
        }

        async fn try_acquire(&self, name: &str, opts: &LockOptions) -> Result<()> {
            self.0.try_acquire(name, opts).await
        }

        async fn release(&self, _name: &str, _opts: &LockOptions) -> Result<ReleaseOutcome> {
            std::future::pending().await
        }

        async fn renew(&self, name: &str, opts: &LockOptions) -> Result<bool> {
            self.0.renew(name, opts).await
        }

        async fn reassert(&self, name: &str, opts: &LockOptions) -> Result<bool> {
            self.0.reassert(name, opts).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_backend_call_frees_local_claim() {
        let server = MemoryAdvisoryServer::new();
        let opts = LockOptions::new().with_advisory_wait(Duration::from_secs(4));
        let holder = DistributedMutex::new(
            "report",
            Arc::new(AdvisoryLockBackend::new(server.session())),
            opts.clone(),
        );
        let waiter = DistributedMutex::new(
            "report",
            Arc::new(AdvisoryLockBackend::new(server.session())),
            opts,
        );
        let ctx = CallContext::background();

        holder.lock(&ctx).await.unwrap();
        // Dropped while the server is still waiting on GET_LOCK
        let timed_out = tokio::time::timeout(Duration::from_millis(100), waiter.lock(&ctx)).await;
        assert!(timed_out.is_err());
        assert!(!waiter.is_held());
        assert_eq!(waiter.waiters(), 0);

        holder.unlock(&ctx).await.unwrap();
        waiter
            .lock(&ctx.with_timeout(Duration::from_secs(30)))
            .await
            .unwrap();
        assert!(waiter.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_wait_loop_leaves_no_waiter() {
        let store = MemoryKvStore::new();
        let remote = ttl_mutex(&store, "remote");
        let local = ttl_mutex(&store, "local");
        let ctx = CallContext::background();

        remote.lock(&ctx).await.unwrap();
        let timed_out = tokio::time::timeout(Duration::from_millis(300), local.lock(&ctx)).await;
        assert!(timed_out.is_err());
        assert_eq!(local.waiters(), 0);
        assert!(!local.is_held());

        remote.unlock(&ctx).await.unwrap();
        local
            .lock(&ctx.with_timeout(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(store.get("orders").as_deref(), Some("local"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_unlock_clears_held() {
        let server = MemoryAdvisoryServer::new();
        let mutex = DistributedMutex::new(
            "report",
            Arc::new(StalledRelease(AdvisoryLockBackend::new(server.session()))),
            LockOptions::new().with_advisory_wait(Duration::ZERO),
        );
        let ctx = CallContext::background();

        mutex.lock(&ctx).await.unwrap();
        let timed_out = tokio::time::timeout(Duration::from_millis(100), mutex.unlock(&ctx)).await;
        assert!(timed_out.is_err());
        assert!(!mutex.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_holder_does_not_cost_a_try() {
        let store = MemoryKvStore::new();
        let mutex = Arc::new(ttl_mutex(&store, "A"));
        let ctx = CallContext::background();

        mutex.lock(&ctx).await.unwrap();
        let waiter = tokio::spawn({
            let mutex = mutex.clone();
            async move {
                let opts = mutex.options().clone().with_tries(1);
                mutex.lock_with(&CallContext::background(), Some(&opts)).await
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mutex.waiters(), 1);
        mutex.unlock(&ctx).await.unwrap();

        waiter.await.unwrap().unwrap();
        assert!(mutex.is_held());
    }
}
