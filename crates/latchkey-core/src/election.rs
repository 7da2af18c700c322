//! Leader election over a distributed mutex
//!
//! A [`LeaderElector`] races for one named lock. The winner runs the
//! `on_started_leading` task under a cancellable context and re-asserts
//! ownership every renew deadline. Leadership ends when the outer context is
//! cancelled, a re-assertion fails, or (on TTL backends) the lease renewal
//! reports the lease lost. The elector is single use: after it stops, a new
//! instance is needed to rejoin the race.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{Instrument, debug, info, info_span, warn};

use latchkey_common::{CallContext, ElectionSettings, LockError, LockOptions, Result};

use crate::metrics;
use crate::mutex::DistributedMutex;

pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(15);
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(200);

type IdentityCallback = Arc<dyn Fn(&str) + Send + Sync>;
type LeadingTask = Arc<dyn Fn(CallContext) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    /// Pause between failed election attempts
    pub retry_period: Duration,
    /// Interval between ownership re-assertions while leading
    pub renew_deadline: Duration,
    /// Bound on a single election attempt
    pub acquire_timeout: Duration,
    /// Generated when absent
    pub identity: Option<String>,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            retry_period: DEFAULT_RETRY_PERIOD,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            identity: None,
        }
    }
}

impl From<&ElectionSettings> for LeaderElectionConfig {
    fn from(settings: &ElectionSettings) -> Self {
        Self {
            retry_period: settings.retry_period(),
            renew_deadline: settings.renew_deadline(),
            acquire_timeout: settings.acquire_timeout(),
            identity: settings.identity.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Electing,
    Leading,
    Stopped,
}

/// Why an elector stopped
#[derive(Debug)]
pub enum StopReason {
    /// The outer context ended
    Cancelled,
    /// Lease renewal reported the lease gone
    LeaseLost,
    /// Periodic re-assertion failed
    RenewFailed(LockError),
}

pub struct LeaderElector {
    mutex: Arc<DistributedMutex>,
    config: LeaderElectionConfig,
    identity: String,
    on_new_leader: IdentityCallback,
    on_started_leading: LeadingTask,
    on_stopped_leading: IdentityCallback,
    state: watch::Sender<ElectionState>,
}

impl LeaderElector {
    pub fn new(mutex: Arc<DistributedMutex>, config: LeaderElectionConfig) -> Self {
        let identity = config
            .identity
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (state, _) = watch::channel(ElectionState::Electing);
        Self {
            mutex,
            config,
            identity,
            on_new_leader: Arc::new(|_: &str| {}),
            on_started_leading: Arc::new(|_: CallContext| async {}.boxed()),
            on_stopped_leading: Arc::new(|_: &str| {}),
            state,
        }
    }

    /// Called synchronously with this elector's identity when it wins
    pub fn on_new_leader<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_new_leader = Arc::new(f);
        self
    }

    /// Spawned on winning; the context is cancelled when leadership ends
    pub fn on_started_leading<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_started_leading = Arc::new(move |ctx| f(ctx).boxed());
        self
    }

    /// Called after the lock has been released on step-down
    pub fn on_stopped_leading<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_stopped_leading = Arc::new(f);
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> ElectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ElectionState> {
        self.state.subscribe()
    }

    /// Run the election until leadership ends or `ctx` is cancelled
    pub async fn run(self, ctx: &CallContext) -> StopReason {
        let span = info_span!(
            "leader_election",
            name = %self.mutex.name(),
            identity = %self.identity
        );
        self.run_inner(ctx).instrument(span).await
    }

    async fn run_inner(&self, ctx: &CallContext) -> StopReason {
        let leading = ctx.child();
        let opts = self.lock_options(&leading);

        if let Err(err) = self.elect(ctx, &opts).await {
            debug!(error = %err, "Election abandoned");
            self.state.send_replace(ElectionState::Stopped);
            return StopReason::Cancelled;
        }

        self.state.send_replace(ElectionState::Leading);
        metrics::record_leader_transition("elected");
        info!("Became leader");
        (self.on_new_leader)(&self.identity);
        let task = tokio::spawn((self.on_started_leading)(leading.clone()));
        let mut abdication = Abdication {
            mutex: self.mutex.clone(),
            opts: opts.clone(),
            leading: leading.clone(),
            release_timeout: self.config.retry_period,
            armed: true,
        };

        let reason = self.lead(ctx, &leading).await;
        self.step_down(&leading, &opts, task, &reason).await;
        abdication.armed = false;
        reason
    }

    /// Options for this elector's lock calls
    ///
    /// The identity is the ownership token and a lost lease cancels the
    /// leading context. Advisory attempts never wait longer than one
    /// election attempt.
    fn lock_options(&self, leading: &CallContext) -> LockOptions {
        let base = self.mutex.options().clone();
        let inner = base.clone();
        let expiry = self.config.renew_deadline + base.renewal_margin;
        let advisory_wait = base.advisory_wait.min(self.config.acquire_timeout);
        let leading = leading.clone();

        base.with_value(self.identity.clone())
            .with_expiry(expiry)
            .with_advisory_wait(advisory_wait)
            .on_renewal(move |event| {
                inner.notify_renewal(event);
                if event.is_lost() {
                    leading.cancel();
                }
            })
    }

    async fn elect(&self, ctx: &CallContext, opts: &LockOptions) -> Result<()> {
        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }

            let attempt = ctx.with_timeout(self.config.acquire_timeout);
            match self.mutex.lock_with(&attempt, Some(opts)).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(error = %err, "Election attempt failed");
                    ctx.sleep(self.config.retry_period).await?;
                }
            }
        }
    }

    async fn lead(&self, ctx: &CallContext, leading: &CallContext) -> StopReason {
        loop {
            tokio::select! {
                biased;
                _ = ctx.done() => return StopReason::Cancelled,
                _ = leading.done() => return StopReason::LeaseLost,
                _ = tokio::time::sleep(self.config.renew_deadline) => {
                    let attempt = leading.with_timeout(self.config.renew_deadline);
                    match self.mutex.reassert(&attempt).await {
                        Ok(()) => debug!("Leadership reasserted"),
                        Err(_) if ctx.is_done() => return StopReason::Cancelled,
                        Err(_) if leading.is_done() => return StopReason::LeaseLost,
                        Err(err) => {
                            warn!(error = %err, "Failed to reassert leadership");
                            return StopReason::RenewFailed(err);
                        }
                    }
                }
            }
        }
    }

    async fn step_down(
        &self,
        leading: &CallContext,
        opts: &LockOptions,
        task: tokio::task::JoinHandle<()>,
        reason: &StopReason,
    ) {
        leading.cancel();
        if tokio::time::timeout(self.config.renew_deadline, task)
            .await
            .is_err()
        {
            warn!("Leader task still running after cancellation");
        }

        let release = CallContext::background().with_timeout(self.config.retry_period);
        match self.mutex.unlock_with(&release, Some(opts)).await {
            Ok(outcome) => debug!(outcome = %outcome, "Leader lock released"),
            Err(err) => warn!(error = %err, "Failed to release leader lock"),
        }

        self.state.send_replace(ElectionState::Stopped);
        metrics::record_leader_transition("stopped");
        info!(reason = ?reason, "Stopped leading");
        (self.on_stopped_leading)(&self.identity);
    }
}

/// Steps down if a leading elector's `run` future is dropped
///
/// Cancels the leader task's context and releases the lock in the background.
/// No callbacks run on this path.
struct Abdication {
    mutex: Arc<DistributedMutex>,
    opts: LockOptions,
    leading: CallContext,
    release_timeout: Duration,
    armed: bool,
}

impl Drop for Abdication {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.leading.cancel();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(name = %self.mutex.name(), "No runtime to release abandoned leader lock");
            return;
        };
        let mutex = self.mutex.clone();
        let opts = self.opts.clone();
        let release = CallContext::background().with_timeout(self.release_timeout);
        runtime.spawn(async move {
            if let Err(err) = mutex.unlock_with(&release, Some(&opts)).await {
                warn!(name = %mutex.name(), error = %err, "Failed to release abandoned leader lock");
            }
        });
        metrics::record_leader_transition("stopped");
    }
}

/// Hold `mutex` for the duration of `f`
///
/// `f` gets a child of `ctx` that is cancelled once `f` returns, or earlier
/// if the lease backing the lock is lost. The lock is released even when
/// `ctx` has been cancelled in the meantime. Dropping the returned future
/// while `f` runs leaves the lock held; cancel `ctx` instead.
pub async fn run_as_leader<F, Fut, T>(ctx: &CallContext, mutex: &DistributedMutex, f: F) -> Result<T>
where
    F: FnOnce(CallContext) -> Fut,
    Fut: Future<Output = T>,
{
    mutex.lock(ctx).await?;

    let work = ctx.child();
    let lease_watch = mutex.lease_context().map(|lease| {
        let work = work.clone();
        tokio::spawn(async move {
            lease.token().cancelled().await;
            work.cancel();
        })
    });

    let output = f(work.clone()).await;

    if let Some(watch) = lease_watch {
        watch.abort();
    }
    work.cancel();

    let release = CallContext::background().with_timeout(mutex.options().expiry);
    if let Err(err) = mutex.unlock(&release).await {
        warn!(name = %mutex.name(), error = %err, "Failed to release lock after leader run");
    }
    Ok(output)
}
