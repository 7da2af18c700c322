//! Lease renewal task
//!
//! Spawned when a TTL-style lock is acquired. Renews the lease every
//! [`LockOptions::renewal_interval`] and reports each attempt to the
//! `on_renewal` callback. Ends `Cancelled` when its context is cancelled
//! (release, or the callback cancelling it) and `Lost` when a renewal fails.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, warn};

use latchkey_common::{CallContext, LockOptions, RenewalEvent};

use crate::backend::LockBackend;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalState {
    Running,
    Cancelled,
    Lost,
}

impl RenewalState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RenewalState::Running,
            1 => RenewalState::Cancelled,
            _ => RenewalState::Lost,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RenewalState::Running => 0,
            RenewalState::Cancelled => 1,
            RenewalState::Lost => 2,
        }
    }
}

/// Owning handle to a running renewal task; dropping it cancels the task
pub struct RenewalHandle {
    context: CallContext,
    state: Arc<AtomicU8>,
    task: Option<JoinHandle<RenewalState>>,
}

impl RenewalHandle {
    /// Start renewing `name` under `context`
    pub fn spawn(
        backend: Arc<dyn LockBackend>,
        name: String,
        opts: LockOptions,
        context: CallContext,
    ) -> Self {
        let state = Arc::new(AtomicU8::new(RenewalState::Running.as_u8()));
        let span = info_span!("lease_renewal", name = %name);
        let task = tokio::spawn(
            renew_loop(backend, name, opts, context.clone(), state.clone()).instrument(span),
        );
        Self {
            context,
            state,
            task: Some(task),
        }
    }

    /// Context tied to the lease; ends when the lease is released or lost
    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub fn state(&self) -> RenewalState {
        RenewalState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Stop renewing. No final renewal is attempted.
    pub fn cancel(&self) {
        self.context.cancel();
    }

    /// Cancel and wait for the task to finish
    ///
    /// A task that panicked (for example inside the renewal callback) stopped
    /// renewing at an unknown point, so the lease is reported `Lost`.
    pub async fn stop(mut self) -> RenewalState {
        self.cancel();
        match self.task.take() {
            Some(task) => match task.await {
                Ok(state) => state,
                Err(err) => {
                    warn!(error = %err, "Lease renewal task failed");
                    self.state.store(RenewalState::Lost.as_u8(), Ordering::Release);
                    RenewalState::Lost
                }
            },
            None => self.state(),
        }
    }
}

impl Drop for RenewalHandle {
    fn drop(&mut self) {
        self.context.cancel();
    }
}

async fn renew_loop(
    backend: Arc<dyn LockBackend>,
    name: String,
    opts: LockOptions,
    context: CallContext,
    state: Arc<AtomicU8>,
) -> RenewalState {
    let interval = opts.renewal_interval();
    let finished = loop {
        if context.sleep(interval).await.is_err() {
            break RenewalState::Cancelled;
        }

        let result = match context.run(backend.renew(&name, &opts)).await {
            Err(err) if err.is_cancellation() => break RenewalState::Cancelled,
            other => other,
        };

        let event = match result {
            Ok(renewed) => RenewalEvent {
                context: context.clone(),
                name: name.clone(),
                value: opts.value.clone(),
                renewed,
                error: None,
            },
            Err(err) => RenewalEvent {
                context: context.clone(),
                name: name.clone(),
                value: opts.value.clone(),
                renewed: false,
                error: Some(Arc::new(err)),
            },
        };

        let lost = event.is_lost();
        if lost {
            metrics::record_renewal("lost");
            warn!(error = ?event.error, "Lease renewal failed, ownership lost");
        } else {
            metrics::record_renewal("renewed");
            debug!(interval_ms = interval.as_millis() as u64, "Lease renewed");
        }
        opts.notify_renewal(&event);

        if lost {
            break RenewalState::Lost;
        }
        if context.is_done() {
            break RenewalState::Cancelled;
        }
    };

    state.store(finished.as_u8(), Ordering::Release);
    if finished == RenewalState::Lost {
        context.cancel();
    }
    finished
}
