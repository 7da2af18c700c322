//! Per-acquisition lock options and renewal events

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::context::CallContext;
use crate::error::LockError;

/// Default lease duration for TTL-style backends
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(6);
/// Margin subtracted from the lease when scheduling renewals
pub const DEFAULT_RENEWAL_MARGIN: Duration = Duration::from_secs(2);
/// Pause after a failed wait-loop attempt
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(25);
/// Server-side wait budget for one advisory try-acquire
pub const DEFAULT_ADVISORY_WAIT: Duration = Duration::from_secs(4);

/// Callback invoked with every renewal attempt
pub type RenewalCallback = Arc<dyn Fn(&RenewalEvent) + Send + Sync>;

/// Outcome of one lease renewal attempt, handed to the renewal callback
#[derive(Debug, Clone)]
pub struct RenewalEvent {
    /// Context of the renewal task. Cancelling it stops renewal and wakes
    /// everything waiting on the holder's lease context.
    pub context: CallContext,
    pub name: String,
    /// Ownership token presented to the backend
    pub value: String,
    pub renewed: bool,
    pub error: Option<Arc<LockError>>,
}

impl RenewalEvent {
    /// Ownership can no longer be assumed
    pub fn is_lost(&self) -> bool {
        !self.renewed || self.error.is_some()
    }
}

/// Immutable options bound to a lock object at creation
///
/// Later calls may pass an override; see [`LockOptions::effective`].
#[derive(Clone)]
pub struct LockOptions {
    /// Ownership token written on acquire and checked on release/renew
    pub value: String,
    /// Lease duration (TTL backends only)
    pub expiry: Duration,
    /// Retry cap for the wait loop, 0 = unbounded
    pub tries: u32,
    pub renewal_margin: Duration,
    pub retry_delay: Duration,
    pub advisory_wait: Duration,
    /// Re-create the key on renewal if it has vanished
    pub reclaim_on_renew: bool,
    on_renewal: Option<RenewalCallback>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            value: uuid::Uuid::new_v4().to_string(),
            expiry: DEFAULT_EXPIRY,
            tries: 0,
            renewal_margin: DEFAULT_RENEWAL_MARGIN,
            retry_delay: DEFAULT_RETRY_DELAY,
            advisory_wait: DEFAULT_ADVISORY_WAIT,
            reclaim_on_renew: false,
            on_renewal: None,
        }
    }
}

impl Debug for LockOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockOptions")
            .field("value", &self.value)
            .field("expiry", &self.expiry)
            .field("tries", &self.tries)
            .field("renewal_margin", &self.renewal_margin)
            .field("retry_delay", &self.retry_delay)
            .field("advisory_wait", &self.advisory_wait)
            .field("reclaim_on_renew", &self.reclaim_on_renew)
            .field("on_renewal", &self.on_renewal.is_some())
            .finish()
    }
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }

    pub fn with_renewal_margin(mut self, margin: Duration) -> Self {
        self.renewal_margin = margin;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_advisory_wait(mut self, wait: Duration) -> Self {
        self.advisory_wait = wait;
        self
    }

    pub fn with_reclaim_on_renew(mut self, reclaim: bool) -> Self {
        self.reclaim_on_renew = reclaim;
        self
    }

    pub fn on_renewal<F>(mut self, f: F) -> Self
    where
        F: Fn(&RenewalEvent) + Send + Sync + 'static,
    {
        self.on_renewal = Some(Arc::new(f));
        self
    }

    /// Resolve the options for one call: an explicit override wins over the
    /// lock object's stored default.
    pub fn effective<'a>(
        default: &'a LockOptions,
        override_opts: Option<&'a LockOptions>,
    ) -> &'a LockOptions {
        override_opts.unwrap_or(default)
    }

    /// Time between renewal attempts
    ///
    /// `expiry - renewal_margin` when the lease is comfortably longer than the
    /// margin, otherwise half the lease.
    pub fn renewal_interval(&self) -> Duration {
        if self.expiry > self.renewal_margin * 2 {
            self.expiry - self.renewal_margin
        } else {
            self.expiry / 2
        }
    }

    /// Lease duration in whole milliseconds, as sent to the backend
    pub fn expiry_millis(&self) -> u64 {
        self.expiry.as_millis().max(1) as u64
    }

    /// Server-side advisory wait in whole seconds
    pub fn advisory_wait_secs(&self) -> u64 {
        self.advisory_wait.as_secs()
    }

    pub fn notify_renewal(&self, event: &RenewalEvent) {
        if let Some(callback) = &self.on_renewal {
            callback(event);
        }
    }
}
