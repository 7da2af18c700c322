// Latchkey configuration
// Loaded from an optional file plus LATCHKEY_-prefixed environment variables

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{LockError, Result};
use crate::options::LockOptions;

/// Top-level configuration
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct LatchkeyConfig {
    pub lock: LockSettings,
    pub election: ElectionSettings,
    pub backend: BackendSettings,
}

/// Defaults applied to every lock created from this configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Lease duration in milliseconds (default: 6000ms)
    pub expiry_ms: u64,
    /// Wait-loop retry cap, 0 = unbounded
    pub tries: u32,
    /// Renewal safety margin in milliseconds (default: 2000ms)
    pub renewal_margin_ms: u64,
    /// Pause after a failed wait-loop attempt (default: 25ms)
    pub retry_delay_ms: u64,
    /// Server-side wait budget per advisory try-acquire (default: 4s)
    pub advisory_wait_secs: u64,
    pub reclaim_on_renew: bool,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            expiry_ms: 6000,
            tries: 0,
            renewal_margin_ms: 2000,
            retry_delay_ms: 25,
            advisory_wait_secs: 4,
            reclaim_on_renew: false,
        }
    }
}

/// Leader election timing
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ElectionSettings {
    /// Wait between failed election attempts (default: 5000ms)
    pub retry_period_ms: u64,
    /// Interval between leadership re-assertions (default: 15000ms)
    pub renew_deadline_ms: u64,
    /// Deadline of a single election attempt (default: 200ms)
    pub acquire_timeout_ms: u64,
    pub identity: Option<String>,
}

impl Default for ElectionSettings {
    fn default() -> Self {
        Self {
            retry_period_ms: 5000,
            renew_deadline_ms: 15000,
            acquire_timeout_ms: 200,
            identity: None,
        }
    }
}

impl ElectionSettings {
    pub fn retry_period(&self) -> Duration {
        Duration::from_millis(self.retry_period_ms)
    }

    pub fn renew_deadline(&self) -> Duration {
        Duration::from_millis(self.renew_deadline_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Backend connection pools
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub mysql_urls: Vec<String>,
    pub redis_urls: Vec<String>,
    pub file_dir: Option<PathBuf>,
}

impl LatchkeyConfig {
    /// Load from `path` (format inferred from the extension) and the environment
    ///
    /// Environment keys look like `LATCHKEY_LOCK__EXPIRY_MS`; list values are
    /// comma separated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("LATCHKEY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("backend.mysql_urls")
                .with_list_parse_key("backend.redis_urls"),
        );

        let config: LatchkeyConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work; called by `load`
    pub fn validate(&self) -> Result<()> {
        if self.lock.expiry_ms == 0 {
            return Err(LockError::Config("lock.expiry_ms must be positive".into()));
        }
        if self.election.retry_period_ms == 0 {
            return Err(LockError::Config(
                "election.retry_period_ms must be positive".into(),
            ));
        }
        if self.election.renew_deadline_ms == 0 {
            return Err(LockError::Config(
                "election.renew_deadline_ms must be positive".into(),
            ));
        }
        if self.backend.mysql_urls.iter().any(|url| url.trim().is_empty())
            || self.backend.redis_urls.iter().any(|url| url.trim().is_empty())
        {
            return Err(LockError::Config("backend urls must not be empty".into()));
        }
        Ok(())
    }

    /// Lock options built from the `lock` section, with a fresh ownership token
    pub fn lock_options(&self) -> LockOptions {
        LockOptions::new()
            .with_expiry(Duration::from_millis(self.lock.expiry_ms))
            .with_tries(self.lock.tries)
            .with_renewal_margin(Duration::from_millis(self.lock.renewal_margin_ms))
            .with_retry_delay(Duration::from_millis(self.lock.retry_delay_ms))
            .with_advisory_wait(Duration::from_secs(self.lock.advisory_wait_secs))
            .with_reclaim_on_renew(self.lock.reclaim_on_renew)
    }
}
