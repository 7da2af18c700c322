//! In-memory backends
//!
//! `MemoryKvStore` runs the TTL scripts against a shared map with expiries on
//! the tokio clock; `MemoryAdvisoryServer` models session-scoped advisory
//! locks with nested acquisition counting. Both hand out client handles that
//! can be made unreachable to simulate outages.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};

use latchkey_common::{LockError, Result};

use crate::advisory::AdvisoryClient;
use crate::ttl::ScriptClient;

fn connection_refused() -> LockError {
    LockError::backend(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "backend unreachable",
    ))
}

// ============================================================================
// TTL key-value store
// ============================================================================

struct KvEntry {
    value: String,
    expires_at: Instant,
}

/// Shared in-memory key-value store with per-key expiry
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    entries: Arc<Mutex<HashMap<String, KvEntry>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new connection to this store
    pub fn client(&self) -> Arc<MemoryKvClient> {
        Arc::new(MemoryKvClient {
            store: self.clone(),
            unreachable: AtomicBool::new(false),
        })
    }

    /// Current value of `key`, ignoring expired entries
    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        Self::live(&mut entries, key).map(|entry| entry.value.clone())
    }

    /// Remaining lease of `key`
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut entries = self.entries.lock();
        Self::live(&mut entries, key).map(|entry| entry.expires_at - Instant::now())
    }

    /// Drop every key, as a store restart without persistence would
    pub fn flush(&self) {
        self.entries.lock().clear();
    }

    fn live<'a>(entries: &'a mut HashMap<String, KvEntry>, key: &str) -> Option<&'a mut KvEntry> {
        if entries
            .get(key)
            .is_some_and(|entry| entry.expires_at <= Instant::now())
        {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn set_nx(&self, key: &str, value: &str, ttl_ms: u64) -> bool {
        let mut entries = self.entries.lock();
        if Self::live(&mut entries, key).is_some() {
            return false;
        }
        entries.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: Instant::now() + Duration::from_millis(ttl_ms),
            },
        );
        true
    }

    fn compare_and_delete(&self, key: &str, value: &str) -> i64 {
        let mut entries = self.entries.lock();
        let owned = Self::live(&mut entries, key).map(|entry| entry.value == value);
        match owned {
            None => -1,
            Some(true) => {
                entries.remove(key);
                1
            }
            Some(false) => 0,
        }
    }

    fn compare_and_extend(&self, key: &str, value: &str, ttl_ms: u64, reclaim: bool) -> i64 {
        let mut entries = self.entries.lock();
        let expires_at = Instant::now() + Duration::from_millis(ttl_ms);
        if let Some(entry) = Self::live(&mut entries, key) {
            if entry.value != value {
                return 0;
            }
            entry.expires_at = expires_at;
            return 1;
        }
        if !reclaim {
            return 0;
        }
        entries.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        1
    }
}

/// One connection to a [`MemoryKvStore`]
pub struct MemoryKvClient {
    store: MemoryKvStore,
    unreachable: AtomicBool,
}

impl MemoryKvClient {
    /// Make every call on this connection fail with a transport error
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(connection_refused());
        }
        Ok(())
    }
}

#[async_trait]
impl ScriptClient for MemoryKvClient {
    async fn acquire(&self, key: &str, value: &str, ttl_ms: u64) -> Result<i64> {
        self.check()?;
        Ok(self.store.set_nx(key, value, ttl_ms) as i64)
    }

    async fn release(&self, key: &str, value: &str) -> Result<i64> {
        self.check()?;
        Ok(self.store.compare_and_delete(key, value))
    }

    async fn renew(&self, key: &str, value: &str, ttl_ms: u64, reclaim: bool) -> Result<i64> {
        self.check()?;
        Ok(self.store.compare_and_extend(key, value, ttl_ms, reclaim))
    }
}

// ============================================================================
// Advisory lock server
// ============================================================================

struct AdvisoryHold {
    session: u64,
    depth: u32,
}

#[derive(Default)]
struct AdvisoryState {
    locks: Mutex<HashMap<String, AdvisoryHold>>,
    released: Notify,
    next_session: AtomicU64,
}

/// Advisory lock table shared by all sessions
#[derive(Clone, Default)]
pub struct MemoryAdvisoryServer {
    state: Arc<AdvisoryState>,
}

impl MemoryAdvisoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session; locks are scoped to it
    pub fn session(&self) -> Arc<MemoryAdvisorySession> {
        let id = self.state.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        Arc::new(MemoryAdvisorySession {
            id,
            state: self.state.clone(),
            unreachable: AtomicBool::new(false),
        })
    }

    /// Session currently holding `name`
    pub fn holder(&self, name: &str) -> Option<u64> {
        self.state.locks.lock().get(name).map(|hold| hold.session)
    }
}

/// One session on a [`MemoryAdvisoryServer`]
pub struct MemoryAdvisorySession {
    id: u64,
    state: Arc<AdvisoryState>,
    unreachable: AtomicBool,
}

impl MemoryAdvisorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Drop the session: its locks are freed and further calls fail
    pub fn disconnect(&self) {
        self.set_unreachable(true);
        self.state
            .locks
            .lock()
            .retain(|_, hold| hold.session != self.id);
        self.state.released.notify_waiters();
    }

    fn check(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(connection_refused());
        }
        Ok(())
    }

    fn try_take(&self, name: &str) -> bool {
        let mut locks = self.state.locks.lock();
        match locks.get_mut(name) {
            Some(hold) if hold.session == self.id => {
                hold.depth += 1;
                true
            }
            Some(_) => false,
            None => {
                locks.insert(
                    name.to_string(),
                    AdvisoryHold {
                        session: self.id,
                        depth: 1,
                    },
                );
                true
            }
        }
    }
}

#[async_trait]
impl AdvisoryClient for MemoryAdvisorySession {
    async fn get_lock(&self, name: &str, wait_secs: u64) -> Result<Option<i64>> {
        self.check()?;
        let deadline = Instant::now() + Duration::from_secs(wait_secs);
        loop {
            let notified = self.state.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_take(name) {
                return Ok(Some(1));
            }
            if Instant::now() >= deadline {
                return Ok(Some(0));
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(deadline) => {}
            }
            self.check()?;
        }
    }

    async fn release_lock(&self, name: &str) -> Result<Option<i64>> {
        self.check()?;
        let mut locks = self.state.locks.lock();
        let reply = match locks.get_mut(name) {
            None => None,
            Some(hold) if hold.session != self.id => Some(0),
            Some(hold) => {
                hold.depth -= 1;
                if hold.depth == 0 {
                    locks.remove(name);
                    self.state.released.notify_waiters();
                }
                Some(1)
            }
        };
        Ok(reply)
    }
}
