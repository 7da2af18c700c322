//! Lock registry
//!
//! Maps a lock name to one sticky backend connection and one
//! [`DistributedMutex`]. The backend slot is `md5(name) mod pool size`, fixed
//! for the registry's lifetime. Mutexes are created lazily and never evicted,
//! so every caller for a name shares the same waiter count and wakeup slot.

use std::collections::HashMap;
use std::sync::Arc;

use md5::{Digest, Md5};
use parking_lot::Mutex;
use tracing::info;

use latchkey_common::{LockError, LockOptions, Result};

use crate::backend::LockBackend;
use crate::mutex::DistributedMutex;

pub struct LockRegistry {
    pool: Vec<Arc<dyn LockBackend>>,
    defaults: LockOptions,
    locks: Mutex<HashMap<String, Arc<DistributedMutex>>>,
}

impl std::fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRegistry")
            .field("pool_size", &self.pool.len())
            .field("locks", &self.len())
            .finish()
    }
}

impl LockRegistry {
    /// Build a registry over a fixed pool of backend connections
    ///
    /// `defaults` become the stored options of every mutex created through
    /// [`LockRegistry::mutex`].
    pub fn new(pool: Vec<Arc<dyn LockBackend>>, defaults: LockOptions) -> Result<Self> {
        if pool.is_empty() {
            return Err(LockError::Config(
                "lock registry needs at least one backend connection".to_string(),
            ));
        }
        Ok(Self {
            pool,
            defaults,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Registry over a single backend connection
    pub fn single(backend: Arc<dyn LockBackend>, defaults: LockOptions) -> Self {
        Self {
            pool: vec![backend],
            defaults,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn mutex(&self, name: &str) -> Arc<DistributedMutex> {
        self.mutex_with(name, &self.defaults)
    }

    /// Get or create the mutex for `name`
    ///
    /// `options` only apply when this call creates the mutex; later calls get
    /// the existing instance with its original options.
    pub fn mutex_with(&self, name: &str, options: &LockOptions) -> Arc<DistributedMutex> {
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(name) {
            return existing.clone();
        }

        let slot = slot_for(name, self.pool.len());
        let backend = self.pool[slot].clone();
        info!(name = %name, slot, backend = %backend.kind(), "Creating distributed mutex");

        let mutex = Arc::new(DistributedMutex::new(name, backend, options.clone()));
        locks.insert(name.to_string(), mutex.clone());
        mutex
    }

    pub fn get(&self, name: &str) -> Option<Arc<DistributedMutex>> {
        self.locks.lock().get(name).cloned()
    }

    pub fn defaults(&self) -> &LockOptions {
        &self.defaults
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// Number of mutexes created so far
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pool slot for a lock name
pub fn slot_for(name: &str, pool_size: usize) -> usize {
    if pool_size <= 1 {
        return 0;
    }
    let digest = Md5::digest(name.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % pool_size as u64) as usize
}
