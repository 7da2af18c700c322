//! Latchkey File - locks backed by OS advisory file locks
//!
//! One `<name>.lock` file per lock name under a directory, locked with an
//! exclusive advisory lock on the open handle. Local callers are arbitrated by
//! the same [`DistributedMutex`] as the network backends; attempts blocked by
//! another process are retried on a fixed interval.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, info};

use latchkey_common::{LockError, LockOptions, ReleaseOutcome, Result};
use latchkey_core::{BackendKind, DistributedMutex, LockBackend, LockRegistry};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Lock backend over one lock file per name
#[derive(Debug)]
pub struct FileLockBackend {
    dir: PathBuf,
    files: Mutex<HashMap<String, Arc<File>>>,
}

impl FileLockBackend {
    /// Use `dir` for lock files, creating it if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", name))
    }

    fn file_for(&self, name: &str) -> Result<Arc<File>> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(LockError::Config(format!(
                "'{}' cannot be used as a lock file name",
                name
            )));
        }

        let mut files = self.files.lock();
        if let Some(file) = files.get(name) {
            return Ok(file.clone());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path(name))?;
        let file = Arc::new(file);
        files.insert(name.to_string(), file.clone());
        Ok(file)
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == fs2::lock_contended_error().kind()
}

#[async_trait]
impl LockBackend for FileLockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    async fn try_acquire(&self, name: &str, _opts: &LockOptions) -> Result<()> {
        let file = self.file_for(name)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(()),
            Err(err) if is_contended(&err) => Err(LockError::not_acquired(name)),
            Err(err) => Err(err.into()),
        }
    }

    async fn release(&self, name: &str, _opts: &LockOptions) -> Result<ReleaseOutcome> {
        let file = match self.files.lock().get(name) {
            Some(file) => file.clone(),
            None => return Ok(ReleaseOutcome::AlreadyGone),
        };
        FileExt::unlock(&*file)?;
        Ok(ReleaseOutcome::Released)
    }

    async fn renew(&self, _name: &str, _opts: &LockOptions) -> Result<bool> {
        Ok(true)
    }

    /// The lock lives as long as the open handle, so holding it locally is enough
    async fn reassert(&self, name: &str, _opts: &LockOptions) -> Result<bool> {
        Ok(self.files.lock().contains_key(name))
    }
}

/// Registry of file-backed mutexes under one directory
#[derive(Debug)]
pub struct FileLockRegistry {
    backend: Arc<FileLockBackend>,
    registry: LockRegistry,
}

impl FileLockRegistry {
    /// Open a registry retrying contended locks every second
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_retry_interval(dir, DEFAULT_RETRY_INTERVAL)
    }

    pub fn with_retry_interval(dir: impl Into<PathBuf>, retry_interval: Duration) -> Result<Self> {
        let backend = Arc::new(FileLockBackend::open(dir)?);
        info!(dir = %backend.dir().display(), "File lock registry opened");

        let defaults = LockOptions::new().with_retry_delay(retry_interval);
        let registry = LockRegistry::single(backend.clone(), defaults);
        Ok(Self { backend, registry })
    }

    pub fn mutex(&self, name: &str) -> Arc<DistributedMutex> {
        debug!(name = %name, "Resolving file mutex");
        self.registry.mutex(name)
    }

    pub fn dir(&self) -> &Path {
        self.backend.dir()
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.backend.lock_path(name)
    }

    pub fn retry_interval(&self) -> Duration {
        self.registry.defaults().retry_delay
    }
}
