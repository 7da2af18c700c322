//! Latchkey Redis - TTL leases on a Redis-compatible store
//!
//! Runs the acquire, release and renew scripts from `latchkey_core::ttl`
//! through `EVALSHA`, falling back to `EVAL` when the script cache is cold.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::info;

use latchkey_common::{LockError, Result};
use latchkey_core::ttl::{ACQUIRE_SCRIPT, RELEASE_SCRIPT, RENEW_SCRIPT};
use latchkey_core::{LockBackend, ScriptClient, TtlLockBackend};

/// Script client over a reconnecting Redis connection
#[derive(Clone)]
pub struct RedisScriptClient {
    conn: ConnectionManager,
    acquire: Arc<Script>,
    release: Arc<Script>,
    renew: Arc<Script>,
}

impl std::fmt::Debug for RedisScriptClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisScriptClient")
            .field("acquire", &self.acquire.get_hash())
            .field("release", &self.release.get_hash())
            .field("renew", &self.renew.get_hash())
            .finish()
    }
}

impl RedisScriptClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(LockError::backend)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(LockError::backend)?;
        info!("Lease store connected");
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            acquire: Arc::new(Script::new(ACQUIRE_SCRIPT)),
            release: Arc::new(Script::new(RELEASE_SCRIPT)),
            renew: Arc::new(Script::new(RENEW_SCRIPT)),
        }
    }
}

#[async_trait]
impl ScriptClient for RedisScriptClient {
    async fn acquire(&self, key: &str, value: &str, ttl_ms: u64) -> Result<i64> {
        let mut conn = self.conn.clone();
        self.acquire
            .key(key)
            .arg(value)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(LockError::backend)
    }

    async fn release(&self, key: &str, value: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        self.release
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(LockError::backend)
    }

    async fn renew(&self, key: &str, value: &str, ttl_ms: u64, reclaim: bool) -> Result<i64> {
        let mut conn = self.conn.clone();
        self.renew
            .key(key)
            .arg(value)
            .arg(ttl_ms)
            .arg(if reclaim { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(LockError::backend)
    }
}

/// Connect one client per URL and wrap each as a lock backend
pub async fn connect_pool(urls: &[String]) -> Result<Vec<Arc<dyn LockBackend>>> {
    if urls.is_empty() {
        return Err(LockError::Config(
            "at least one Redis url is required".to_string(),
        ));
    }

    let mut pool: Vec<Arc<dyn LockBackend>> = Vec::with_capacity(urls.len());
    for url in urls {
        let client = RedisScriptClient::connect(url).await?;
        pool.push(Arc::new(TtlLockBackend::new(client)));
    }
    Ok(pool)
}
