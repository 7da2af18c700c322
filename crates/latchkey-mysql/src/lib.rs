//! Latchkey MySQL - advisory locks over a pinned MySQL session
//!
//! `GET_LOCK` and `RELEASE_LOCK` are scoped to the session that issued them,
//! so every client here owns a pool of exactly one physical connection that
//! is never recycled while the process runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, Statement,
};
use tracing::info;

use latchkey_common::{LockError, Result};
use latchkey_core::{AdvisoryClient, AdvisoryLockBackend, LockBackend};

const GET_LOCK_SQL: &str = "SELECT GET_LOCK(?, ?) AS reply";
const RELEASE_LOCK_SQL: &str = "SELECT RELEASE_LOCK(?) AS reply";

/// Idle timeout and max lifetime for the pinned connection. Recycling the
/// connection would silently drop every advisory lock it holds.
const PINNED_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(8);

/// Advisory lock client bound to a single MySQL session
#[derive(Debug, Clone)]
pub struct MySqlAdvisoryClient {
    db: DatabaseConnection,
}

impl MySqlAdvisoryClient {
    /// Open a one-connection pool to `url`
    pub async fn connect(url: &str) -> Result<Self> {
        let mut opt = ConnectOptions::new(url.to_string());

        opt.max_connections(1)
            .min_connections(1)
            .connect_timeout(CONNECT_TIMEOUT)
            .idle_timeout(PINNED_LIFETIME)
            .max_lifetime(PINNED_LIFETIME)
            .sqlx_logging(false);

        let db = Database::connect(opt).await.map_err(LockError::backend)?;
        info!(max_connections = 1, "Advisory lock session connected");

        Ok(Self { db })
    }

    /// Wrap an existing connection; it must be limited to one physical session
    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn query_reply(&self, sql: &str, values: Vec<sea_orm::Value>) -> Result<Option<i64>> {
        let stmt = Statement::from_sql_and_values(DatabaseBackend::MySql, sql, values);
        let row = self
            .db
            .query_one(stmt)
            .await
            .map_err(LockError::backend)?;

        match row {
            Some(row) => row
                .try_get::<Option<i64>>("", "reply")
                .map_err(LockError::backend),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl AdvisoryClient for MySqlAdvisoryClient {
    async fn get_lock(&self, name: &str, wait_secs: u64) -> Result<Option<i64>> {
        let wait = i64::try_from(wait_secs).unwrap_or(i64::MAX);
        self.query_reply(GET_LOCK_SQL, vec![name.into(), wait.into()])
            .await
    }

    async fn release_lock(&self, name: &str) -> Result<Option<i64>> {
        self.query_reply(RELEASE_LOCK_SQL, vec![name.into()]).await
    }
}

/// Connect one pinned session per URL and wrap each as a lock backend
///
/// The result is the connection pool a `LockRegistry` hashes names over.
/// Any unreachable URL fails the whole call.
pub async fn connect_pool(urls: &[String]) -> Result<Vec<Arc<dyn LockBackend>>> {
    if urls.is_empty() {
        return Err(LockError::Config(
            "at least one MySQL url is required".to_string(),
        ));
    }

    let mut pool: Vec<Arc<dyn LockBackend>> = Vec::with_capacity(urls.len());
    for url in urls {
        let client = MySqlAdvisoryClient::connect(url).await?;
        pool.push(Arc::new(AdvisoryLockBackend::new(client)));
    }
    Ok(pool)
}
