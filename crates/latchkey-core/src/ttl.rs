//! TTL key-value backend adapter
//!
//! A lock is a key holding the owner's token with an expiry. All three
//! operations run as single server-side scripts so no check-then-act race is
//! possible against a concurrent acquirer.

use std::sync::Arc;

use async_trait::async_trait;

use latchkey_common::{LockError, LockOptions, ReleaseOutcome, Result};

use crate::backend::{BackendKind, LockBackend};

/// `SET key value PX ms NX`; 1 when created, 0 when the key exists
pub const ACQUIRE_SCRIPT: &str = r#"
if redis.call("SET", KEYS[1], ARGV[1], "PX", ARGV[2], "NX") then
    return 1
else
    return 0
end
"#;

/// Delete only when the stored token matches; -1 when the key is absent,
/// 0 when someone else owns it
pub const RELEASE_SCRIPT: &str = r#"
local val = redis.call("GET", KEYS[1])
if val == ARGV[1] then
    return redis.call("DEL", KEYS[1])
elseif val == false then
    return -1
else
    return 0
end
"#;

/// Extend the expiry only when the stored token matches. With ARGV[3] == "1"
/// a vanished key is re-created.
pub const RENEW_SCRIPT: &str = r#"
local val = redis.call("GET", KEYS[1])
if val == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
elseif val == false and ARGV[3] == "1" then
    if redis.call("SET", KEYS[1], ARGV[1], "PX", ARGV[2], "NX") then
        return 1
    end
    return 0
else
    return 0
end
"#;

/// Raw script replies from a TTL key-value store
#[async_trait]
pub trait ScriptClient: Send + Sync {
    async fn acquire(&self, key: &str, value: &str, ttl_ms: u64) -> Result<i64>;

    async fn release(&self, key: &str, value: &str) -> Result<i64>;

    async fn renew(&self, key: &str, value: &str, ttl_ms: u64, reclaim: bool) -> Result<i64>;
}

#[async_trait]
impl<T: ScriptClient + ?Sized> ScriptClient for Arc<T> {
    async fn acquire(&self, key: &str, value: &str, ttl_ms: u64) -> Result<i64> {
        (**self).acquire(key, value, ttl_ms).await
    }

    async fn release(&self, key: &str, value: &str) -> Result<i64> {
        (**self).release(key, value).await
    }

    async fn renew(&self, key: &str, value: &str, ttl_ms: u64, reclaim: bool) -> Result<i64> {
        (**self).renew(key, value, ttl_ms, reclaim).await
    }
}

/// [`LockBackend`] over a [`ScriptClient`]
pub struct TtlLockBackend<C> {
    client: C,
}

impl<C: ScriptClient> TtlLockBackend<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

#[async_trait]
impl<C: ScriptClient> LockBackend for TtlLockBackend<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::Ttl
    }

    async fn try_acquire(&self, name: &str, opts: &LockOptions) -> Result<()> {
        match self
            .client
            .acquire(name, &opts.value, opts.expiry_millis())
            .await?
        {
            1 => Ok(()),
            0 => Err(LockError::not_acquired(name)),
            reply => Err(LockError::UnexpectedReply {
                op: "acquire",
                reply: reply.to_string(),
            }),
        }
    }

    async fn release(&self, name: &str, opts: &LockOptions) -> Result<ReleaseOutcome> {
        match self.client.release(name, &opts.value).await? {
            -1 => Ok(ReleaseOutcome::AlreadyGone),
            0 => Ok(ReleaseOutcome::NotOwner),
            n if n > 0 => Ok(ReleaseOutcome::Released),
            reply => Err(LockError::UnexpectedReply {
                op: "release",
                reply: reply.to_string(),
            }),
        }
    }

    async fn renew(&self, name: &str, opts: &LockOptions) -> Result<bool> {
        let reply = self
            .client
            .renew(
                name,
                &opts.value,
                opts.expiry_millis(),
                opts.reclaim_on_renew,
            )
            .await?;
        Ok(reply == 1)
    }

    async fn reassert(&self, name: &str, opts: &LockOptions) -> Result<bool> {
        self.renew(name, opts).await
    }
}
