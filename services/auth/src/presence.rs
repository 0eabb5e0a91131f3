//! Last-online tracking for realtime users

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use common::cache::RedisPool;
use common::{CacheError, CacheResult};
use parking_lot::RwLock;
use uuid::Uuid;

const LAST_ONLINE_PREFIX: &str = "last_online";

fn last_online_key(user_id: Uuid) -> String {
    format!("{LAST_ONLINE_PREFIX}:{user_id}")
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Record that the user was seen online at `at`
    async fn set_last_online(&self, user_id: Uuid, at: DateTime<Utc>) -> CacheResult<()>;

    /// Last recorded online instant, if any
    async fn last_online(&self, user_id: Uuid) -> CacheResult<Option<DateTime<Utc>>>;
}

/// Presence kept in Redis as `last_online:<user_id>` -> unix seconds
#[derive(Clone)]
pub struct RedisPresenceStore {
    redis_pool: RedisPool,
}

impl RedisPresenceStore {
    pub fn new(redis_pool: RedisPool) -> Self {
        Self { redis_pool }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set_last_online(&self, user_id: Uuid, at: DateTime<Utc>) -> CacheResult<()> {
        self.redis_pool
            .set(&last_online_key(user_id), &at.timestamp().to_string())
            .await
    }

    async fn last_online(&self, user_id: Uuid) -> CacheResult<Option<DateTime<Utc>>> {
        let Some(raw) = self.redis_pool.get(&last_online_key(user_id)).await? else {
            return Ok(None);
        };
        let seconds: i64 = raw
            .parse()
            .map_err(|_| CacheError::Protocol(format!("invalid last_online value '{raw}'")))?;
        Utc.timestamp_opt(seconds, 0)
            .single()
            .map(Some)
            .ok_or_else(|| CacheError::Protocol(format!("last_online out of range: {seconds}")))
    }
}

#[derive(Clone, Default)]
pub struct MemoryPresenceStore {
    seen: Arc<RwLock<HashMap<Uuid, DateTime<Utc>>>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_last_online(&self, user_id: Uuid, at: DateTime<Utc>) -> CacheResult<()> {
        self.seen.write().insert(user_id, at);
        Ok(())
    }

    async fn last_online(&self, user_id: Uuid) -> CacheResult<Option<DateTime<Utc>>> {
        Ok(self.seen.read().get(&user_id).copied())
    }
}
