//! Session ledger: which access token each session currently honours
//!
//! A record lives at `session:<user_id>:<session_id>` and expires at the
//! session token's own expiry. Its value names the current access token,
//! so rotating the access token atomically retires the previous one. The
//! store also publishes a change feed of expirations and deletions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::cache::RedisPool;
use common::{CacheError, CacheResult};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{CurrentAccess, LedgerEvent, LedgerEventKind, LedgerValue, SessionKey};

/// Stream of ledger change events
pub type LedgerFeed = BoxStream<'static, LedgerEvent>;

/// Keyspace notification classes needed by the change feed
/// (K: keyspace channel, x: expired, g: generic commands such as DEL)
const KEYSPACE_EVENT_CLASSES: &str = "Kxg";

/// Revocation ledger contract
///
/// Every method is a single-key operation; atomicity comes from the store.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Set the session's current access token (or the pending sentinel) and
    /// make the record expire exactly at `expires_at`. Last writer wins.
    async fn create_or_rotate(
        &self,
        key: &SessionKey,
        current: Option<&CurrentAccess>,
        expires_at: DateTime<Utc>,
    ) -> CacheResult<()>;

    /// Rotate the current access token of a session that is still present.
    /// Returns false, writing nothing, when the record is gone.
    async fn rotate_if_exists(
        &self,
        key: &SessionKey,
        current: &CurrentAccess,
        expires_at: DateTime<Utc>,
    ) -> CacheResult<bool>;

    /// Whether the session record is present
    async fn exists(&self, key: &SessionKey) -> CacheResult<bool>;

    /// Whether `access_id` is the session's current access token
    async fn is_access_token_current(&self, key: &SessionKey, access_id: Uuid) -> CacheResult<bool>;

    /// Remove the record; returns whether one was present
    async fn delete(&self, key: &SessionKey) -> CacheResult<bool>;

    /// Subscribe to expirations and deletions. The subscription is live
    /// once this returns.
    async fn subscribe(&self) -> CacheResult<LedgerFeed>;

    /// Whether the backing store is reachable
    async fn health_check(&self) -> CacheResult<bool>;
}

/// Redis-backed ledger
#[derive(Clone)]
pub struct RedisSessionStore {
    redis_pool: RedisPool,
}

impl RedisSessionStore {
    pub fn new(redis_pool: RedisPool) -> Self {
        Self { redis_pool }
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create_or_rotate(
        &self,
        key: &SessionKey,
        current: Option<&CurrentAccess>,
        expires_at: DateTime<Utc>,
    ) -> CacheResult<()> {
        let value = LedgerValue::encode(current);
        debug!("Storing session {} -> {}", key, value);
        self.redis_pool
            .set_expire_at(&key.to_string(), &value, expires_at.timestamp())
            .await
    }

    async fn rotate_if_exists(
        &self,
        key: &SessionKey,
        current: &CurrentAccess,
        expires_at: DateTime<Utc>,
    ) -> CacheResult<bool> {
        let value = LedgerValue::encode(Some(current));
        debug!("Rotating session {} -> {}", key, value);
        self.redis_pool
            .set_expire_at_if_exists(&key.to_string(), &value, expires_at.timestamp())
            .await
    }

    async fn exists(&self, key: &SessionKey) -> CacheResult<bool> {
        self.redis_pool.exists(&key.to_string()).await
    }

    async fn is_access_token_current(&self, key: &SessionKey, access_id: Uuid) -> CacheResult<bool> {
        let Some(raw) = self.redis_pool.get(&key.to_string()).await? else {
            return Ok(false);
        };
        match LedgerValue::decode(&raw) {
            Some(value) => Ok(value.is_current(access_id)),
            None => Err(CacheError::Protocol(format!(
                "unrecognised ledger value for {key}"
            ))),
        }
    }

    async fn delete(&self, key: &SessionKey) -> CacheResult<bool> {
        let removed = self.redis_pool.delete(&key.to_string()).await?;
        info!("Deleted session {} (present: {})", key, removed);
        Ok(removed)
    }

    async fn subscribe(&self) -> CacheResult<LedgerFeed> {
        self.redis_pool
            .enable_keyspace_events(KEYSPACE_EVENT_CLASSES)
            .await?;

        let pattern = self.redis_pool.config().keyspace_channel("session:*");
        let pubsub = self.redis_pool.psubscribe(&pattern).await?;

        let feed = pubsub.into_on_message().filter_map(|message| async move {
            let channel = message.get_channel_name().to_string();
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Unreadable keyspace notification on {}: {}", channel, e);
                    return None;
                }
            };
            let kind = LedgerEventKind::from_notification(&payload)?;
            match SessionKey::from_keyspace_channel(&channel) {
                Some(key) => Some(LedgerEvent { key, kind }),
                None => {
                    warn!("Ignoring notification for malformed key channel {}", channel);
                    None
                }
            }
        });

        Ok(feed.boxed())
    }

    async fn health_check(&self) -> CacheResult<bool> {
        self.redis_pool.health_check().await
    }
}

#[derive(Debug, Clone)]
struct MemoryRecord {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-process ledger with the same contract as [`RedisSessionStore`]
///
/// Records past their expiry are treated as absent. They are removed when
/// next touched or by [`MemorySessionStore::sweep_expired`], and each removal
/// publishes an `Expired` event, mirroring Redis' own expiry notifications.
/// Outside tests, run [`MemorySessionStore::spawn_sweeper`] so that expiry
/// is published without waiting for a lookup.
#[derive(Clone)]
pub struct MemorySessionStore {
    records: Arc<Mutex<HashMap<SessionKey, MemoryRecord>>>,
    events: broadcast::Sender<LedgerEvent>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    fn publish(&self, key: SessionKey, kind: LedgerEventKind) {
        // No subscribers is fine
        let _ = self.events.send(LedgerEvent { key, kind });
    }

    /// Look up a live record, expiring it first if its time has passed
    async fn live_value(&self, key: &SessionKey) -> Option<String> {
        let mut records = self.records.lock().await;
        let (value, expired) = records
            .get(key)
            .map(|record| (record.value.clone(), record.expires_at <= Utc::now()))?;
        if expired {
            records.remove(key);
            drop(records);
            self.publish(*key, LedgerEventKind::Expired);
            return None;
        }
        Some(value)
    }

    /// Sweep expired records every `period` on a background task
    pub fn spawn_sweeper(&self, period: std::time::Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep_expired().await;
            }
        })
    }

    /// Remove every record whose expiry has passed, returning how many
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<SessionKey> = {
            let mut records = self.records.lock().await;
            let keys: Vec<SessionKey> = records
                .iter()
                .filter(|(_, record)| record.expires_at <= now)
                .map(|(key, _)| *key)
                .collect();
            for key in &keys {
                records.remove(key);
            }
            keys
        };

        for key in &expired {
            self.publish(*key, LedgerEventKind::Expired);
        }
        if !expired.is_empty() {
            debug!("Swept {} expired sessions", expired.len());
        }
        expired.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_or_rotate(
        &self,
        key: &SessionKey,
        current: Option<&CurrentAccess>,
        expires_at: DateTime<Utc>,
    ) -> CacheResult<()> {
        let record = MemoryRecord {
            value: LedgerValue::encode(current),
            expires_at,
        };
        self.records.lock().await.insert(*key, record);
        Ok(())
    }

    async fn rotate_if_exists(
        &self,
        key: &SessionKey,
        current: &CurrentAccess,
        expires_at: DateTime<Utc>,
    ) -> CacheResult<bool> {
        let mut records = self.records.lock().await;
        let expired = match records.get(key) {
            None => return Ok(false),
            Some(record) => record.expires_at <= Utc::now(),
        };
        if expired {
            records.remove(key);
            drop(records);
            self.publish(*key, LedgerEventKind::Expired);
            return Ok(false);
        }

        let record = MemoryRecord {
            value: LedgerValue::encode(Some(current)),
            expires_at,
        };
        records.insert(*key, record);
        Ok(true)
    }

    async fn exists(&self, key: &SessionKey) -> CacheResult<bool> {
        Ok(self.live_value(key).await.is_some())
    }

    async fn is_access_token_current(&self, key: &SessionKey, access_id: Uuid) -> CacheResult<bool> {
        Ok(self
            .live_value(key)
            .await
            .and_then(|raw| LedgerValue::decode(&raw))
            .is_some_and(|value| value.is_current(access_id)))
    }

    async fn delete(&self, key: &SessionKey) -> CacheResult<bool> {
        if self.live_value(key).await.is_none() {
            return Ok(false);
        }
        let removed = self.records.lock().await.remove(key).is_some();
        if removed {
            self.publish(*key, LedgerEventKind::Deleted);
        }
        Ok(removed)
    }

    async fn subscribe(&self) -> CacheResult<LedgerFeed> {
        let receiver = self.events.subscribe();
        let feed = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Ledger feed lagged, {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(feed.boxed())
    }

    async fn health_check(&self) -> CacheResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn access(expires_in: i64) -> CurrentAccess {
        CurrentAccess {
            access_id: Uuid::new_v4(),
            expires_at: Utc::now() + Duration::seconds(expires_in),
        }
    }

    fn key() -> SessionKey {
        SessionKey::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[tokio::test]
    async fn rotation_supersedes_previous_access_token() {
        let store = MemorySessionStore::new();
        let key = key();
        let session_expiry = Utc::now() + Duration::days(1);

        let first = access(60);
        store.create_or_rotate(&key, Some(&first), session_expiry).await.unwrap();
        assert!(store.is_access_token_current(&key, first.access_id).await.unwrap());

        let second = access(60);
        store.create_or_rotate(&key, Some(&second), session_expiry).await.unwrap();
        assert!(!store.is_access_token_current(&key, first.access_id).await.unwrap());
        assert!(store.is_access_token_current(&key, second.access_id).await.unwrap());
    }

    #[tokio::test]
    async fn conditional_rotation_does_not_resurrect_a_deleted_session() {
        let store = MemorySessionStore::new();
        let key = key();
        let session_expiry = Utc::now() + Duration::days(1);
        store.create_or_rotate(&key, Some(&access(60)), session_expiry).await.unwrap();

        let next = access(60);
        assert!(store.rotate_if_exists(&key, &next, session_expiry).await.unwrap());
        assert!(store.is_access_token_current(&key, next.access_id).await.unwrap());

        store.delete(&key).await.unwrap();
        let late = access(60);
        assert!(!store.rotate_if_exists(&key, &late, session_expiry).await.unwrap());
        assert!(!store.exists(&key).await.unwrap());
        assert!(!store.is_access_token_current(&key, late.access_id).await.unwrap());
    }

    #[tokio::test]
    async fn sweeper_publishes_expiry_without_lookups() {
        let store = MemorySessionStore::new();
        let mut feed = store.subscribe().await.unwrap();
        let key = key();
        store
            .create_or_rotate(&key, None, Utc::now() + Duration::milliseconds(50))
            .await
            .unwrap();

        let sweeper = store.spawn_sweeper(std::time::Duration::from_millis(20));
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), feed.next())
            .await
            .expect("expiry was never published")
            .unwrap();
        assert_eq!(event.key, key);
        assert_eq!(event.kind, LedgerEventKind::Expired);
        sweeper.abort();
    }

    #[tokio::test]
    async fn pending_session_exists_but_honours_no_token() {
        let store = MemorySessionStore::new();
        let key = key();
        store
            .create_or_rotate(&key, None, Utc::now() + Duration::days(1))
            .await
            .unwrap();

        assert!(store.exists(&key).await.unwrap());
        assert!(!store.is_access_token_current(&key, Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_published_once() {
        let store = MemorySessionStore::new();
        let mut feed = store.subscribe().await.unwrap();
        let key = key();
        store
            .create_or_rotate(&key, Some(&access(60)), Utc::now() + Duration::days(1))
            .await
            .unwrap();

        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
        assert!(!store.exists(&key).await.unwrap());

        let event = feed.next().await.unwrap();
        assert_eq!(
            event,
            LedgerEvent {
                key,
                kind: LedgerEventKind::Deleted
            }
        );
    }

    #[tokio::test]
    async fn expired_records_vanish_and_publish_expiry() {
        let store = MemorySessionStore::new();
        let mut feed = store.subscribe().await.unwrap();
        let stale = key();
        let live = key();
        store
            .create_or_rotate(&stale, None, Utc::now() - Duration::seconds(1))
            .await
            .unwrap();
        store
            .create_or_rotate(&live, None, Utc::now() + Duration::days(1))
            .await
            .unwrap();

        assert_eq!(store.sweep_expired().await, 1);
        assert!(!store.exists(&stale).await.unwrap());
        assert!(store.exists(&live).await.unwrap());

        let event = feed.next().await.unwrap();
        assert_eq!(event.key, stale);
        assert_eq!(event.kind, LedgerEventKind::Expired);
    }

    #[tokio::test]
    async fn lookups_expire_lazily() {
        let store = MemorySessionStore::new();
        let mut feed = store.subscribe().await.unwrap();
        let key = key();
        let current = access(60);
        store
            .create_or_rotate(&key, Some(&current), Utc::now() - Duration::seconds(1))
            .await
            .unwrap();

        assert!(!store.is_access_token_current(&key, current.access_id).await.unwrap());
        assert_eq!(feed.next().await.unwrap().kind, LedgerEventKind::Expired);
        assert!(!store.delete(&key).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis with CONFIG SET permitted"]
    async fn redis_store_round_trip() -> anyhow::Result<()> {
        let config = common::cache::RedisConfig::from_env()?;
        let store = RedisSessionStore::new(RedisPool::new(&config).await?);
        let mut feed = store.subscribe().await?;
        let key = key();

        let first = access(60);
        store
            .create_or_rotate(&key, Some(&first), Utc::now() + Duration::seconds(30))
            .await?;
        assert!(store.is_access_token_current(&key, first.access_id).await?);

        let second = access(60);
        store
            .create_or_rotate(&key, Some(&second), Utc::now() + Duration::seconds(30))
            .await?;
        assert!(!store.is_access_token_current(&key, first.access_id).await?);

        assert!(store.delete(&key).await?);
        assert!(
            !store
                .rotate_if_exists(&key, &access(60), Utc::now() + Duration::seconds(30))
                .await?
        );
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), feed.next())
            .await?
            .expect("feed closed");
        assert_eq!(event.key, key);
        assert_eq!(event.kind, LedgerEventKind::Deleted);
        Ok(())
    }
}
