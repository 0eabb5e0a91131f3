//! Redis cache module for the Joy Kunga application
//!
//! This module provides functionality for connecting to Redis, performing
//! key operations with absolute or relative expiry, and subscribing to
//! keyspace notifications. Every round trip runs under a deadline.

use std::future::Future;
use std::time::Duration;

use redis::aio::{MultiplexedConnection, PubSub};
use redis::{AsyncCommands, Client, IntoConnectionInfo};
use tracing::{info, warn};

use crate::error::{CacheError, CacheResult};

/// Configuration for Redis connection
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Logical database index; keyspace channels are scoped to it
    pub db_index: i64,
    /// Deadline applied to every command round trip
    pub operation_timeout: Duration,
}

impl RedisConfig {
    /// Create a new RedisConfig from environment variables
    ///
    /// # Environment Variables
    /// - `REDIS_URL`: Redis connection URL (default: "redis://localhost:6379")
    /// - `REDIS_DB_INDEX`: Logical database index (default: 0)
    /// - `REDIS_OPERATION_TIMEOUT_MS`: Per-command deadline in milliseconds (default: 2000)
    pub fn from_env() -> anyhow::Result<Self> {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let db_index = std::env::var("REDIS_DB_INDEX")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .unwrap_or(0);
        let timeout_ms = std::env::var("REDIS_OPERATION_TIMEOUT_MS")
            .unwrap_or_else(|_| "2000".to_string())
            .parse()
            .unwrap_or(2000);

        Ok(RedisConfig {
            url,
            db_index,
            operation_timeout: Duration::from_millis(timeout_ms),
        })
    }

    /// Keyspace notification channel pattern for keys matching `key_pattern`
    pub fn keyspace_channel(&self, key_pattern: &str) -> String {
        format!("__keyspace@{}__:{}", self.db_index, key_pattern)
    }
}

/// Redis connection handle
///
/// Clones share one multiplexed connection.
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
    connection: MultiplexedConnection,
    config: RedisConfig,
}

impl RedisPool {
    /// Connect to Redis using the given configuration
    pub async fn new(config: &RedisConfig) -> CacheResult<Self> {
        let mut info = config
            .url
            .as_str()
            .into_connection_info()
            .map_err(CacheError::Connection)?;
        info.redis.db = config.db_index;

        let client = Client::open(info).map_err(CacheError::Connection)?;
        let connection = tokio::time::timeout(
            config.operation_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| CacheError::Timeout(config.operation_timeout))?
        .map_err(CacheError::Connection)?;

        info!(
            "Redis client initialized with URL: {} (db {})",
            config.url, config.db_index
        );
        Ok(RedisPool {
            client,
            connection,
            config: config.clone(),
        })
    }

    /// The configuration this pool was opened with
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    async fn with_deadline<T, F>(&self, operation: F) -> CacheResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.operation_timeout, operation).await {
            Ok(result) => result.map_err(CacheError::Command),
            Err(_) => Err(CacheError::Timeout(self.config.operation_timeout)),
        }
    }

    /// Set a key-value pair in Redis without expiry
    pub async fn set(&self, key: &str, value: &str) -> CacheResult<()> {
        let mut conn = self.connection.clone();
        self.with_deadline(conn.set(key, value)).await
    }

    /// Set a key-value pair that expires at an absolute unix timestamp (seconds)
    pub async fn set_expire_at(&self, key: &str, value: &str, unix_seconds: i64) -> CacheResult<()> {
        let mut conn = self.connection.clone();
        let reply: String = self
            .with_deadline(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("EXAT")
                    .arg(unix_seconds)
                    .query_async(&mut conn),
            )
            .await?;

        if reply == "OK" {
            Ok(())
        } else {
            Err(CacheError::Protocol(format!("SET {key} replied {reply}")))
        }
    }

    /// Like [`RedisPool::set_expire_at`], but only overwrites a key that
    /// already exists (`SET .. XX`). Returns whether the write happened.
    pub async fn set_expire_at_if_exists(
        &self,
        key: &str,
        value: &str,
        unix_seconds: i64,
    ) -> CacheResult<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = self
            .with_deadline(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("XX")
                    .arg("EXAT")
                    .arg(unix_seconds)
                    .query_async(&mut conn),
            )
            .await?;

        match reply.as_deref() {
            Some("OK") => Ok(true),
            None => Ok(false),
            Some(other) => Err(CacheError::Protocol(format!("SET XX {key} replied {other}"))),
        }
    }

    /// Get a value from Redis by key
    pub async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.connection.clone();
        self.with_deadline(conn.get(key)).await
    }

    /// Check whether a key exists
    pub async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.connection.clone();
        self.with_deadline(conn.exists(key)).await
    }

    /// Delete a key from Redis, returning whether it existed
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.connection.clone();
        let removed: u64 = self.with_deadline(conn.del(key)).await?;
        Ok(removed > 0)
    }

    /// Check if Redis is reachable
    pub async fn health_check(&self) -> CacheResult<bool> {
        let mut conn = self.connection.clone();
        let pong: String = self
            .with_deadline(redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(pong == "PONG")
    }

    /// Ask the server to publish keyspace notifications for the given event classes
    ///
    /// Managed deployments often forbid `CONFIG SET`; in that case the
    /// notifications must be enabled out of band and this only logs.
    pub async fn enable_keyspace_events(&self, classes: &str) -> CacheResult<()> {
        let mut conn = self.connection.clone();
        let result: CacheResult<String> = self
            .with_deadline(
                redis::cmd("CONFIG")
                    .arg("SET")
                    .arg("notify-keyspace-events")
                    .arg(classes)
                    .query_async(&mut conn),
            )
            .await;

        match result {
            Ok(reply) if reply == "OK" => {
                info!("Enabled Redis keyspace notifications: {}", classes);
                Ok(())
            }
            Ok(reply) => Err(CacheError::Protocol(format!("CONFIG SET replied {reply}"))),
            Err(CacheError::Timeout(d)) => Err(CacheError::Timeout(d)),
            Err(e) => {
                warn!("Could not enable keyspace notifications, relying on server config: {}", e);
                Ok(())
            }
        }
    }

    /// Open a dedicated pub/sub connection subscribed to a channel pattern
    pub async fn psubscribe(&self, channel_pattern: &str) -> CacheResult<PubSub> {
        let mut pubsub = tokio::time::timeout(
            self.config.operation_timeout,
            self.client.get_async_pubsub(),
        )
        .await
        .map_err(|_| CacheError::Timeout(self.config.operation_timeout))?
        .map_err(CacheError::Connection)?;

        self.with_deadline(pubsub.psubscribe(channel_pattern)).await?;
        info!("Subscribed to Redis channel pattern: {}", channel_pattern);
        Ok(pubsub)
    }
}
