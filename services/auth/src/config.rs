//! Service-level configuration

use std::net::SocketAddr;
use std::time::Duration;

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
}

impl ServerConfig {
    /// Create a new ServerConfig from environment variables
    ///
    /// # Environment Variables
    /// - `AUTH_BIND_ADDRESS`: Listen address (default: "0.0.0.0:3000")
    pub fn from_env() -> anyhow::Result<Self> {
        let raw = std::env::var("AUTH_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid AUTH_BIND_ADDRESS '{}': {}", raw, e))?;

        Ok(ServerConfig { bind_address })
    }
}

/// Realtime connection configuration
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Minimum spacing between presence writes for one connection
    pub user_online_update_interval: Duration,
}

impl RealtimeConfig {
    /// Create a new RealtimeConfig from environment variables
    ///
    /// # Environment Variables
    /// - `USER_ONLINE_UPDATE_INTERVAL`: Seconds between last-online updates (default: 120)
    pub fn from_env() -> anyhow::Result<Self> {
        let seconds = std::env::var("USER_ONLINE_UPDATE_INTERVAL")
            .unwrap_or_else(|_| "120".to_string())
            .parse()
            .unwrap_or(120);

        Ok(RealtimeConfig {
            user_online_update_interval: Duration::from_secs(seconds),
        })
    }
}
