//! Configuration module for the connector
//!
//! Values come from the environment (optionally seeded from `.env`), each
//! with a default.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::ApiCredentials;
use crate::error::{ConnectorError, Result};
use crate::exchange::{BinanceSettings, UpdateSpeed};
use crate::order::ExecutorSettings;
use crate::orderbook::BookSettings;
use crate::websocket::ReconnectPolicy;

/// Credentials for one trading account
#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub name: String,
    pub credentials: ApiCredentials,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Books created at startup (e.g., ["BTCUSDT", "ETHUSDT"])
    pub symbols: Vec<String>,

    /// Public market-data WebSocket base
    pub ws_endpoint: String,

    /// Authenticated WebSocket-API endpoint for orders
    pub ws_api_endpoint: String,

    /// REST API endpoint for snapshots
    pub rest_endpoint: String,

    /// IPC socket path for publishing data
    pub ipc_socket_path: String,

    pub update_speed: UpdateSpeed,

    /// Levels requested per snapshot
    pub snapshot_limit: u32,

    /// Capacity of each book's depth queue
    pub depth_queue_capacity: usize,

    /// Reconnection settings
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,

    pub rest_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub order_timeout_secs: u64,

    /// Port for /health and /metrics
    pub health_port: u16,

    pub accounts: Vec<AccountConfig>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let symbols: Vec<String> = lookup("SYMBOLS")
            .unwrap_or_else(|| "BTCUSDT,ETHUSDT".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let accounts = lookup("ACCOUNTS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| load_account(&lookup, name))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            symbols,
            ws_endpoint: lookup("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            ws_api_endpoint: lookup("WS_API_ENDPOINT").unwrap_or(defaults.ws_api_endpoint),
            rest_endpoint: lookup("REST_ENDPOINT").unwrap_or(defaults.rest_endpoint),
            ipc_socket_path: lookup("IPC_SOCKET_PATH").unwrap_or(defaults.ipc_socket_path),
            update_speed: parse_or(&lookup, "UPDATE_SPEED", defaults.update_speed)?,
            snapshot_limit: parse_or(&lookup, "SNAPSHOT_LIMIT", defaults.snapshot_limit)?,
            depth_queue_capacity: parse_or(
                &lookup,
                "DEPTH_QUEUE_CAPACITY",
                defaults.depth_queue_capacity,
            )?,
            reconnect_delay_ms: parse_or(&lookup, "RECONNECT_DELAY_MS", defaults.reconnect_delay_ms)?,
            max_reconnect_attempts: parse_or(
                &lookup,
                "MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            rest_timeout_secs: parse_or(&lookup, "REST_TIMEOUT_SECS", defaults.rest_timeout_secs)?,
            handshake_timeout_secs: parse_or(
                &lookup,
                "HANDSHAKE_TIMEOUT_SECS",
                defaults.handshake_timeout_secs,
            )?,
            order_timeout_secs: parse_or(&lookup, "ORDER_TIMEOUT_SECS", defaults.order_timeout_secs)?,
            health_port: parse_or(&lookup, "HEALTH_PORT", defaults.health_port)?,
            accounts,
        })
    }

    pub fn binance_settings(&self) -> BinanceSettings {
        BinanceSettings {
            ws_endpoint: self.ws_endpoint.clone(),
            ws_api_endpoint: self.ws_api_endpoint.clone(),
            rest_endpoint: self.rest_endpoint.clone(),
            rest_timeout: Duration::from_secs(self.rest_timeout_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            order_timeout: Duration::from_secs(self.order_timeout_secs),
            reconnect: ReconnectPolicy {
                reconnect_delay_ms: self.reconnect_delay_ms,
                max_reconnect_attempts: self.max_reconnect_attempts,
            },
        }
    }

    pub fn book_settings(&self) -> BookSettings {
        BookSettings {
            queue_capacity: self.depth_queue_capacity,
            snapshot_limit: self.snapshot_limit,
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            order_timeout: Duration::from_secs(self.order_timeout_secs),
        }
    }
}

fn load_account<F>(lookup: &F, name: &str) -> Result<AccountConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let prefix = name.to_uppercase();
    let key_var = format!("{}_API_KEY", prefix);
    let secret_var = format!("{}_API_SECRET", prefix);

    let api_key = lookup(&key_var)
        .ok_or_else(|| ConnectorError::Config(format!("{} is not set", key_var)))?;
    let secret = lookup(&secret_var)
        .ok_or_else(|| ConnectorError::Config(format!("{} is not set", secret_var)))?;

    Ok(AccountConfig {
        name: name.to_string(),
        credentials: ApiCredentials::new(api_key, secret),
    })
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConnectorError::Config(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            ws_endpoint: "wss://stream.binance.com:9443/ws".to_string(),
            ws_api_endpoint: "wss://ws-api.binance.com:443/ws-api/v3".to_string(),
            rest_endpoint: "https://api.binance.com/api/v3".to_string(),
            ipc_socket_path: "/tmp/sequex.sock".to_string(),
            update_speed: UpdateSpeed::Ms100,
            snapshot_limit: 5000,
            depth_queue_capacity: 500,
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 10,
            rest_timeout_secs: 10,
            handshake_timeout_secs: 10,
            order_timeout_secs: 10,
            health_port: 9090,
            accounts: Vec::new(),
        }
    }
}
