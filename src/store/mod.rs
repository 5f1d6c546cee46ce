//! Shared key-value store
//!
//! Holds the short-lived state that several engine replicas must agree on:
//! consecutive-failure counters, round-robin cursors, the last health snapshot
//! of every proxy and quarantine alerts.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;
use crate::models::{HealthSnapshot, ProxyAlert, ProxyType};

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically increment the failure counter and refresh its TTL; returns the new count
    async fn increment_failures(&self, proxy_id: i32, ttl: Duration) -> Result<u64>;

    async fn clear_failures(&self, proxy_id: i32) -> Result<()>;

    async fn failure_count(&self, proxy_id: i32) -> Result<Option<u64>>;

    /// Atomically read the round-robin cursor for `scope` and move it one step
    /// around a ring of `len` entries; returns the index to use
    async fn advance_cursor(&self, scope: Option<ProxyType>, len: usize) -> Result<usize>;

    async fn record_health(&self, snapshot: &HealthSnapshot, ttl: Duration) -> Result<()>;

    async fn health_snapshot(&self, proxy_id: i32) -> Result<Option<HealthSnapshot>>;

    async fn record_alert(&self, alert: &ProxyAlert, ttl: Duration) -> Result<()>;

    /// Alerts still retained for a proxy, oldest first
    async fn recent_alerts(&self, proxy_id: i32) -> Result<Vec<ProxyAlert>>;
}

/// Build the configured store backend
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn SharedStore>> {
    match config.backend {
        StoreBackend::Redis => Ok(Arc::new(RedisStore::connect(&config.redis_url).await?)),
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

pub fn failure_key(proxy_id: i32) -> String {
    format!("proxy_failures:{}", proxy_id)
}

pub fn cursor_key(scope: Option<ProxyType>) -> String {
    match scope {
        Some(proxy_type) => format!("proxy_round_robin:{}", proxy_type),
        None => "proxy_round_robin".to_string(),
    }
}

pub fn health_key(proxy_id: i32) -> String {
    format!("proxy_health:{}", proxy_id)
}

pub fn alert_key(proxy_id: i32, timestamp: i64) -> String {
    format!("proxy_alert:{}:{}", proxy_id, timestamp)
}

pub fn alert_pattern(proxy_id: i32) -> String {
    format!("proxy_alert:{}:*", proxy_id)
}
