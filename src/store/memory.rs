use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{alert_key, cursor_key, failure_key, health_key, SharedStore};
use crate::error::{Result, WardenError};
use crate::models::{HealthSnapshot, ProxyAlert, ProxyType};

#[derive(Debug, Clone)]
enum Value {
    Counter(u64),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// How often writes sweep out entries whose TTL has passed
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// In-process shared store for single-node deployments and tests
///
/// Expiry follows `tokio::time`, so paused-clock tests can advance past TTLs.
/// Per-key atomicity comes from DashMap's shard locks. Reads drop the expired
/// key they hit; writes sweep the whole map at most once per `EVICTION_INTERVAL`,
/// so keys nobody reads again (alerts, abandoned counters) do not pile up.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Entry>>,
    next_eviction: Arc<Mutex<Instant>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_eviction: Arc::new(Mutex::new(Instant::now() + EVICTION_INTERVAL)),
        }
    }

    /// Drop every expired entry if the eviction interval has elapsed.
    /// Must not be called while holding a map guard.
    fn evict_expired(&self) {
        let now = Instant::now();
        {
            let mut next = self.next_eviction.lock();
            if now < *next {
                return;
            }
            *next = now + EVICTION_INTERVAL;
        }
        self.entries.retain(|_, e| e.is_live(now));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn live(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_live(now) {
            return Some(entry.value.clone());
        }
        drop(entry);
        self.entries.remove_if(key, |_, e| !e.is_live(now));
        None
    }

    fn put_hash(&self, key: String, fields: Vec<(&'static str, String)>, ttl: Duration) {
        self.evict_expired();
        let fields = fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        self.entries.insert(
            key,
            Entry {
                value: Value::Hash(fields),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    fn hash(&self, key: &str) -> Option<HashMap<String, String>> {
        match self.live(key)? {
            Value::Hash(fields) => Some(fields),
            Value::Counter(_) => None,
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn increment_failures(&self, proxy_id: i32, ttl: Duration) -> Result<u64> {
        self.evict_expired();
        let now = Instant::now();
        let mut entry = self.entries.entry(failure_key(proxy_id)).or_insert(Entry {
            value: Value::Counter(0),
            expires_at: None,
        });

        let previous = match entry.value {
            Value::Counter(n) if entry.is_live(now) => n,
            _ => 0,
        };
        let count = previous + 1;
        entry.value = Value::Counter(count);
        entry.expires_at = Some(now + ttl);
        Ok(count)
    }

    async fn clear_failures(&self, proxy_id: i32) -> Result<()> {
        self.entries.remove(&failure_key(proxy_id));
        Ok(())
    }

    async fn failure_count(&self, proxy_id: i32) -> Result<Option<u64>> {
        match self.live(&failure_key(proxy_id)) {
            Some(Value::Counter(n)) => Ok(Some(n)),
            _ => Ok(None),
        }
    }

    async fn advance_cursor(&self, scope: Option<ProxyType>, len: usize) -> Result<usize> {
        if len == 0 {
            return Err(WardenError::InvalidRequest(
                "cannot advance a cursor over an empty ring".into(),
            ));
        }

        self.evict_expired();
        let mut entry = self.entries.entry(cursor_key(scope)).or_insert(Entry {
            value: Value::Counter(0),
            expires_at: None,
        });

        let cursor = match entry.value {
            Value::Counter(n) => n as usize,
            Value::Hash(_) => 0,
        };
        let index = cursor % len;
        entry.value = Value::Counter(((index + 1) % len) as u64);
        Ok(index)
    }

    async fn record_health(&self, snapshot: &HealthSnapshot, ttl: Duration) -> Result<()> {
        self.put_hash(health_key(snapshot.proxy_id), snapshot.to_fields(), ttl);
        Ok(())
    }

    async fn health_snapshot(&self, proxy_id: i32) -> Result<Option<HealthSnapshot>> {
        Ok(self
            .hash(&health_key(proxy_id))
            .and_then(|fields| HealthSnapshot::from_fields(proxy_id, &fields)))
    }

    async fn record_alert(&self, alert: &ProxyAlert, ttl: Duration) -> Result<()> {
        self.put_hash(
            alert_key(alert.proxy_id, alert.timestamp),
            alert.to_fields(),
            ttl,
        );
        Ok(())
    }

    async fn recent_alerts(&self, proxy_id: i32) -> Result<Vec<ProxyAlert>> {
        let prefix = format!("proxy_alert:{}:", proxy_id);
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.key().clone())
            .collect();

        let mut alerts: Vec<ProxyAlert> = keys
            .iter()
            .filter_map(|key| self.hash(key))
            .filter_map(|fields| ProxyAlert::from_fields(&fields))
            .collect();
        alerts.sort_by_key(|a| a.timestamp);
        Ok(alerts)
    }
}
