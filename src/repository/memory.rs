use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::{IdentityStore, ProxyRegistry};
use crate::error::{Result, WardenError};
use crate::models::{HealthUpdate, NewProxy, Proxy, ProxyStatus, ProxyType};

/// In-process registry and identity store
///
/// Backs the test suite and library users that run without PostgreSQL; the
/// binary always uses the PostgreSQL repositories. Cloning shares the
/// underlying state.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    proxies: RwLock<BTreeMap<i32, Proxy>>,
    identities: RwLock<HashMap<i32, Option<i32>>>,
    next_id: AtomicI32,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a proxy row as-is
    pub fn upsert(&self, proxy: Proxy) {
        self.inner.next_id.fetch_max(proxy.id, Ordering::SeqCst);
        self.inner.proxies.write().insert(proxy.id, proxy);
    }

    /// Register an identity with no proxy
    pub fn add_identity(&self, identity_id: i32) {
        self.inner.identities.write().entry(identity_id).or_insert(None);
    }

    fn mutate<T>(&self, id: i32, f: impl FnOnce(&mut Proxy) -> T) -> Result<T> {
        let mut proxies = self.inner.proxies.write();
        let proxy = proxies.get_mut(&id).ok_or(WardenError::ProxyNotFound { id })?;
        Ok(f(proxy))
    }
}

#[async_trait]
impl ProxyRegistry for InMemoryBackend {
    async fn get(&self, id: i32) -> Result<Proxy> {
        self.inner
            .proxies
            .read()
            .get(&id)
            .cloned()
            .ok_or(WardenError::ProxyNotFound { id })
    }

    async fn list_all(&self) -> Result<Vec<Proxy>> {
        Ok(self.inner.proxies.read().values().cloned().collect())
    }

    async fn list_active(&self) -> Result<Vec<Proxy>> {
        let mut proxies: Vec<Proxy> = self
            .inner
            .proxies
            .read()
            .values()
            .filter(|p| p.status.is_probed())
            .cloned()
            .collect();
        // None sorts before Some, matching NULLS FIRST.
        proxies.sort_by_key(|p| (p.last_health_check, p.id));
        Ok(proxies)
    }

    async fn list_available(&self, proxy_type: Option<ProxyType>) -> Result<Vec<Proxy>> {
        let mut proxies: Vec<Proxy> = self
            .inner
            .proxies
            .read()
            .values()
            .filter(|p| p.is_available())
            .filter(|p| proxy_type.map_or(true, |t| p.proxy_type == t))
            .cloned()
            .collect();
        proxies.sort_by_key(|p| (p.response_time_ms, p.id));
        Ok(proxies)
    }

    async fn update_health(&self, id: i32, update: &HealthUpdate) -> Result<()> {
        self.mutate(id, |proxy| {
            proxy.health_check_success = update.success;
            proxy.response_time_ms = update.latency_ms.max(0);
            proxy.last_health_check = Some(update.checked_at);
            proxy.updated_at = Utc::now();
        })
    }

    async fn update_status(&self, id: i32, status: ProxyStatus) -> Result<()> {
        self.mutate(id, |proxy| {
            proxy.status = status;
            proxy.updated_at = Utc::now();
        })
    }

    async fn transition_status(
        &self,
        id: i32,
        from: ProxyStatus,
        to: ProxyStatus,
    ) -> Result<bool> {
        self.mutate(id, |proxy| {
            if proxy.status != from {
                return false;
            }
            proxy.status = to;
            proxy.updated_at = Utc::now();
            true
        })
    }

    async fn create(&self, req: &NewProxy) -> Result<Proxy> {
        req.validate()?;
        let host = req.host.trim();

        let mut proxies = self.inner.proxies.write();
        if proxies.values().any(|p| p.host == host && p.port == req.port) {
            return Err(WardenError::AlreadyExists {
                host: host.to_string(),
                port: req.port,
            });
        }

        let now = Utc::now();
        let proxy = Proxy {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            name: req.name.clone(),
            proxy_type: req.proxy_type,
            host: host.to_string(),
            port: req.port,
            username: req.username.clone(),
            password: req.password.clone(),
            status: ProxyStatus::Active,
            health_check_url: req.health_check_url.clone(),
            last_health_check: None,
            health_check_success: true,
            response_time_ms: 0,
            created_at: now,
            updated_at: now,
        };
        proxies.insert(proxy.id, proxy.clone());
        Ok(proxy)
    }

    async fn delete(&self, id: i32) -> Result<()> {
        let identities = self
            .inner
            .identities
            .read()
            .values()
            .filter(|p| **p == Some(id))
            .count() as i64;

        let mut proxies = self.inner.proxies.write();
        if !proxies.contains_key(&id) {
            return Err(WardenError::ProxyNotFound { id });
        }
        if identities > 0 {
            return Err(WardenError::InUse { id, identities });
        }
        proxies.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for InMemoryBackend {
    async fn assignment_counts(&self) -> Result<HashMap<i32, i64>> {
        let mut counts = HashMap::new();
        for proxy_id in self.inner.identities.read().values().flatten() {
            *counts.entry(*proxy_id).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn set_proxy(&self, identity_id: i32, proxy_id: Option<i32>) -> Result<()> {
        let mut identities = self.inner.identities.write();
        let slot = identities
            .get_mut(&identity_id)
            .ok_or(WardenError::IdentityNotFound { id: identity_id })?;
        *slot = proxy_id;
        Ok(())
    }

    async fn proxy_of(&self, identity_id: i32) -> Result<Option<i32>> {
        self.inner
            .identities
            .read()
            .get(&identity_id)
            .copied()
            .ok_or(WardenError::IdentityNotFound { id: identity_id })
    }
}
