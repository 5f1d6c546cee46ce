//! Proxy assignment for identities
//!
//! The selector reads the available pool from the registry, ranks it with the
//! requested strategy and writes the identity's proxy pointer.

mod round_robin;
pub mod strategy;

pub use round_robin::RoundRobin;

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::config::AssignmentConfig;
use crate::error::{Result, WardenError};
use crate::models::{
    Assignment, AssignmentRequest, AssignmentStrategy, Proxy, ProxyType, ProxyUsage,
};
use crate::repository::{IdentityStore, ProxyRegistry};
use crate::store::SharedStore;

/// Picks a proxy for an identity and records the assignment
#[derive(Clone)]
pub struct AssignmentSelector {
    registry: Arc<dyn ProxyRegistry>,
    identities: Arc<dyn IdentityStore>,
    round_robin: RoundRobin,
    default_strategy: AssignmentStrategy,
}

impl AssignmentSelector {
    pub fn new(
        registry: Arc<dyn ProxyRegistry>,
        identities: Arc<dyn IdentityStore>,
        store: Arc<dyn SharedStore>,
        config: &AssignmentConfig,
    ) -> Self {
        Self {
            registry,
            identities,
            round_robin: RoundRobin::new(store, config.round_robin_order),
            default_strategy: config.default_strategy,
        }
    }

    /// Assign a proxy to an identity, replacing any previous assignment
    #[instrument(skip(self), fields(identity_id = req.identity_id))]
    pub async fn assign(&self, req: &AssignmentRequest) -> Result<Assignment> {
        let strategy = match (req.proxy_id, req.strategy) {
            (Some(_), _) => AssignmentStrategy::Manual,
            (None, Some(AssignmentStrategy::Manual)) => {
                return Err(WardenError::InvalidRequest(
                    "manual assignment requires a proxy_id".to_string(),
                ))
            }
            (None, strategy) => strategy.unwrap_or(self.default_strategy),
        };

        // Fail on an unknown identity before a round-robin cursor is spent.
        let previous = self.identities.proxy_of(req.identity_id).await?;

        let proxy = match req.proxy_id {
            Some(proxy_id) => self.manual(proxy_id, req.proxy_type).await?,
            None => self.select(strategy, req.proxy_type).await?,
        };

        self.identities
            .set_proxy(req.identity_id, Some(proxy.id))
            .await?;

        info!(
            identity_id = req.identity_id,
            proxy_id = proxy.id,
            previous_proxy_id = ?previous,
            strategy = %strategy,
            "Assigned proxy to identity"
        );

        Ok(Assignment::new(req.identity_id, &proxy, strategy))
    }

    /// Clear an identity's proxy pointer
    #[instrument(skip(self))]
    pub async fn release(&self, identity_id: i32) -> Result<()> {
        self.identities.set_proxy(identity_id, None).await?;
        info!(identity_id, "Released identity proxy");
        Ok(())
    }

    /// Identities per proxy and per type, plus how much of the pool is still free
    pub async fn usage(&self) -> Result<ProxyUsage> {
        let proxies = self.registry.list_all().await?;
        let counts = self.identities.assignment_counts().await?;
        Ok(ProxyUsage::from_counts(&proxies, &counts))
    }

    /// Pick a proxy by strategy without recording anything
    pub async fn select(
        &self,
        strategy: AssignmentStrategy,
        proxy_type: Option<ProxyType>,
    ) -> Result<Proxy> {
        let pool = self.registry.list_available(proxy_type).await?;
        let no_proxy = || WardenError::NoAvailableProxy {
            strategy: strategy.as_str(),
            proxy_type: proxy_type.map(|t| t.to_string()),
        };

        if pool.is_empty() {
            return Err(no_proxy());
        }

        let picked = match strategy {
            AssignmentStrategy::Fastest => strategy::fastest(&pool).cloned(),
            AssignmentStrategy::LeastUsed => {
                let counts = self.identities.assignment_counts().await?;
                strategy::least_used(&pool, &counts).cloned()
            }
            AssignmentStrategy::Auto => {
                let counts = self.identities.assignment_counts().await?;
                strategy::auto(&pool, &counts).cloned()
            }
            AssignmentStrategy::RoundRobin => self.round_robin.next(pool, proxy_type).await?,
            AssignmentStrategy::Manual => {
                return Err(WardenError::InvalidRequest(
                    "manual strategy cannot select a proxy".to_string(),
                ))
            }
        };

        picked.ok_or_else(no_proxy)
    }

    async fn manual(&self, proxy_id: i32, proxy_type: Option<ProxyType>) -> Result<Proxy> {
        let proxy = self.registry.get(proxy_id).await?;

        if let Some(wanted) = proxy_type {
            if proxy.proxy_type != wanted {
                return Err(WardenError::InvalidRequest(format!(
                    "proxy {} is {}, not {}",
                    proxy.id, proxy.proxy_type, wanted
                )));
            }
        }

        if !proxy.is_available() {
            warn!(
                proxy_id = proxy.id,
                status = %proxy.status,
                healthy = proxy.health_check_success,
                "Manually assigning a proxy that is not currently available"
            );
        }

        Ok(proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{test_proxy, ProxyStatus, RoundRobinOrder};
    use crate::repository::InMemoryBackend;
    use crate::store::MemoryStore;
    use std::collections::HashSet;

    fn selector(backend: &InMemoryBackend, config: AssignmentConfig) -> AssignmentSelector {
        AssignmentSelector::new(
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            Arc::new(MemoryStore::new()),
            &config,
        )
    }

    fn request(identity_id: i32, strategy: AssignmentStrategy) -> AssignmentRequest {
        AssignmentRequest {
            identity_id,
            strategy: Some(strategy),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_least_used_ignores_unhealthy() {
        let backend = InMemoryBackend::new();
        backend.upsert(test_proxy(1, 100));
        let mut down = test_proxy(2, 10);
        down.health_check_success = false;
        backend.upsert(down);
        for id in 1..=3 {
            backend.add_identity(id);
        }
        backend.set_proxy(1, Some(1)).await.unwrap();
        backend.set_proxy(2, Some(1)).await.unwrap();

        let selector = selector(&backend, AssignmentConfig::default());
        let assignment = selector
            .assign(&request(3, AssignmentStrategy::LeastUsed))
            .await
            .unwrap();
        assert_eq!(assignment.proxy_id, 1);
        assert_eq!(backend.proxy_of(3).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_round_robin_visits_all_before_repeating() {
        let backend = InMemoryBackend::new();
        for (id, latency) in [(1, 30), (2, 10), (3, 20), (4, 40)] {
            backend.upsert(test_proxy(id, latency));
        }
        for id in 1..=8 {
            backend.add_identity(id);
        }

        let selector = selector(&backend, AssignmentConfig::default());
        let mut picks = Vec::new();
        for identity in 1..=8 {
            let a = selector
                .assign(&request(identity, AssignmentStrategy::RoundRobin))
                .await
                .unwrap();
            picks.push(a.proxy_id);
        }

        let first: HashSet<i32> = picks[..4].iter().copied().collect();
        assert_eq!(first.len(), 4);
        assert_eq!(picks[..4], picks[4..]);
    }

    #[tokio::test]
    async fn test_auto_is_default_and_weighs_load() {
        let backend = InMemoryBackend::new();
        backend.upsert(test_proxy(1, 250));
        backend.upsert(test_proxy(2, 50));
        backend.add_identity(1);
        backend.add_identity(2);
        backend.set_proxy(1, Some(2)).await.unwrap();

        let selector = selector(&backend, AssignmentConfig::default());
        let assignment = selector
            .assign(&AssignmentRequest {
                identity_id: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(assignment.strategy, AssignmentStrategy::Auto);
        assert_eq!(assignment.proxy_id, 2);
    }

    #[tokio::test]
    async fn test_quarantined_sole_proxy_is_unavailable() {
        let backend = InMemoryBackend::new();
        let mut proxy = test_proxy(1, 10);
        proxy.status = ProxyStatus::Quarantined;
        backend.upsert(proxy);
        backend.add_identity(1);

        let selector = selector(&backend, AssignmentConfig::default());
        let err = selector
            .assign(&request(1, AssignmentStrategy::Fastest))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WardenError::NoAvailableProxy {
                strategy: "fastest",
                proxy_type: None
            }
        ));
        assert_eq!(backend.proxy_of(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_type_filter() {
        let backend = InMemoryBackend::new();
        backend.upsert(test_proxy(1, 10));
        let mut socks = test_proxy(2, 90);
        socks.proxy_type = ProxyType::Socks5;
        backend.upsert(socks);
        backend.add_identity(1);

        let selector = selector(&backend, AssignmentConfig::default());
        let assignment = selector
            .assign(&AssignmentRequest {
                identity_id: 1,
                proxy_type: Some(ProxyType::Socks5),
                strategy: Some(AssignmentStrategy::Fastest),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(assignment.proxy_id, 2);
        assert_eq!(assignment.proxy_type, ProxyType::Socks5);
    }

    #[tokio::test]
    async fn test_manual_assignment() {
        let backend = InMemoryBackend::new();
        let mut quarantined = test_proxy(1, 10);
        quarantined.status = ProxyStatus::Quarantined;
        backend.upsert(quarantined);
        backend.add_identity(1);

        let selector = selector(&backend, AssignmentConfig::default());

        // Explicit id wins over the requested strategy and skips availability.
        let assignment = selector
            .assign(&AssignmentRequest {
                identity_id: 1,
                proxy_id: Some(1),
                strategy: Some(AssignmentStrategy::Fastest),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(assignment.strategy, AssignmentStrategy::Manual);
        assert_eq!(backend.proxy_of(1).await.unwrap(), Some(1));

        let err = selector
            .assign(&AssignmentRequest {
                identity_id: 1,
                proxy_id: Some(99),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::ProxyNotFound { id: 99 }));

        let err = selector
            .assign(&request(1, AssignmentStrategy::Manual))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::InvalidRequest(_)));

        let err = selector
            .assign(&AssignmentRequest {
                identity_id: 1,
                proxy_id: Some(1),
                proxy_type: Some(ProxyType::Socks5),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_unknown_identity_and_release() {
        let backend = InMemoryBackend::new();
        backend.upsert(test_proxy(1, 10));
        backend.add_identity(1);
        let selector = selector(
            &backend,
            AssignmentConfig {
                round_robin_order: RoundRobinOrder::Id,
                ..Default::default()
            },
        );

        let err = selector
            .assign(&request(42, AssignmentStrategy::RoundRobin))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::IdentityNotFound { id: 42 }));

        selector
            .assign(&request(1, AssignmentStrategy::RoundRobin))
            .await
            .unwrap();
        selector.release(1).await.unwrap();
        assert_eq!(backend.proxy_of(1).await.unwrap(), None);
        assert!(backend.get(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_usage_follows_assignments() {
        let backend = InMemoryBackend::new();
        backend.upsert(test_proxy(1, 10));
        backend.upsert(test_proxy(2, 500));
        for id in 1..=3 {
            backend.add_identity(id);
        }

        let selector = selector(&backend, AssignmentConfig::default());
        for identity in 1..=3 {
            selector
                .assign(&request(identity, AssignmentStrategy::Fastest))
                .await
                .unwrap();
        }

        let usage = selector.usage().await.unwrap();
        assert_eq!(usage.total_assignments, 3);
        assert_eq!(usage.assigned_proxies, 1);
        assert_eq!(usage.available_proxies, 1);
        assert_eq!(usage.by_proxy[0].proxy_id, 1);
        assert_eq!(usage.by_proxy[0].identity_count, 3);
        assert_eq!(usage.by_type[&ProxyType::Http], 3);

        selector.release(2).await.unwrap();
        assert_eq!(selector.usage().await.unwrap().total_assignments, 2);
    }
}
