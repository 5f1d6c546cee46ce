//! Persistence seams for the engine
//!
//! The health sweep and the assignment selector only talk to these traits, so the
//! PostgreSQL repositories and the in-process backend are interchangeable.

pub mod account;
pub mod memory;
pub mod proxy;

pub use account::AccountRepository;
pub use memory::InMemoryBackend;
pub use proxy::ProxyRepository;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{Result, WardenError};
use crate::models::{HealthUpdate, NewProxy, Proxy, ProxyStatus, ProxyType};

/// Durable record of every proxy's configuration, status and last health
#[async_trait]
pub trait ProxyRegistry: Send + Sync {
    /// Get a proxy by id, `ProxyNotFound` if unknown
    async fn get(&self, id: i32) -> Result<Proxy>;

    /// Every proxy regardless of status
    async fn list_all(&self) -> Result<Vec<Proxy>>;

    /// Proxies the health sweep probes (everything but inactive), least recently
    /// checked first with never-checked proxies at the front
    async fn list_active(&self) -> Result<Vec<Proxy>>;

    /// Active proxies that passed their last check, fastest first
    async fn list_available(&self, proxy_type: Option<ProxyType>) -> Result<Vec<Proxy>>;

    /// Persist a probe outcome; touches only the health columns
    async fn update_health(&self, id: i32, update: &HealthUpdate) -> Result<()>;

    /// Overwrite the status column only
    async fn update_status(&self, id: i32, status: ProxyStatus) -> Result<()>;

    /// Set `to` only if the stored status is still `from`; returns whether it applied
    async fn transition_status(&self, id: i32, from: ProxyStatus, to: ProxyStatus)
        -> Result<bool>;

    /// Register a proxy, `AlreadyExists` on a duplicate host:port
    async fn create(&self, req: &NewProxy) -> Result<Proxy>;

    /// Remove a proxy, `InUse` while an identity still points at it
    async fn delete(&self, id: i32) -> Result<()>;

    /// Operator action: take a proxy out of probing and assignment
    async fn deactivate(&self, id: i32) -> Result<Proxy> {
        let proxy = self.get(id).await?;
        let to = proxy.status.deactivate()?;
        apply_transition(self, proxy.id, proxy.status, to).await
    }

    /// Operator action: put an inactive proxy back into rotation
    async fn reactivate(&self, id: i32) -> Result<Proxy> {
        let proxy = self.get(id).await?;
        let to = proxy.status.reactivate()?;
        apply_transition(self, proxy.id, proxy.status, to).await
    }
}

async fn apply_transition<R: ProxyRegistry + ?Sized>(
    registry: &R,
    id: i32,
    from: ProxyStatus,
    to: ProxyStatus,
) -> Result<Proxy> {
    if !registry.transition_status(id, from, to).await? {
        // Someone else moved the proxy between our read and write.
        let current = registry.get(id).await?;
        return Err(WardenError::InvalidTransition {
            from: current.status,
            to,
        });
    }
    registry.get(id).await
}

/// Identity -> proxy pointer owned by the account service
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Number of identities currently assigned to each proxy (absent = 0)
    async fn assignment_counts(&self) -> Result<HashMap<i32, i64>>;

    /// Write or clear an identity's proxy pointer
    async fn set_proxy(&self, identity_id: i32, proxy_id: Option<i32>) -> Result<()>;

    /// Current proxy of an identity
    async fn proxy_of(&self, identity_id: i32) -> Result<Option<i32>>;
}
