use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use super::alert::AlertEmitter;
use crate::config::FAILURE_COUNTER_TTL;
use crate::error::Result;
use crate::models::{Proxy, ProxyStatus};
use crate::repository::ProxyRegistry;
use crate::store::SharedStore;

/// What the tracker did with one probe outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerOutcome {
    /// Success on a proxy that was already active
    Healthy,
    /// Success that lifted a quarantine
    Recovered,
    /// Failure below the threshold
    Failing { failures: u64 },
    /// Failure that crossed the threshold; an alert was emitted
    Quarantined { failures: u64 },
    /// Failure on a proxy that is already quarantined
    StillQuarantined,
    /// Status changed underneath us, or the proxy is inactive
    Skipped,
}

/// Consecutive-failure counting and the quarantine state machine
#[derive(Clone)]
pub struct FailureTracker {
    registry: Arc<dyn ProxyRegistry>,
    store: Arc<dyn SharedStore>,
    alerts: AlertEmitter,
    max_failures: u64,
    counter_ttl: Duration,
}

impl FailureTracker {
    pub fn new(
        registry: Arc<dyn ProxyRegistry>,
        store: Arc<dyn SharedStore>,
        alerts: AlertEmitter,
        max_failures: u64,
    ) -> Self {
        Self {
            registry,
            store,
            alerts,
            max_failures: max_failures.max(1),
            counter_ttl: FAILURE_COUNTER_TTL,
        }
    }

    /// Apply one probe outcome. `proxy` is the row as it was when the probe started.
    #[instrument(skip(self, proxy), fields(proxy_id = proxy.id))]
    pub async fn record(&self, proxy: &Proxy, success: bool) -> Result<TrackerOutcome> {
        if success {
            self.on_success(proxy).await
        } else {
            self.on_failure(proxy).await
        }
    }

    async fn on_success(&self, proxy: &Proxy) -> Result<TrackerOutcome> {
        self.store.clear_failures(proxy.id).await?;

        if proxy.status != ProxyStatus::Quarantined {
            return Ok(TrackerOutcome::Healthy);
        }

        let to = proxy.status.recover()?;
        if self
            .registry
            .transition_status(proxy.id, proxy.status, to)
            .await?
        {
            info!(proxy_id = proxy.id, address = %proxy.address(), "Proxy recovered from quarantine");
            Ok(TrackerOutcome::Recovered)
        } else {
            Ok(TrackerOutcome::Skipped)
        }
    }

    async fn on_failure(&self, proxy: &Proxy) -> Result<TrackerOutcome> {
        match proxy.status {
            ProxyStatus::Quarantined => return Ok(TrackerOutcome::StillQuarantined),
            ProxyStatus::Inactive => return Ok(TrackerOutcome::Skipped),
            ProxyStatus::Active => {}
        }

        let failures = self
            .store
            .increment_failures(proxy.id, self.counter_ttl)
            .await?;

        if failures < self.max_failures {
            debug!(failures, max = self.max_failures, "Proxy failure counted");
            return Ok(TrackerOutcome::Failing { failures });
        }

        let to = proxy.status.quarantine()?;
        let applied = self
            .registry
            .transition_status(proxy.id, proxy.status, to)
            .await?;
        self.store.clear_failures(proxy.id).await?;

        if !applied {
            return Ok(TrackerOutcome::Skipped);
        }

        info!(
            proxy_id = proxy.id,
            address = %proxy.address(),
            failures,
            "Proxy quarantined"
        );
        self.alerts.emit(proxy, failures).await;

        Ok(TrackerOutcome::Quarantined { failures })
    }
}
