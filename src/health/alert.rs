use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tracing::{error, warn};

use crate::config::ALERT_TTL;
use crate::error::Result;
use crate::models::{Proxy, ProxyAlert};
use crate::store::SharedStore;

/// Delivery channel for quarantine alerts (webhook, chat, pager...)
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, alert: &ProxyAlert) -> Result<()>;
}

/// Records quarantine alerts and fans them out to the registered notifiers
#[derive(Clone)]
pub struct AlertEmitter {
    store: Arc<dyn SharedStore>,
    notifiers: Vec<Arc<dyn AlertNotifier>>,
    ttl: Duration,
}

impl AlertEmitter {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            notifiers: Vec::new(),
            ttl: ALERT_TTL,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Emit an alert for a proxy that was just quarantined
    ///
    /// Delivery is best-effort: storage and notifier failures are logged and
    /// never reach the caller.
    pub async fn emit(&self, proxy: &Proxy, failure_count: u64) -> ProxyAlert {
        let alert = ProxyAlert::quarantined(proxy, failure_count, Utc::now());

        warn!(
            proxy_id = alert.proxy_id,
            proxy_name = %alert.proxy_name,
            proxy_host = %alert.proxy_host,
            proxy_port = alert.proxy_port,
            failure_count = alert.failure_count,
            "ALERT: proxy quarantined after consecutive failures"
        );

        if let Err(e) = self.store.record_alert(&alert, self.ttl).await {
            error!(proxy_id = alert.proxy_id, error = %e, "Failed to store proxy alert");
        }

        let deliveries = self.notifiers.iter().map(|notifier| {
            let alert = &alert;
            async move {
                if let Err(e) = notifier.notify(alert).await {
                    error!(
                        proxy_id = alert.proxy_id,
                        notifier = notifier.name(),
                        error = %e,
                        "Alert notifier failed"
                    );
                }
            }
        });
        join_all(deliveries).await;

        alert
    }
}
