use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::{Proxy, ProxyStatus, ProxyType};

/// Result of probing a single proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub success: bool,
    pub latency_ms: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn healthy(latency_ms: i32) -> Self {
        Self {
            success: true,
            latency_ms,
            error: None,
        }
    }

    pub fn failed(latency_ms: i32, error: impl Into<String>) -> Self {
        Self {
            success: false,
            latency_ms,
            error: Some(error.into()),
        }
    }
}

/// Last probe outcome mirrored into the shared store (`proxy_health:<id>`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub proxy_id: i32,
    pub success: bool,
    pub response_time: i32,
    pub timestamp: i64,
    pub error: String,
}

impl HealthSnapshot {
    pub fn new(proxy_id: i32, result: &ProbeResult, checked_at: DateTime<Utc>) -> Self {
        Self {
            proxy_id,
            success: result.success,
            response_time: result.latency_ms,
            timestamp: checked_at.timestamp(),
            error: result.error.clone().unwrap_or_default(),
        }
    }

    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("success", self.success.to_string()),
            ("response_time", self.response_time.to_string()),
            ("timestamp", self.timestamp.to_string()),
            ("error", self.error.clone()),
        ]
    }

    pub fn from_fields(proxy_id: i32, fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            proxy_id,
            success: fields.get("success")?.parse().ok()?,
            response_time: fields.get("response_time")?.parse().ok()?,
            timestamp: fields.get("timestamp")?.parse().ok()?,
            error: fields.get("error").cloned().unwrap_or_default(),
        })
    }
}

/// Alert raised when a proxy is quarantined (`proxy_alert:<id>:<ts>`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAlert {
    pub proxy_id: i32,
    pub proxy_name: String,
    pub proxy_host: String,
    pub proxy_port: i32,
    pub failure_count: u64,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ProxyAlert {
    pub const PROXY_FAILURE: &'static str = "proxy_failure";

    pub fn quarantined(proxy: &Proxy, failure_count: u64, at: DateTime<Utc>) -> Self {
        Self {
            proxy_id: proxy.id,
            proxy_name: proxy.name.clone(),
            proxy_host: proxy.host.clone(),
            proxy_port: proxy.port,
            failure_count,
            timestamp: at.timestamp(),
            kind: Self::PROXY_FAILURE.to_string(),
        }
    }

    pub fn raised_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.timestamp, 0).single()
    }

    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("proxy_id", self.proxy_id.to_string()),
            ("proxy_name", self.proxy_name.clone()),
            ("proxy_host", self.proxy_host.clone()),
            ("proxy_port", self.proxy_port.to_string()),
            ("failure_count", self.failure_count.to_string()),
            ("timestamp", self.timestamp.to_string()),
            ("type", self.kind.clone()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            proxy_id: fields.get("proxy_id")?.parse().ok()?,
            proxy_name: fields.get("proxy_name").cloned().unwrap_or_default(),
            proxy_host: fields.get("proxy_host")?.clone(),
            proxy_port: fields.get("proxy_port")?.parse().ok()?,
            failure_count: fields.get("failure_count")?.parse().ok()?,
            timestamp: fields.get("timestamp")?.parse().ok()?,
            kind: fields
                .get("type")
                .cloned()
                .unwrap_or_else(|| Self::PROXY_FAILURE.to_string()),
        })
    }
}

/// Pool-wide health figures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub total_proxies: usize,
    pub active_proxies: usize,
    pub healthy_proxies: usize,
    pub error_proxies: usize,
    pub inactive_proxies: usize,
    /// Percentage of active proxies that passed their last check
    pub health_rate: f64,
    pub avg_response_time_ms: f64,
    /// The same figures over active proxies, split by protocol
    pub by_type: BTreeMap<ProxyType, TypeHealth>,
}

/// Health of the active proxies of one protocol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeHealth {
    pub total_proxies: usize,
    pub healthy_proxies: usize,
    pub unhealthy_proxies: usize,
    pub health_rate: f64,
    pub avg_response_time_ms: f64,
}

impl HealthMetrics {
    pub fn from_proxies(proxies: &[Proxy]) -> Self {
        let mut metrics = HealthMetrics {
            total_proxies: proxies.len(),
            ..Default::default()
        };
        let mut active_latency_sum = 0i64;
        let mut type_latency_sums: BTreeMap<ProxyType, i64> = BTreeMap::new();

        for proxy in proxies {
            match proxy.status {
                ProxyStatus::Active => {
                    metrics.active_proxies += 1;
                    active_latency_sum += proxy.response_time_ms as i64;
                    *type_latency_sums.entry(proxy.proxy_type).or_default() +=
                        proxy.response_time_ms as i64;

                    let by_type = metrics.by_type.entry(proxy.proxy_type).or_default();
                    by_type.total_proxies += 1;
                    if proxy.health_check_success {
                        metrics.healthy_proxies += 1;
                        by_type.healthy_proxies += 1;
                    } else {
                        by_type.unhealthy_proxies += 1;
                    }
                }
                ProxyStatus::Quarantined => metrics.error_proxies += 1,
                ProxyStatus::Inactive => metrics.inactive_proxies += 1,
            }
        }

        if metrics.active_proxies > 0 {
            metrics.health_rate =
                metrics.healthy_proxies as f64 / metrics.active_proxies as f64 * 100.0;
            metrics.avg_response_time_ms =
                active_latency_sum as f64 / metrics.active_proxies as f64;
        }

        // Entries only exist for types with at least one active proxy.
        for (proxy_type, health) in metrics.by_type.iter_mut() {
            let total = health.total_proxies as f64;
            health.health_rate = health.healthy_proxies as f64 / total * 100.0;
            health.avg_response_time_ms = type_latency_sums[proxy_type] as f64 / total;
        }

        metrics
    }
}
