use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Proxy, ProxyStatus, ProxyType};

/// Algorithm used to pick a proxy for a new assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    #[default]
    Auto,
    Manual,
    RoundRobin,
    LeastUsed,
    Fastest,
}

impl AssignmentStrategy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            "round_robin" | "roundrobin" | "round-robin" => Some(Self::RoundRobin),
            "least_used" | "leastused" | "least-used" => Some(Self::LeastUsed),
            "fastest" => Some(Self::Fastest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::RoundRobin => "round_robin",
            Self::LeastUsed => "least_used",
            Self::Fastest => "fastest",
        }
    }
}

impl std::fmt::Display for AssignmentStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ordering of the round-robin ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundRobinOrder {
    /// Ring follows the latency-sorted available pool, re-sorted on every call
    #[default]
    Latency,
    /// Ring follows proxy id, stable while pool membership is stable
    Id,
}

impl RoundRobinOrder {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "latency" | "response_time" => Some(Self::Latency),
            "id" => Some(Self::Id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Latency => "latency",
            Self::Id => "id",
        }
    }
}

/// Request to assign a proxy to an identity
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssignmentRequest {
    pub identity_id: i32,
    /// Explicit proxy; bypasses strategy selection
    pub proxy_id: Option<i32>,
    pub proxy_type: Option<ProxyType>,
    pub strategy: Option<AssignmentStrategy>,
}

/// Result of a successful assignment
#[derive(Debug, Clone, Serialize)]
pub struct Assignment {
    pub identity_id: i32,
    pub proxy_id: i32,
    pub proxy_name: String,
    pub proxy_host: String,
    pub proxy_port: i32,
    #[serde(rename = "proxy_type")]
    pub proxy_type: ProxyType,
    pub strategy: AssignmentStrategy,
    pub assigned_at: DateTime<Utc>,
}

impl Assignment {
    pub fn new(identity_id: i32, proxy: &Proxy, strategy: AssignmentStrategy) -> Self {
        Self {
            identity_id,
            proxy_id: proxy.id,
            proxy_name: proxy.name.clone(),
            proxy_host: proxy.host.clone(),
            proxy_port: proxy.port,
            proxy_type: proxy.proxy_type,
            strategy,
            assigned_at: Utc::now(),
        }
    }
}

/// How the pool is shared out between identities
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProxyUsage {
    pub total_proxies: usize,
    pub active_proxies: usize,
    /// Proxies with at least one identity, whatever their status
    pub assigned_proxies: usize,
    /// Active proxies no identity points at yet
    pub available_proxies: usize,
    pub total_assignments: i64,
    /// Busiest proxies first
    pub by_proxy: Vec<ProxyUsageDetail>,
    /// Identities per protocol
    pub by_type: BTreeMap<ProxyType, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyUsageDetail {
    pub proxy_id: i32,
    pub proxy_name: String,
    pub proxy_host: String,
    pub proxy_port: i32,
    pub proxy_type: ProxyType,
    pub status: ProxyStatus,
    pub identity_count: i64,
}

impl ProxyUsage {
    /// Combine the registry with per-proxy identity counts; counts for unknown
    /// proxies are ignored
    pub fn from_counts(proxies: &[Proxy], counts: &HashMap<i32, i64>) -> Self {
        let mut usage = ProxyUsage {
            total_proxies: proxies.len(),
            ..Default::default()
        };

        for proxy in proxies {
            let identity_count = counts.get(&proxy.id).copied().unwrap_or(0);
            let active = proxy.status == ProxyStatus::Active;

            if active {
                usage.active_proxies += 1;
            }
            if identity_count > 0 {
                usage.assigned_proxies += 1;
            } else if active {
                usage.available_proxies += 1;
            }
            usage.total_assignments += identity_count;
            *usage.by_type.entry(proxy.proxy_type).or_default() += identity_count;

            usage.by_proxy.push(ProxyUsageDetail {
                proxy_id: proxy.id,
                proxy_name: proxy.name.clone(),
                proxy_host: proxy.host.clone(),
                proxy_port: proxy.port,
                proxy_type: proxy.proxy_type,
                status: proxy.status,
                identity_count,
            });
        }

        usage.by_proxy.sort_by(|a, b| {
            b.identity_count
                .cmp(&a.identity_count)
                .then(a.proxy_id.cmp(&b.proxy_id))
        });
        usage
    }
}
