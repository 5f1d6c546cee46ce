use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{Result, WardenError};

/// Proxy protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Http,
    Socks5,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Http => "http",
            ProxyType::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(ProxyType::Http),
            "socks5" => Some(ProxyType::Socks5),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProxyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for ProxyType {
    type Error = WardenError;

    fn try_from(value: String) -> Result<Self> {
        ProxyType::from_str(&value).ok_or(WardenError::UnsupportedProtocol(value))
    }
}

/// Proxy lifecycle status
///
/// `Quarantined` is persisted as `error`. It is only entered and left through
/// [`ProxyStatus::quarantine`] and [`ProxyStatus::recover`], which the failure
/// tracker drives; operators move proxies with `deactivate`/`reactivate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProxyStatus {
    #[default]
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "inactive")]
    Inactive,
    #[serde(rename = "error")]
    Quarantined,
}

impl ProxyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Active => "active",
            ProxyStatus::Inactive => "inactive",
            ProxyStatus::Quarantined => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(ProxyStatus::Active),
            "inactive" => Some(ProxyStatus::Inactive),
            "error" => Some(ProxyStatus::Quarantined),
            _ => None,
        }
    }

    /// Whether the health sweep should probe a proxy in this status
    pub fn is_probed(&self) -> bool {
        !matches!(self, ProxyStatus::Inactive)
    }

    /// Active -> Quarantined
    pub fn quarantine(self) -> Result<Self> {
        match self {
            ProxyStatus::Active => Ok(ProxyStatus::Quarantined),
            from => Err(WardenError::InvalidTransition {
                from,
                to: ProxyStatus::Quarantined,
            }),
        }
    }

    /// Quarantined -> Active
    pub fn recover(self) -> Result<Self> {
        match self {
            ProxyStatus::Quarantined => Ok(ProxyStatus::Active),
            from => Err(WardenError::InvalidTransition {
                from,
                to: ProxyStatus::Active,
            }),
        }
    }

    /// Active | Quarantined -> Inactive
    pub fn deactivate(self) -> Result<Self> {
        match self {
            ProxyStatus::Active | ProxyStatus::Quarantined => Ok(ProxyStatus::Inactive),
            from => Err(WardenError::InvalidTransition {
                from,
                to: ProxyStatus::Inactive,
            }),
        }
    }

    /// Inactive -> Active
    pub fn reactivate(self) -> Result<Self> {
        match self {
            ProxyStatus::Inactive => Ok(ProxyStatus::Active),
            from => Err(WardenError::InvalidTransition {
                from,
                to: ProxyStatus::Active,
            }),
        }
    }
}

impl std::fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for ProxyStatus {
    type Error = WardenError;

    fn try_from(value: String) -> Result<Self> {
        ProxyStatus::from_str(&value)
            .ok_or_else(|| WardenError::Internal(format!("unknown proxy status: {}", value)))
    }
}

/// Proxy entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Proxy {
    pub id: i32,
    pub name: String,
    #[sqlx(rename = "type", try_from = "String")]
    #[serde(rename = "type")]
    pub proxy_type: ProxyType,
    pub host: String,
    pub port: i32,
    #[serde(skip_serializing)]
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: ProxyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_check_success: bool,
    pub response_time_ms: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proxy {
    /// `host:port` of the proxy endpoint
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Port as a socket port; rows are constrained to `1..=65535`
    pub fn socket_port(&self) -> Result<u16> {
        u16::try_from(self.port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| WardenError::InvalidProxyAddress(format!("invalid port {}", self.port)))
    }

    /// Credentials, when both parts are configured
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }

    /// Eligible for assignment: active and passed its last health check
    pub fn is_available(&self) -> bool {
        self.status == ProxyStatus::Active && self.health_check_success
    }
}

/// Operator request to register a new proxy
#[derive(Debug, Clone, Deserialize)]
pub struct NewProxy {
    pub name: String,
    #[serde(rename = "type")]
    pub proxy_type: ProxyType,
    pub host: String,
    pub port: i32,
    pub username: Option<String>,
    pub password: Option<String>,
    pub health_check_url: Option<String>,
}

impl NewProxy {
    /// Validate address, port and health-check URL before insertion
    pub fn validate(&self) -> Result<()> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(WardenError::InvalidProxyAddress("host must not be empty".into()));
        }
        if host.contains(['/', '@', ' ']) {
            return Err(WardenError::InvalidProxyAddress(format!(
                "host contains invalid characters: {}",
                host
            )));
        }
        if !(1..=65535).contains(&self.port) {
            return Err(WardenError::InvalidProxyAddress(format!(
                "port must be in 1..=65535, got {}",
                self.port
            )));
        }

        // Round-trip through a URL so the address is acceptable to the transport layer.
        let url = url::Url::parse(&format!("{}://{}:{}", self.proxy_type, host, self.port))?;
        if url.host_str().is_none() {
            return Err(WardenError::InvalidProxyAddress(format!(
                "unparseable host: {}",
                host
            )));
        }

        if let Some(ref check_url) = self.health_check_url {
            let parsed = url::Url::parse(check_url)?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(WardenError::InvalidRequest(format!(
                    "health check URL must be http or https: {}",
                    check_url
                )));
            }
        }

        if self.username.is_some() != self.password.is_some()
            && self.proxy_type == ProxyType::Socks5
        {
            return Err(WardenError::InvalidRequest(
                "socks5 auth requires both username and password".into(),
            ));
        }

        Ok(())
    }
}

/// Outcome of one probe, as persisted by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthUpdate {
    pub success: bool,
    pub latency_ms: i32,
    pub checked_at: DateTime<Utc>,
}

#[cfg(test)]
pub(crate) fn test_proxy(id: i32, response_time_ms: i32) -> Proxy {
    Proxy {
        id,
        name: format!("proxy-{}", id),
        proxy_type: ProxyType::Http,
        host: format!("10.0.0.{}", id),
        port: 8080,
        username: None,
        password: None,
        status: ProxyStatus::Active,
        health_check_url: None,
        last_health_check: None,
        health_check_success: true,
        response_time_ms,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
