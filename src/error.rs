use http::StatusCode;
use thiserror::Error;

use crate::models::ProxyStatus;

/// Unified error type for the Warden engine
#[derive(Error, Debug)]
pub enum WardenError {
    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database connection failed: {0}")]
    DatabaseConnection(String),

    // Shared store errors
    #[error("Shared store error: {0}")]
    Store(#[from] redis::RedisError),

    // Registry errors
    #[error("Proxy not found: {id}")]
    ProxyNotFound { id: i32 },

    #[error("Identity not found: {id}")]
    IdentityNotFound { id: i32 },

    #[error("Proxy {host}:{port} already exists")]
    AlreadyExists { host: String, port: i32 },

    #[error("Proxy {id} is still assigned to {identities} identities")]
    InUse { id: i32, identities: i64 },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: ProxyStatus, to: ProxyStatus },

    // Proxy configuration errors
    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    // Probe / transport errors
    #[error("Health probe failed: {0}")]
    ProbeFailure(String),

    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("Operation timed out")]
    Timeout,

    // Assignment errors
    #[error("No available proxy for strategy {strategy}{}", .proxy_type.as_deref().map(|t| format!(" (type {})", t)).unwrap_or_default())]
    NoAvailableProxy {
        strategy: &'static str,
        proxy_type: Option<String>,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

impl WardenError {
    /// Get the HTTP status code a marshalling layer should report for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            WardenError::InvalidRequest(_)
            | WardenError::InvalidProxyAddress(_)
            | WardenError::UnsupportedProtocol(_)
            | WardenError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 404 Not Found
            WardenError::ProxyNotFound { .. } | WardenError::IdentityNotFound { .. } => {
                StatusCode::NOT_FOUND
            }

            // 409 Conflict
            WardenError::AlreadyExists { .. }
            | WardenError::InUse { .. }
            | WardenError::InvalidTransition { .. } => StatusCode::CONFLICT,

            // 502 Bad Gateway
            WardenError::ProbeFailure(_) | WardenError::ProxyConnectionFailed(_) => {
                StatusCode::BAD_GATEWAY
            }

            // 503 Service Unavailable
            WardenError::NoAvailableProxy { .. } | WardenError::DatabaseConnection(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // 504 Gateway Timeout
            WardenError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            WardenError::Database(_)
            | WardenError::Store(_)
            | WardenError::Io(_)
            | WardenError::Http(_)
            | WardenError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl From<hyper::Error> for WardenError {
    fn from(err: hyper::Error) -> Self {
        WardenError::Http(err.to_string())
    }
}

impl From<http::Error> for WardenError {
    fn from(err: http::Error) -> Self {
        WardenError::Http(err.to_string())
    }
}

impl From<url::ParseError> for WardenError {
    fn from(err: url::ParseError) -> Self {
        WardenError::InvalidProxyAddress(err.to_string())
    }
}
