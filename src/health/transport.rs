//! Connection setup through upstream proxies
//!
//! Opens the raw byte stream a probe runs over: a plain TCP connection to an
//! HTTP proxy, an HTTP CONNECT tunnel, or a SOCKS5 session.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, instrument};

use crate::error::{Result, WardenError};
use crate::models::{Proxy, ProxyType};

/// Upper bound on a CONNECT response header block
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Where a probe is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    /// Path and query in origin form, `/` at minimum
    pub path: String,
    /// Full URL as used in absolute-form requests
    pub absolute: String,
}

impl ProbeTarget {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = url::Url::parse(raw)?;
        let secure = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(WardenError::InvalidRequest(format!(
                    "unsupported health check scheme: {}",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| WardenError::InvalidRequest(format!("missing host in {}", raw)))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| WardenError::InvalidRequest(format!("missing port in {}", raw)))?;

        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            host,
            port,
            secure,
            path,
            absolute: url.to_string(),
        })
    }

    /// `Host` header value, port omitted when it is the scheme default
    pub fn host_header(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Proxy transport handler
pub struct ProxyTransport;

impl ProxyTransport {
    /// Plain TCP connection to an HTTP proxy, for absolute-form requests
    pub async fn connect_proxy(proxy: &Proxy) -> Result<TcpStream> {
        if proxy.proxy_type != ProxyType::Http {
            return Err(WardenError::UnsupportedProtocol(format!(
                "{} proxies do not accept forwarded requests",
                proxy.proxy_type
            )));
        }

        TcpStream::connect((proxy.host.as_str(), proxy.socket_port()?))
            .await
            .map_err(|e| WardenError::ProxyConnectionFailed(format!("TCP connect failed: {}", e)))
    }

    /// Open a byte stream to `target_host:target_port` through the proxy
    #[instrument(skip(proxy), fields(proxy_id = proxy.id, target = %target_host))]
    pub async fn connect(proxy: &Proxy, target_host: &str, target_port: u16) -> Result<TcpStream> {
        match proxy.proxy_type {
            ProxyType::Http => Self::connect_http(proxy, target_host, target_port).await,
            ProxyType::Socks5 => Self::connect_socks5(proxy, target_host, target_port).await,
        }
    }

    /// Connect through the HTTP CONNECT method
    async fn connect_http(proxy: &Proxy, target_host: &str, target_port: u16) -> Result<TcpStream> {
        debug!("Connecting to HTTP proxy at {}", proxy.address());

        let mut stream = Self::connect_proxy(proxy).await?;

        let connect_request = Self::build_connect_request(proxy, target_host, target_port);
        stream.write_all(connect_request.as_bytes()).await.map_err(|e| {
            WardenError::ProxyConnectionFailed(format!("Failed to send CONNECT: {}", e))
        })?;

        let head = Self::read_response_head(&mut stream).await?;
        let status_line = head.lines().next().unwrap_or_default();
        if !is_success_status_line(status_line) {
            return Err(WardenError::ProxyConnectionFailed(format!(
                "CONNECT failed: {}",
                if status_line.is_empty() { "empty response" } else { status_line }
            )));
        }

        debug!("HTTP CONNECT tunnel established");
        Ok(stream)
    }

    /// Read until the end of the response header block
    async fn read_response_head(stream: &mut TcpStream) -> Result<String> {
        let mut buf = Vec::with_capacity(1024);
        let mut chunk = [0u8; 1024];

        loop {
            let n = stream.read(&mut chunk).await.map_err(|e| {
                WardenError::ProxyConnectionFailed(format!("Failed to read CONNECT response: {}", e))
            })?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= MAX_CONNECT_RESPONSE {
                break;
            }
        }

        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Build HTTP CONNECT request
    fn build_connect_request(proxy: &Proxy, target_host: &str, target_port: u16) -> String {
        let mut request = format!(
            "CONNECT {}:{} HTTP/1.1\r\nHost: {}:{}\r\n",
            target_host, target_port, target_host, target_port
        );

        if let Some(auth) = Self::basic_auth(proxy) {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }

        request.push_str("\r\n");
        request
    }

    /// `Proxy-Authorization` header value, when the proxy has credentials
    pub fn basic_auth(proxy: &Proxy) -> Option<String> {
        proxy.credentials().map(|(username, password)| {
            let encoded = BASE64.encode(format!("{}:{}", username, password).as_bytes());
            format!("Basic {}", encoded)
        })
    }

    /// Connect through a SOCKS5 proxy; the target host is resolved by the proxy
    async fn connect_socks5(
        proxy: &Proxy,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!("Connecting to SOCKS5 proxy at {}", proxy.address());

        let proxy_addr = (proxy.host.as_str(), proxy.socket_port()?);
        let target_addr = (target_host, target_port);

        let stream = match proxy.credentials() {
            Some((username, password)) => {
                Socks5Stream::connect_with_password(proxy_addr, target_addr, username, password)
                    .await
            }
            None => Socks5Stream::connect(proxy_addr, target_addr).await,
        }
        .map_err(|e| WardenError::ProxyConnectionFailed(format!("SOCKS5 connect failed: {}", e)))?;

        debug!("SOCKS5 connection established");
        Ok(stream.into_inner())
    }
}

fn is_success_status_line(line: &str) -> bool {
    let mut parts = line.split_whitespace();
    matches!(
        (parts.next(), parts.next()),
        (Some(version), Some(code)) if version.starts_with("HTTP/1.") && code.starts_with('2')
    )
}
