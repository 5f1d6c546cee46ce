use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HOST, PROXY_AUTHORIZATION, USER_AGENT};
use http::{Method, Request, StatusCode};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use super::transport::{ProbeTarget, ProxyTransport};
use crate::error::{Result, WardenError};
use crate::models::{ProbeResult, Proxy, ProxyType};

const PROBE_USER_AGENT: &str = concat!("warden/", env!("CARGO_PKG_VERSION"));

/// Reachability check of one proxy
///
/// Implementations never fail: every transport or protocol error, including the
/// timeout, is reported as an unsuccessful [`ProbeResult`].
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, proxy: &Proxy, timeout: Duration) -> ProbeResult;
}

/// Probes by fetching the health-check URL through the proxy itself
#[derive(Debug, Clone)]
pub struct TransportProber {
    default_url: String,
}

impl TransportProber {
    pub fn new(default_url: impl Into<String>) -> Self {
        Self {
            default_url: default_url.into(),
        }
    }

    fn target_for(&self, proxy: &Proxy) -> Result<ProbeTarget> {
        ProbeTarget::parse(proxy.health_check_url.as_deref().unwrap_or(&self.default_url))
    }

    async fn exchange(&self, proxy: &Proxy) -> Result<()> {
        let target = self.target_for(proxy)?;

        match (proxy.proxy_type, target.secure) {
            // Without TLS on our side, an established tunnel is the reachability signal.
            (_, true) => {
                ProxyTransport::connect(proxy, &target.host, target.port).await?;
                Ok(())
            }
            (ProxyType::Http, false) => {
                let stream = ProxyTransport::connect_proxy(proxy).await?;
                let auth = ProxyTransport::basic_auth(proxy);
                send_get(stream, &target, &target.absolute, auth.as_deref()).await
            }
            (ProxyType::Socks5, false) => {
                let stream = ProxyTransport::connect(proxy, &target.host, target.port).await?;
                send_get(stream, &target, &target.path, None).await
            }
        }
    }
}

#[async_trait]
impl Prober for TransportProber {
    #[instrument(skip(self, proxy), fields(proxy_id = proxy.id, address = %proxy.address()))]
    async fn probe(&self, proxy: &Proxy, probe_timeout: Duration) -> ProbeResult {
        let started = Instant::now();
        let outcome = timeout(probe_timeout, self.exchange(proxy)).await;
        let latency_ms = elapsed_ms(started);

        match outcome {
            Ok(Ok(())) => {
                debug!(latency_ms, "Proxy is healthy");
                ProbeResult::healthy(latency_ms)
            }
            Ok(Err(e)) => {
                warn!(latency_ms, error = %e, "Proxy is unhealthy");
                ProbeResult::failed(latency_ms, e.to_string())
            }
            Err(_) => {
                warn!(latency_ms, "Proxy probe timed out");
                ProbeResult::failed(latency_ms, WardenError::Timeout.to_string())
            }
        }
    }
}

/// Send one GET over an established stream and require a 200
async fn send_get(
    stream: TcpStream,
    target: &ProbeTarget,
    request_target: &str,
    proxy_authorization: Option<&str>,
) -> Result<()> {
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Probe connection closed with error: {}", e);
        }
    });

    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(request_target)
        .header(HOST, target.host_header())
        .header(USER_AGENT, PROBE_USER_AGENT);
    if let Some(auth) = proxy_authorization {
        builder = builder.header(PROXY_AUTHORIZATION, auth);
    }
    let request = builder.body(Empty::<Bytes>::new())?;

    let response = sender.send_request(request).await?;
    if response.status() != StatusCode::OK {
        return Err(WardenError::ProbeFailure(format!(
            "unexpected status {}",
            response.status()
        )));
    }

    Ok(())
}

fn elapsed_ms(started: Instant) -> i32 {
    i32::try_from(started.elapsed().as_millis()).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_proxy;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Local proxy that answers every request with `response`
    async fn fake_proxy(response: &'static [u8]) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        (port, handle)
    }

    fn local_proxy(port: u16) -> Proxy {
        let mut proxy = test_proxy(1, 0);
        proxy.host = "127.0.0.1".to_string();
        proxy.port = port as i32;
        proxy
    }

    #[tokio::test]
    async fn test_http_proxy_absolute_form_get() {
        let (port, request) =
            fake_proxy(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n{}").await;
        let mut proxy = local_proxy(port);
        proxy.username = Some("user".to_string());
        proxy.password = Some("pass".to_string());

        let prober = TransportProber::new("http://example.com/ip");
        let result = prober.probe(&proxy, Duration::from_secs(5)).await;
        assert!(result.success, "{:?}", result.error);
        assert!(result.latency_ms >= 0);

        let request = request.await.unwrap().to_lowercase();
        assert!(request.starts_with("get http://example.com/ip http/1.1"));
        assert!(request.contains("proxy-authorization: basic dxnlcjpwyxnz"));
    }

    #[tokio::test]
    async fn test_non_200_is_failure() {
        let (port, _) =
            fake_proxy(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n").await;
        let proxy = local_proxy(port);

        let prober = TransportProber::new("http://example.com/ip");
        let result = prober.probe(&proxy, Duration::from_secs(5)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("502"));
    }

    #[tokio::test]
    async fn test_https_target_uses_connect_tunnel() {
        let (port, request) = fake_proxy(b"HTTP/1.1 200 Connection established\r\n\r\n").await;
        let proxy = local_proxy(port);

        let prober = TransportProber::new("https://httpbin.org/ip");
        let result = prober.probe(&proxy, Duration::from_secs(5)).await;
        assert!(result.success, "{:?}", result.error);
        assert!(request.await.unwrap().starts_with("CONNECT httpbin.org:443"));
    }

    #[tokio::test]
    async fn test_per_proxy_url_overrides_default() {
        let (port, request) =
            fake_proxy(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let mut proxy = local_proxy(port);
        proxy.health_check_url = Some("http://probe.internal/health".to_string());

        let prober = TransportProber::new("https://httpbin.org/ip");
        assert!(prober.probe(&proxy, Duration::from_secs(5)).await.success);
        assert!(request
            .await
            .unwrap()
            .starts_with("GET http://probe.internal/health HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_silent_proxy_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let prober = TransportProber::new("http://example.com/ip");
        let result = prober
            .probe(&local_proxy(port), Duration::from_millis(100))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Operation timed out"));
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_failure_not_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let prober = TransportProber::new("http://example.com/ip");
        let result = prober
            .probe(&local_proxy(port), Duration::from_secs(5))
            .await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_invalid_check_url_is_failure() {
        let mut proxy = local_proxy(1);
        proxy.health_check_url = Some("gopher://example.com".to_string());

        let prober = TransportProber::new("http://example.com/ip");
        let result = prober.probe(&proxy, Duration::from_secs(1)).await;
        assert!(!result.success);
    }
}
