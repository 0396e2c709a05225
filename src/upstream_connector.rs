//! Upstream Connector Module
//!
//! Connector used by the pooled upstream client. Plain `http` origins get a
//! TCP stream, `https` origins a rustls session verified against the system
//! root store. Hyper's legacy client pools whatever this connector returns.

use crate::{ProxyError, Result};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tower::Service;
use tracing::{debug, warn};

/// Connection to an upstream origin
pub enum UpstreamConnection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

fn poll_read_into<T: AsyncRead + Unpin>(
    io: &mut T,
    cx: &mut Context<'_>,
    mut buf: ReadBufCursor<'_>,
) -> Poll<io::Result<()>> {
    let mut tokio_buf = tokio::io::ReadBuf::uninit(unsafe { buf.as_mut() });
    match Pin::new(io).poll_read(cx, &mut tokio_buf) {
        Poll::Ready(Ok(())) => {
            let filled = tokio_buf.filled().len();
            unsafe {
                buf.advance(filled);
            }
            Poll::Ready(Ok(()))
        }
        Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
        Poll::Pending => Poll::Pending,
    }
}

impl Read for UpstreamConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamConnection::Plain(tcp) => poll_read_into(tcp, cx, buf),
            UpstreamConnection::Tls(tls) => poll_read_into(tls.as_mut(), cx, buf),
        }
    }
}

impl Write for UpstreamConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamConnection::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            UpstreamConnection::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamConnection::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            UpstreamConnection::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamConnection::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            UpstreamConnection::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

impl Connection for UpstreamConnection {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Build a TLS connector trusting the system root certificates
pub fn native_tls_connector() -> Result<TlsConnector> {
    let mut root_store = rustls::RootCertStore::empty();

    for cert in rustls_native_certs::load_native_certs()
        .map_err(|e| ProxyError::TlsError(format!("Failed to load native certs: {}", e)))?
    {
        // Skip certificates rustls cannot parse instead of failing startup
        if let Err(e) = root_store.add(cert) {
            debug!("Ignoring unusable root certificate: {}", e);
        }
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::TlsError(format!("Invalid TLS configuration: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

/// Connector for `http` and `https` upstream origins
#[derive(Clone)]
pub struct UpstreamConnector {
    tls_connector: TlsConnector,
    connect_timeout: Duration,
}

impl UpstreamConnector {
    pub fn new(tls_connector: TlsConnector, connect_timeout: Duration) -> Self {
        Self {
            tls_connector,
            connect_timeout,
        }
    }
}

impl Service<Uri> for UpstreamConnector {
    type Response = UpstreamConnection;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls_connector = self.tls_connector.clone();
        let connect_timeout = self.connect_timeout;

        Box::pin(async move {
            let hostname = uri
                .host()
                .ok_or_else(|| ProxyError::ConfigError("No host in upstream URI".to_string()))?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();

            let use_tls = match uri.scheme_str() {
                Some("https") => true,
                Some("http") | None => false,
                Some(other) => {
                    return Err(ProxyError::ConfigError(format!(
                        "Unsupported upstream scheme '{}'",
                        other
                    )))
                }
            };
            let port = uri.port_u16().unwrap_or(if use_tls { 443 } else { 80 });

            debug!("[UPSTREAM_CONNECTOR] Connecting to {}:{}", hostname, port);

            let tcp = tokio::time::timeout(
                connect_timeout,
                TcpStream::connect((hostname.as_str(), port)),
            )
            .await
            .map_err(|_| {
                ProxyError::TimeoutError(format!("Connect to {}:{} timed out", hostname, port))
            })?
            .map_err(|e| {
                warn!(
                    "[UPSTREAM_CONNECTOR] TCP connection failed to {}:{}: {}",
                    hostname, port, e
                );
                ProxyError::ConnectionError(format!(
                    "Failed to connect to {}:{}: {}",
                    hostname, port, e
                ))
            })?;

            if let Err(e) = tcp.set_nodelay(true) {
                warn!(
                    "[UPSTREAM_CONNECTOR] Failed to set TCP_NODELAY for {}:{}: {}",
                    hostname, port, e
                );
            }

            if !use_tls {
                return Ok(UpstreamConnection::Plain(tcp));
            }

            let server_name = ServerName::try_from(hostname.clone()).map_err(|e| {
                ProxyError::TlsError(format!("Invalid server name '{}': {}", hostname, e))
            })?;

            let tls = tls_connector.connect(server_name, tcp).await.map_err(|e| {
                warn!("[UPSTREAM_CONNECTOR] TLS handshake failed to {}: {}", hostname, e);
                ProxyError::TlsError(format!("TLS handshake failed to {}: {}", hostname, e))
            })?;

            debug!("[UPSTREAM_CONNECTOR] TLS session established to {}", hostname);
            Ok(UpstreamConnection::Tls(Box::new(tls)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn test_connector() -> UpstreamConnector {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        UpstreamConnector::new(
            TlsConnector::from(Arc::new(tls_config)),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_plain_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.is_ok() });

        let mut connector = test_connector();
        let uri: Uri = format!("http://127.0.0.1:{}/media", addr.port()).parse().unwrap();
        let stream = connector.call(uri).await.unwrap();

        assert!(matches!(stream, UpstreamConnection::Plain(_)));
        assert!(accept.await.unwrap());
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let mut connector = test_connector();
        let uri: Uri = "ftp://127.0.0.1/media".parse().unwrap();
        assert!(matches!(
            connector.call(uri).await,
            Err(ProxyError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_is_connection_error() {
        // bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut connector = test_connector();
        let uri: Uri = format!("http://127.0.0.1:{}/", port).parse().unwrap();
        assert!(matches!(
            connector.call(uri).await,
            Err(ProxyError::ConnectionError(_))
        ));
    }
}
