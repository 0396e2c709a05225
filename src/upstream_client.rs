//! Upstream Client Module
//!
//! HTTP implementation of [`MediaResolver`] against a configurable media
//! origin. Media is addressed as `{base_url}/{media_id}`; the encoding
//! constraint travels as the `encoding` query parameter. Connections are pooled
//! by hyper-util's legacy client. Failed requests are not retried here: the
//! proxy engine reports the failure and the client decides whether to retry.

use crate::config::UpstreamConfig;
use crate::media_resolver::{
    AudioFormat, EncodingConstraint, MediaResolver, StreamMetadata, UpstreamFetch, UpstreamStream,
};
use crate::range_handler::parse_content_range;
use crate::upstream_connector::{native_tls_connector, UpstreamConnector};
use crate::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::time::{Duration, Instant};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Everything except RFC 3986 unreserved characters
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Pooled HTTP client for the upstream media origin
pub struct UpstreamClient {
    client: Client<UpstreamConnector, Empty<Bytes>>,
    base_url: String,
    request_timeout: Duration,
}

impl UpstreamClient {
    /// Create a client trusting the system root certificates
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        Ok(Self::with_tls_connector(config, native_tls_connector()?))
    }

    pub fn with_tls_connector(config: &UpstreamConfig, tls_connector: TlsConnector) -> Self {
        let connector = UpstreamConnector::new(tls_connector, config.connect_timeout);

        debug!(
            "Creating upstream client (idle_timeout: {}s, max_idle_per_host: {})",
            config.idle_timeout.as_secs(),
            config.max_idle_per_host
        );

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.idle_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .build(connector);

        Self {
            client,
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
        }
    }

    /// Upstream URI for a media ID under an encoding constraint
    pub fn media_uri(&self, media_id: &str, encoding: EncodingConstraint) -> Result<Uri> {
        if media_id.is_empty() {
            return Err(ProxyError::InvalidRequest("Empty media ID".to_string()));
        }

        let mut uri = format!("{}/{}", self.base_url, encode_path_segment(media_id));
        if encoding != EncodingConstraint::Any {
            uri.push_str("?encoding=");
            uri.push_str(encoding.as_param());
        }

        uri.parse::<Uri>()
            .map_err(|e| ProxyError::ConfigError(format!("Invalid upstream URI '{}': {}", uri, e)))
    }

    async fn send(
        &self,
        method: Method,
        uri: Uri,
        range: Option<String>,
    ) -> Result<Response<Incoming>> {
        let mut builder = Request::builder().method(&method).uri(&uri);
        if let Some(range) = &range {
            builder = builder.header(RANGE, range);
        }

        let request = builder
            .body(Empty::new())
            .map_err(|e| ProxyError::HttpError(format!("Failed to build request: {}", e)))?;

        debug!("Sending {} {} (range: {:?})", method, uri, range);
        let start = Instant::now();

        let response = tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| {
                ProxyError::TimeoutError(format!(
                    "No upstream response within {}s",
                    self.request_timeout.as_secs()
                ))
            })?
            .map_err(|e| {
                if e.is_connect() {
                    ProxyError::ConnectionError(format!("Failed to connect upstream: {:?}", e))
                } else {
                    ProxyError::HttpError(format!("Failed to send request: {}", e))
                }
            })?;

        debug!(
            "Received {} from {} in {}ms",
            response.status(),
            uri,
            start.elapsed().as_millis()
        );
        Ok(response)
    }
}

impl Clone for UpstreamClient {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

#[async_trait]
impl MediaResolver for UpstreamClient {
    async fn fetch(&self, fetch: &UpstreamFetch) -> Result<UpstreamStream> {
        let uri = self.media_uri(&fetch.media_id, fetch.encoding)?;
        let response = self
            .send(Method::GET, uri, Some(fetch.range_header()))
            .await?;

        let (parts, body) = response.into_parts();
        let metadata = fetch_metadata(&fetch.media_id, fetch, parts.status, &parts.headers)?;
        check_format(&fetch.media_id, fetch.encoding, &metadata.format)?;

        let body = body
            .into_data_stream()
            .map_err(|e| ProxyError::UpstreamFetch(format!("Upstream body failed: {}", e)))
            .boxed();

        Ok(UpstreamStream { metadata, body })
    }

    async fn probe(&self, media_id: &str, encoding: EncodingConstraint) -> Result<StreamMetadata> {
        let uri = self.media_uri(media_id, encoding)?;
        let response = self.send(Method::HEAD, uri, None).await?;
        let status = response.status();

        if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
            // origin without HEAD support: fall back to a one-byte fetch
            debug!(media_id = %media_id, "HEAD not supported upstream, probing with ranged GET");
            let fetch = UpstreamFetch::new(media_id, encoding, 0, Some(0));
            let UpstreamStream { metadata, .. } = self.fetch(&fetch).await?;
            return Ok(metadata);
        }

        check_status(media_id, status)?;
        if status != StatusCode::OK {
            return Err(ProxyError::UpstreamFetch(format!(
                "Unexpected probe status {} for {}",
                status, media_id
            )));
        }

        let headers = response.headers();
        let content_length = header_u64(headers, CONTENT_LENGTH.as_str());
        let metadata = StreamMetadata {
            total_length: content_length,
            content_length,
            format: header_format(headers),
        };
        check_format(media_id, encoding, &metadata.format)?;
        Ok(metadata)
    }
}

/// Map error statuses shared by probes and fetches
fn check_status(media_id: &str, status: StatusCode) -> Result<()> {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(ProxyError::UnresolvedMedia(format!(
            "{} not found upstream ({})",
            media_id, status
        ))),
        s if s.is_success() => Ok(()),
        s => {
            warn!(media_id = %media_id, status = %s, "Upstream returned error status");
            Err(ProxyError::UpstreamFetch(format!(
                "Upstream returned {} for {}",
                s, media_id
            )))
        }
    }
}

fn fetch_metadata(
    media_id: &str,
    fetch: &UpstreamFetch,
    status: StatusCode,
    headers: &HeaderMap,
) -> Result<StreamMetadata> {
    if status == StatusCode::RANGE_NOT_SATISFIABLE {
        // "bytes */T" carries the real size
        let total = headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().strip_prefix("bytes */"))
            .and_then(|t| t.parse::<u64>().ok());
        return Err(match total {
            Some(total) => ProxyError::RangeNotSatisfiable { total },
            None => ProxyError::UpstreamFetch(format!(
                "Upstream rejected range {} for {}",
                fetch.range_header(),
                media_id
            )),
        });
    }

    check_status(media_id, status)?;

    let content_length = header_u64(headers, CONTENT_LENGTH.as_str());
    let format = header_format(headers);

    match status {
        StatusCode::PARTIAL_CONTENT => {
            let content_range = headers
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range);

            let total_length = match content_range {
                Some((start, _, total)) => {
                    if start != fetch.lower {
                        return Err(ProxyError::UpstreamFetch(format!(
                            "Upstream served offset {} instead of {} for {}",
                            start, fetch.lower, media_id
                        )));
                    }
                    total
                }
                None => None,
            };

            Ok(StreamMetadata {
                total_length,
                content_length,
                format,
            })
        }
        StatusCode::OK => {
            // Range ignored: only usable when the whole resource was asked for
            let whole = fetch.lower == 0
                && match (fetch.upper, content_length) {
                    (None, _) => true,
                    (Some(upper), Some(len)) => upper + 1 == len,
                    (Some(_), None) => false,
                };
            if !whole {
                return Err(ProxyError::UpstreamFetch(format!(
                    "Upstream ignored range {} for {}",
                    fetch.range_header(),
                    media_id
                )));
            }
            Ok(StreamMetadata {
                total_length: content_length,
                content_length,
                format,
            })
        }
        other => Err(ProxyError::UpstreamFetch(format!(
            "Unexpected upstream status {} for {}",
            other, media_id
        ))),
    }
}

fn check_format(media_id: &str, encoding: EncodingConstraint, format: &AudioFormat) -> Result<()> {
    if encoding.matches(format) {
        Ok(())
    } else {
        debug!(
            media_id = %media_id,
            requested = %encoding,
            negotiated = ?format,
            "Upstream format does not satisfy encoding constraint"
        );
        Err(ProxyError::FormatUnavailable(format!(
            "{} has no {} stream",
            media_id, encoding
        )))
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn header_format(headers: &HeaderMap) -> AudioFormat {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(AudioFormat::from_content_type)
        .unwrap_or_default()
}

/// Percent-encode everything outside the RFC 3986 unreserved set
fn encode_path_segment(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT).to_string()
}
