//! Proxy Engine Module
//!
//! Range-proxying state machine. Each client request runs in its own
//! [`RangeSession`], which moves through
//!
//! ```text
//! SizeUnknown ──► SizeKnown(T) ──► Streaming ──► Done
//!      │               │               │
//!      └───────────────┴───────────────┴──► Failed
//! ```
//!
//! A session starts in `SizeKnown` when the resource size cache already holds
//! the total length of the media ID under the requested encoding. Size
//! discovery for an open-ended request reuses the discovery fetch as the data
//! stream; a bounded request learns the size through a metadata-only probe
//! that never serves bytes to the client.
//! `Done` and `Failed` during streaming are reported by the [`RangeBody`].
//! An upstream whose announced length disagrees with the resolved range is
//! rejected before any response header is committed.

use crate::media_resolver::{
    AudioFormat, EncodingConstraint, MediaResolver, UpstreamFetch, UpstreamStream,
};
use crate::range_body::RangeBody;
use crate::range_handler::{
    build_content_range_header, parse_range_header, ByteRange, RangeRequest,
};
use crate::size_cache::{ResourceSizeCache, SizeKey};
use crate::{ProxyError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// State of one in-flight range request
#[derive(Debug, Clone, PartialEq)]
pub enum EngineState {
    SizeUnknown,
    SizeKnown(u64),
    Streaming,
    Done,
    Failed(ProxyError),
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Done | EngineState::Failed(_))
    }
}

/// Headers and body for a partial-content response
pub struct RangeResponse {
    pub range: ByteRange,
    pub total: u64,
    pub format: AudioFormat,
    pub body: RangeBody,
}

impl RangeResponse {
    pub fn content_range(&self) -> String {
        build_content_range_header(&self.range, self.total)
    }

    pub fn content_length(&self) -> u64 {
        self.range.len()
    }

    pub fn content_type(&self) -> String {
        self.format.content_type()
    }

    /// Response headers in emission order
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("content-range", self.content_range()),
            ("accept-ranges", "bytes".to_string()),
            ("content-length", self.content_length().to_string()),
            ("content-type", self.content_type()),
        ]
    }
}

impl std::fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeResponse")
            .field("range", &self.range)
            .field("total", &self.total)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct EngineMetrics {
    requests: AtomicU64,
    size_discoveries: AtomicU64,
    probes: AtomicU64,
    fetches: AtomicU64,
    discovery_streams_reused: AtomicU64,
    failures: AtomicU64,
}

/// Snapshot of engine counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct EngineStats {
    pub requests: u64,
    pub size_discoveries: u64,
    pub probes: u64,
    pub fetches: u64,
    pub discovery_streams_reused: u64,
    pub failures: u64,
}

/// Range-proxying engine shared by all requests
pub struct ProxyEngine {
    resolver: Arc<dyn MediaResolver>,
    size_cache: Arc<ResourceSizeCache>,
    read_timeout: Option<Duration>,
    metrics: EngineMetrics,
}

impl ProxyEngine {
    pub fn new(resolver: Arc<dyn MediaResolver>, size_cache: Arc<ResourceSizeCache>) -> Self {
        Self {
            resolver,
            size_cache,
            read_timeout: None,
            metrics: EngineMetrics::default(),
        }
    }

    /// Longest wait for the next upstream chunk while streaming
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn size_cache(&self) -> &Arc<ResourceSizeCache> {
        &self.size_cache
    }

    /// Open a session for one client request.
    ///
    /// The range header is parsed here; a malformed header puts the session
    /// straight into `Failed` without contacting the upstream.
    pub fn session(
        &self,
        media_id: &str,
        encoding: EncodingConstraint,
        range_header: Option<&str>,
    ) -> RangeSession<'_> {
        self.metrics.requests.fetch_add(1, Ordering::Relaxed);
        let size_key = SizeKey::new(media_id, encoding);

        let (request, state, size_from_cache) = match parse_range_header(range_header) {
            Ok(request) => match self.size_cache.get(&size_key) {
                Some(total) => (request, EngineState::SizeKnown(total), true),
                None => (request, EngineState::SizeUnknown, false),
            },
            Err(e) => {
                debug!(media_id = %media_id, "Rejecting malformed Range header: {}", e);
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                (RangeRequest::full(), EngineState::Failed(e), false)
            }
        };

        RangeSession {
            engine: self,
            media_id: media_id.to_string(),
            encoding,
            size_key,
            request,
            state,
            size_from_cache,
            prefetched: None,
            response: None,
        }
    }

    /// Run a full session and return the response to stream
    pub async fn serve(
        &self,
        media_id: &str,
        encoding: EncodingConstraint,
        range_header: Option<&str>,
    ) -> Result<RangeResponse> {
        self.session(media_id, encoding, range_header).run().await
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            requests: self.metrics.requests.load(Ordering::Relaxed),
            size_discoveries: self.metrics.size_discoveries.load(Ordering::Relaxed),
            probes: self.metrics.probes.load(Ordering::Relaxed),
            fetches: self.metrics.fetches.load(Ordering::Relaxed),
            discovery_streams_reused: self.metrics.discovery_streams_reused.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
        }
    }
}

/// Per-request state machine driven by [`RangeSession::step`]
pub struct RangeSession<'a> {
    engine: &'a ProxyEngine,
    media_id: String,
    encoding: EncodingConstraint,
    size_key: SizeKey,
    request: RangeRequest,
    state: EngineState,
    size_from_cache: bool,
    /// Size-discovery stream kept to serve the data
    prefetched: Option<UpstreamStream>,
    response: Option<RangeResponse>,
}

impl<'a> RangeSession<'a> {
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn request(&self) -> &RangeRequest {
        &self.request
    }

    /// Perform one transition
    pub async fn step(&mut self) -> &EngineState {
        let next = match std::mem::replace(&mut self.state, EngineState::SizeUnknown) {
            EngineState::SizeUnknown => self.discover_size().await,
            EngineState::SizeKnown(total) => self.start_streaming(total).await,
            unchanged => {
                self.state = unchanged;
                return &self.state;
            }
        };

        if let EngineState::Failed(e) = &next {
            self.engine.metrics.failures.fetch_add(1, Ordering::Relaxed);
            self.prefetched = None;
            debug!(media_id = %self.media_id, "Session failed: {}", e);
        }

        self.state = next;
        &self.state
    }

    /// Drive the session until it is streaming or failed
    pub async fn run(mut self) -> Result<RangeResponse> {
        loop {
            match &self.state {
                EngineState::Streaming => {
                    return self.response.take().ok_or_else(|| {
                        ProxyError::InternalError("Streaming session without response".to_string())
                    });
                }
                EngineState::Failed(e) => return Err(e.clone()),
                EngineState::Done => {
                    return Err(ProxyError::InternalError(
                        "Session already completed".to_string(),
                    ));
                }
                EngineState::SizeUnknown | EngineState::SizeKnown(_) => {
                    self.step().await;
                }
            }
        }
    }

    /// Take the response once the session reached `Streaming`
    pub fn into_response(mut self) -> Option<RangeResponse> {
        self.response.take()
    }

    async fn discover_size(&mut self) -> EngineState {
        self.engine
            .metrics
            .size_discoveries
            .fetch_add(1, Ordering::Relaxed);

        let discovered = if self.request.is_open_ended() {
            self.discover_with_data_fetch().await
        } else {
            self.discover_with_probe().await
        };

        match discovered {
            Ok(total) => {
                self.engine.size_cache.put(&self.size_key, total);
                EngineState::SizeKnown(total)
            }
            Err(e) => {
                error!(
                    media_id = %self.media_id,
                    range_start = self.request.start,
                    range_end = ?self.request.end,
                    "Size discovery failed: {}",
                    e
                );
                EngineState::Failed(e)
            }
        }
    }

    /// Open-ended request: the fetch that reveals the size also carries the data
    async fn discover_with_data_fetch(&mut self) -> Result<u64> {
        let fetch = UpstreamFetch::new(&self.media_id, self.encoding, self.request.start, None);
        debug!(
            media_id = %self.media_id,
            range = %fetch.range_header(),
            "Size discovery via data fetch"
        );

        self.engine.metrics.fetches.fetch_add(1, Ordering::Relaxed);
        let stream = self.engine.resolver.fetch(&fetch).await?;

        let total = stream
            .metadata
            .resource_size(self.request.start, true)
            .ok_or_else(|| {
                ProxyError::UpstreamFetch("Upstream did not report a content length".to_string())
            })?;

        self.prefetched = Some(stream);
        Ok(total)
    }

    /// Bounded request: learn the size without serving probe bytes
    async fn discover_with_probe(&mut self) -> Result<u64> {
        debug!(media_id = %self.media_id, "Size discovery via metadata probe");

        self.engine.metrics.probes.fetch_add(1, Ordering::Relaxed);
        let metadata = self
            .engine
            .resolver
            .probe(&self.media_id, self.encoding)
            .await?;

        metadata.total_length.ok_or_else(|| {
            ProxyError::UpstreamFetch("Upstream probe did not report a total size".to_string())
        })
    }

    async fn start_streaming(&mut self, total: u64) -> EngineState {
        let range = match self.request.resolve(total) {
            Ok(range) => range,
            Err(e) => {
                debug!(
                    media_id = %self.media_id,
                    start = self.request.start,
                    total,
                    "Range not satisfiable"
                );
                return EngineState::Failed(e);
            }
        };

        let stream = match self.prefetched.take() {
            Some(stream) => {
                self.engine
                    .metrics
                    .discovery_streams_reused
                    .fetch_add(1, Ordering::Relaxed);
                stream
            }
            None => {
                let fetch =
                    UpstreamFetch::new(&self.media_id, self.encoding, range.start, Some(range.end));
                self.engine.metrics.fetches.fetch_add(1, Ordering::Relaxed);
                match self.engine.resolver.fetch(&fetch).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!(
                            media_id = %self.media_id,
                            range_start = range.start,
                            range_end = range.end,
                            "Upstream fetch failed: {}",
                            e
                        );
                        if self.size_from_cache {
                            self.engine.size_cache.invalidate(&self.size_key);
                        }
                        return EngineState::Failed(e);
                    }
                }
            }
        };

        if !self.encoding.matches(&stream.metadata.format) {
            return EngineState::Failed(ProxyError::FormatUnavailable(format!(
                "{} has no {} variant",
                self.media_id, self.encoding
            )));
        }

        if let Some(len) = stream.metadata.content_length {
            if len != range.len() {
                warn!(
                    media_id = %self.media_id,
                    upstream_length = len,
                    range_length = range.len(),
                    total,
                    "Upstream content length disagrees with resolved range"
                );
                // the total this range was resolved against is suspect
                self.engine.size_cache.invalidate(&self.size_key);
                return EngineState::Failed(ProxyError::LengthMismatch {
                    expected: range.len(),
                    actual: len,
                });
            }
        }

        info!(
            media_id = %self.media_id,
            range_start = range.start,
            range_end = range.end,
            total,
            cached_size = self.size_from_cache,
            "Streaming range"
        );

        let UpstreamStream { metadata, body } = stream;
        let mut body = RangeBody::new(body, self.media_id.clone(), range)
            .with_size_cache(Arc::clone(&self.engine.size_cache), self.size_key.clone());
        if let Some(timeout) = self.engine.read_timeout {
            body = body.with_read_timeout(timeout);
        }
        self.response = Some(RangeResponse {
            range,
            total,
            format: metadata.format,
            body,
        });
        EngineState::Streaming
    }
}
