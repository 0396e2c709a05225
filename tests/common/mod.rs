//! Shared fixtures for integration tests: an in-memory media resolver with
//! call counters and an in-process HTTP origin.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use media_range_proxy::media_resolver::{
    AudioFormat, EncodingConstraint, MediaResolver, StreamMetadata, UpstreamFetch, UpstreamStream,
};
use media_range_proxy::range_handler::parse_range_header;
use media_range_proxy::{ProxyError, Result};
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

/// Deterministic payload of `len` bytes
pub fn media_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Increments a counter when the owning upstream stream is dropped
struct DropGuard(Arc<AtomicUsize>);

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct FakeMedia {
    data: Vec<u8>,
    format: AudioFormat,
}

/// In-memory resolver. Behaves like a well-formed origin unless told otherwise.
#[derive(Default)]
pub struct FakeResolver {
    /// Encoded variants per media ID
    media: Mutex<HashMap<String, Vec<FakeMedia>>>,
    /// Media IDs whose fetches fail before any byte arrives
    failing: Mutex<HashSet<String>>,
    /// Media IDs whose streams stall forever after the first chunk
    stalling: Mutex<HashSet<String>>,
    /// Media IDs whose streams end one byte early
    truncating: Mutex<HashSet<String>>,
    /// Media IDs whose fetches announce a wrong content length
    misreporting: Mutex<HashMap<String, u64>>,
    pub fetch_log: Mutex<Vec<UpstreamFetch>>,
    pub probes: AtomicUsize,
    pub streams_dropped: Arc<AtomicUsize>,
    pub chunk_size: usize,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self {
            chunk_size: 64,
            ..Default::default()
        }
    }

    pub fn with_media(self, media_id: &str, len: usize, format: AudioFormat) -> Self {
        self.add_media(media_id, len, format);
        self
    }

    pub fn add_media(&self, media_id: &str, len: usize, format: AudioFormat) {
        self.media.lock().unwrap().insert(
            media_id.to_string(),
            vec![FakeMedia {
                data: media_bytes(len),
                format,
            }],
        );
    }

    /// Add another encoding of `media_id` with its own length
    pub fn with_variant(self, media_id: &str, len: usize, format: AudioFormat) -> Self {
        self.media
            .lock()
            .unwrap()
            .entry(media_id.to_string())
            .or_default()
            .push(FakeMedia {
                data: media_bytes(len),
                format,
            });
        self
    }

    pub fn remove_media(&self, media_id: &str) {
        self.media.lock().unwrap().remove(media_id);
    }

    pub fn fail(&self, media_id: &str) {
        self.failing.lock().unwrap().insert(media_id.to_string());
    }

    pub fn recover(&self, media_id: &str) {
        self.failing.lock().unwrap().remove(media_id);
    }

    pub fn stall(&self, media_id: &str) {
        self.stalling.lock().unwrap().insert(media_id.to_string());
    }

    pub fn truncate(&self, media_id: &str) {
        self.truncating.lock().unwrap().insert(media_id.to_string());
    }

    /// Announce `content_length` on every fetch of `media_id`
    pub fn misreport_length(&self, media_id: &str, content_length: u64) {
        self.misreporting
            .lock()
            .unwrap()
            .insert(media_id.to_string(), content_length);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_log.lock().unwrap().len()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn dropped_count(&self) -> usize {
        self.streams_dropped.load(Ordering::SeqCst)
    }

    fn lookup(&self, media_id: &str, encoding: EncodingConstraint) -> Result<FakeMedia> {
        if self.failing.lock().unwrap().contains(media_id) {
            return Err(ProxyError::UpstreamFetch(format!(
                "connection reset while fetching {}",
                media_id
            )));
        }
        let media = self.media.lock().unwrap();
        let variants = media
            .get(media_id)
            .ok_or_else(|| ProxyError::UnresolvedMedia(media_id.to_string()))?;
        variants
            .iter()
            .find(|variant| encoding.matches(&variant.format))
            .cloned()
            .ok_or_else(|| ProxyError::FormatUnavailable(media_id.to_string()))
    }
}

#[async_trait]
impl MediaResolver for FakeResolver {
    async fn fetch(&self, fetch: &UpstreamFetch) -> Result<UpstreamStream> {
        self.fetch_log.lock().unwrap().push(fetch.clone());
        let media = self.lookup(&fetch.media_id, fetch.encoding)?;

        let total = media.data.len() as u64;
        if fetch.lower >= total {
            return Err(ProxyError::RangeNotSatisfiable { total });
        }
        let end = fetch.upper.map(|u| u.min(total - 1)).unwrap_or(total - 1);
        let mut slice = media.data[fetch.lower as usize..=end as usize].to_vec();
        let content_length = self
            .misreporting
            .lock()
            .unwrap()
            .get(&fetch.media_id)
            .copied()
            .unwrap_or(slice.len() as u64);
        if self.truncating.lock().unwrap().contains(&fetch.media_id) {
            slice.pop();
        }

        let chunks: Vec<Result<Bytes>> = slice
            .chunks(self.chunk_size.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let guard = DropGuard(Arc::clone(&self.streams_dropped));
        let body = if self.stalling.lock().unwrap().contains(&fetch.media_id) {
            stream::iter(chunks.into_iter().take(1))
                .chain(stream::pending())
                .map(move |chunk| {
                    let _guard = &guard;
                    chunk
                })
                .boxed()
        } else {
            stream::iter(chunks)
                .map(move |chunk| {
                    let _guard = &guard;
                    chunk
                })
                .boxed()
        };

        Ok(UpstreamStream {
            metadata: StreamMetadata {
                total_length: Some(total),
                content_length: Some(content_length),
                format: media.format,
            },
            body,
        })
    }

    async fn probe(&self, media_id: &str, encoding: EncodingConstraint) -> Result<StreamMetadata> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let media = self.lookup(media_id, encoding)?;
        let total = media.data.len() as u64;
        Ok(StreamMetadata {
            total_length: Some(total),
            content_length: Some(total),
            format: media.format,
        })
    }
}

/// Request counters of an [`Origin`]
#[derive(Default)]
pub struct OriginStats {
    pub gets: AtomicUsize,
    pub heads: AtomicUsize,
}

/// In-process HTTP media origin serving `/media/{id}` with byte ranges
pub struct Origin {
    pub addr: SocketAddr,
    pub stats: Arc<OriginStats>,
}

impl Origin {
    pub fn base_url(&self) -> String {
        format!("http://{}/media", self.addr)
    }
}

/// Start an origin holding `media` (id -> (payload, content type)).
/// Requests for `bad` answer 500.
pub async fn start_origin(media: HashMap<String, (Vec<u8>, String)>) -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stats = Arc::new(OriginStats::default());
    let media = Arc::new(media);

    let origin_stats = Arc::clone(&stats);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let media = Arc::clone(&media);
            let stats = Arc::clone(&origin_stats);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let media = Arc::clone(&media);
                    let stats = Arc::clone(&stats);
                    async move { Ok::<_, Infallible>(serve_origin(req, &media, &stats)) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Origin { addr, stats }
}

fn serve_origin<B>(
    req: Request<B>,
    media: &HashMap<String, (Vec<u8>, String)>,
    stats: &OriginStats,
) -> Response<http_body_util::combinators::BoxBody<Bytes, Infallible>> {
    let respond = |status: StatusCode, headers: Vec<(&str, String)>, body: Vec<u8>| {
        let mut builder = Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder.body(Full::new(Bytes::from(body)).boxed()).unwrap()
    };

    let is_head = req.method() == Method::HEAD;
    if is_head {
        stats.heads.fetch_add(1, Ordering::SeqCst);
    } else {
        stats.gets.fetch_add(1, Ordering::SeqCst);
    }

    let id = req
        .uri()
        .path()
        .strip_prefix("/media/")
        .unwrap_or_default()
        .to_string();
    if id == "bad" {
        return respond(StatusCode::INTERNAL_SERVER_ERROR, vec![], b"boom".to_vec());
    }
    let Some((data, content_type)) = media.get(&id) else {
        return respond(StatusCode::NOT_FOUND, vec![], vec![]);
    };
    let total = data.len() as u64;

    if is_head {
        return respond(
            StatusCode::OK,
            vec![
                ("content-type", content_type.clone()),
                ("content-length", total.to_string()),
            ],
            vec![],
        );
    }

    let range = req
        .headers()
        .get("range")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let Ok(requested) = parse_range_header(range.as_deref()) else {
        return respond(StatusCode::BAD_REQUEST, vec![], vec![]);
    };
    let Ok(resolved) = requested.resolve(total) else {
        return respond(
            StatusCode::RANGE_NOT_SATISFIABLE,
            vec![("content-range", format!("bytes */{}", total))],
            vec![],
        );
    };

    let body = data[resolved.start as usize..=resolved.end as usize].to_vec();
    respond(
        StatusCode::PARTIAL_CONTENT,
        vec![
            ("content-type", content_type.clone()),
            (
                "content-range",
                format!("bytes {}-{}/{}", resolved.start, resolved.end, total),
            ),
            ("content-length", body.len().to_string()),
        ],
        body,
    )
}
