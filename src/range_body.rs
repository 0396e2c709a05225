//! Range Body Module
//!
//! Wraps an upstream payload stream while it is piped to the client. The
//! wrapper passes chunks through untouched and in order, counts them against
//! the byte count promised in `Content-Length`, and reports the terminal state
//! of the transfer. Backpressure comes from the consumer: a chunk is only
//! pulled from upstream when the client connection asks for the next one.
//!
//! Dropping the wrapper before the upstream finished (client disconnect)
//! drops the upstream stream with it, which tears down the upstream fetch.
//! A read timeout bounds how long the wrapper waits for the next chunk; an
//! upstream that stalls past it fails the transfer and is released at once.

use crate::media_resolver::ByteStream;
use crate::proxy_engine::EngineState;
use crate::range_handler::ByteRange;
use crate::size_cache::{ResourceSizeCache, SizeKey};
use crate::{ProxyError, Result};
use bytes::Bytes;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Sleep;
use tracing::{debug, error, info, trace};

/// Length-verified stream of one served byte range
pub struct RangeBody {
    inner: ByteStream,
    media_id: String,
    range: ByteRange,
    expected: u64,
    received: u64,
    chunks: u64,
    state: EngineState,
    /// Cache entry dropped when the transfer fails
    size_cache: Option<(Arc<ResourceSizeCache>, SizeKey)>,
    read_timeout: Option<Duration>,
    /// Armed on the first pending poll after a chunk
    idle: Option<Pin<Box<Sleep>>>,
}

impl RangeBody {
    pub fn new(inner: ByteStream, media_id: impl Into<String>, range: ByteRange) -> Self {
        Self {
            inner,
            media_id: media_id.into(),
            range,
            expected: range.len(),
            received: 0,
            chunks: 0,
            state: EngineState::Streaming,
            size_cache: None,
            read_timeout: None,
            idle: None,
        }
    }

    /// Invalidate the cached size under `key` if the transfer fails
    pub fn with_size_cache(mut self, size_cache: Arc<ResourceSizeCache>, key: SizeKey) -> Self {
        self.size_cache = Some((size_cache, key));
        self
    }

    /// Fail the transfer when no chunk arrives within `timeout`
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    /// Current state: `Streaming`, `Done` or `Failed`
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    pub fn expected_len(&self) -> u64 {
        self.expected
    }

    fn fail(&mut self, err: ProxyError) -> Poll<Option<Result<Bytes>>> {
        error!(
            media_id = %self.media_id,
            range_start = self.range.start,
            range_end = self.range.end,
            bytes_received = self.received,
            "Upstream stream failed mid-transfer: {}",
            err
        );
        if let Some((size_cache, key)) = &self.size_cache {
            size_cache.invalidate(key);
        }
        // release the upstream connection now, not when the client hangs up
        self.inner = Box::pin(futures::stream::empty::<Result<Bytes>>());
        self.idle = None;
        self.state = EngineState::Failed(err.clone());
        Poll::Ready(Some(Err(err)))
    }
}

impl Stream for RangeBody {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !matches!(self.state, EngineState::Streaming) {
            return Poll::Ready(None);
        }

        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.idle = None;
                self.received += chunk.len() as u64;
                self.chunks += 1;

                if self.received > self.expected {
                    let err = ProxyError::LengthMismatch {
                        expected: self.expected,
                        actual: self.received,
                    };
                    return self.fail(err);
                }

                trace!(
                    media_id = %self.media_id,
                    chunk = self.chunks,
                    chunk_bytes = chunk.len(),
                    bytes_sent = self.received,
                    "Sent chunk"
                );
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => self.fail(e),
            Poll::Ready(None) => {
                if self.received != self.expected {
                    let err = ProxyError::LengthMismatch {
                        expected: self.expected,
                        actual: self.received,
                    };
                    return self.fail(err);
                }

                info!(
                    media_id = %self.media_id,
                    range_start = self.range.start,
                    range_end = self.range.end,
                    chunks = self.chunks,
                    "Finished streaming range"
                );
                self.state = EngineState::Done;
                Poll::Ready(None)
            }
            Poll::Pending => {
                let Some(timeout) = self.read_timeout else {
                    return Poll::Pending;
                };
                let expired = self
                    .idle
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)))
                    .as_mut()
                    .poll(cx)
                    .is_ready();
                if expired {
                    let err = ProxyError::TimeoutError(format!(
                        "No upstream data for {}s after {} bytes",
                        timeout.as_secs(),
                        self.received
                    ));
                    return self.fail(err);
                }
                Poll::Pending
            }
        }
    }
}

impl Drop for RangeBody {
    fn drop(&mut self) {
        if matches!(self.state, EngineState::Streaming) {
            debug!(
                media_id = %self.media_id,
                bytes_sent = self.received,
                bytes_expected = self.expected,
                "Client went away mid-stream, cancelling upstream fetch"
            );
        }
    }
}
