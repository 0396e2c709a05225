//! Media Resolver Module
//!
//! Contract for the upstream media resolver: given a media ID, an encoding
//! constraint and a byte range it yields response metadata plus a byte stream.
//! Dropping an [`UpstreamStream`] tears down the upstream transfer.

use crate::range_handler::build_upstream_range_header;
use crate::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;
use tracing::debug;

/// Boxed upstream payload stream
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Audio container negotiated with the upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Container {
    Mp4,
    Webm,
    Mpeg,
    Ogg,
    Other(String),
}

/// Audio codec negotiated with the upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
    Opus,
    Vorbis,
    Mp3,
    Unknown,
}

/// Negotiated stream format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    pub container: Container,
    pub codec: AudioCodec,
}

impl Default for AudioFormat {
    /// MP3 in an MPEG container, used when the upstream does not say
    fn default() -> Self {
        Self {
            container: Container::Mpeg,
            codec: AudioCodec::Mp3,
        }
    }
}

impl AudioFormat {
    pub fn new(container: Container, codec: AudioCodec) -> Self {
        Self { container, codec }
    }

    pub fn mp4_aac() -> Self {
        Self::new(Container::Mp4, AudioCodec::Aac)
    }

    pub fn webm_opus() -> Self {
        Self::new(Container::Webm, AudioCodec::Opus)
    }

    /// Parse a `Content-Type` value such as `audio/webm; codecs="opus"`
    pub fn from_content_type(content_type: &str) -> Self {
        let mut parts = content_type.split(';');
        let mime = parts.next().unwrap_or("").trim().to_ascii_lowercase();

        let codecs = parts
            .filter_map(|param| {
                let (name, value) = param.split_once('=')?;
                if name.trim().eq_ignore_ascii_case("codecs") {
                    Some(value.trim().trim_matches('"').to_ascii_lowercase())
                } else {
                    None
                }
            })
            .next();

        let container = match mime.as_str() {
            "audio/mp4" | "audio/m4a" | "audio/x-m4a" | "audio/aac" | "video/mp4" => Container::Mp4,
            "audio/webm" | "video/webm" => Container::Webm,
            "audio/mpeg" | "audio/mp3" => Container::Mpeg,
            "audio/ogg" | "application/ogg" => Container::Ogg,
            "" => return Self::default(),
            other => Container::Other(other.to_string()),
        };

        let codec = match codecs.as_deref() {
            Some(c) if c.starts_with("mp4a") || c.contains("aac") => AudioCodec::Aac,
            Some(c) if c.contains("opus") => AudioCodec::Opus,
            Some(c) if c.contains("vorbis") => AudioCodec::Vorbis,
            Some(c) if c.contains("mp3") => AudioCodec::Mp3,
            Some(_) => AudioCodec::Unknown,
            None => match container {
                Container::Mp4 => AudioCodec::Aac,
                Container::Webm => AudioCodec::Opus,
                Container::Mpeg => AudioCodec::Mp3,
                Container::Ogg => AudioCodec::Vorbis,
                Container::Other(_) => AudioCodec::Unknown,
            },
        };

        Self { container, codec }
    }

    /// `Content-Type` value for client responses
    pub fn content_type(&self) -> String {
        match (&self.container, self.codec) {
            (Container::Mp4, _) => "audio/mp4".to_string(),
            (Container::Webm, AudioCodec::Opus) => "audio/webm; codecs=\"opus\"".to_string(),
            (Container::Webm, _) => "audio/webm".to_string(),
            (Container::Mpeg, _) => "audio/mpeg".to_string(),
            (Container::Ogg, _) => "audio/ogg".to_string(),
            (Container::Other(mime), _) => mime.clone(),
        }
    }
}

/// Encoding preference a client may attach to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum EncodingConstraint {
    /// Any audio-only variant
    #[default]
    Any,
    /// AAC audio in an MP4 container
    Mp4Aac,
    /// Opus audio in a WebM container
    WebmOpus,
}

impl EncodingConstraint {
    /// Parse a request parameter value
    pub fn from_param(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "any" => Ok(EncodingConstraint::Any),
            "aac" | "mp4" | "m4a" | "mp4-aac" => Ok(EncodingConstraint::Mp4Aac),
            "opus" | "webm" | "webm-opus" => Ok(EncodingConstraint::WebmOpus),
            other => Err(ProxyError::InvalidRequest(format!(
                "Unknown encoding '{}'",
                other
            ))),
        }
    }

    /// Value forwarded upstream as the `encoding` query parameter
    pub fn as_param(&self) -> &'static str {
        match self {
            EncodingConstraint::Any => "any",
            EncodingConstraint::Mp4Aac => "aac",
            EncodingConstraint::WebmOpus => "opus",
        }
    }

    /// Whether a negotiated format satisfies this constraint
    pub fn matches(&self, format: &AudioFormat) -> bool {
        match self {
            EncodingConstraint::Any => true,
            EncodingConstraint::Mp4Aac => {
                format.container == Container::Mp4 && format.codec == AudioCodec::Aac
            }
            EncodingConstraint::WebmOpus => {
                format.container == Container::Webm && format.codec == AudioCodec::Opus
            }
        }
    }
}

impl fmt::Display for EncodingConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_param())
    }
}

/// One request to the upstream resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFetch {
    pub media_id: String,
    pub encoding: EncodingConstraint,
    pub lower: u64,
    /// Inclusive upper bound, `None` reads to the end of the resource
    pub upper: Option<u64>,
}

impl UpstreamFetch {
    pub fn new(
        media_id: impl Into<String>,
        encoding: EncodingConstraint,
        lower: u64,
        upper: Option<u64>,
    ) -> Self {
        Self {
            media_id: media_id.into(),
            encoding,
            lower,
            upper,
        }
    }

    /// `Range` header value for this fetch
    pub fn range_header(&self) -> String {
        build_upstream_range_header(self.lower, self.upper)
    }
}

/// Response metadata reported by the upstream resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetadata {
    /// Total length of the whole resource, when the upstream reports it
    pub total_length: Option<u64>,
    /// Length of this response's payload
    pub content_length: Option<u64>,
    pub format: AudioFormat,
}

impl StreamMetadata {
    /// Total resource size implied by a fetch starting at `lower`.
    ///
    /// Prefers the reported total; otherwise a fetch that reads to the end
    /// covers `lower + content_length` bytes.
    pub fn resource_size(&self, lower: u64, open_ended: bool) -> Option<u64> {
        match (self.total_length, self.content_length) {
            (Some(total), _) => Some(total),
            (None, Some(len)) if open_ended => Some(lower + len),
            _ => None,
        }
    }
}

/// Metadata plus the payload stream of one upstream fetch
pub struct UpstreamStream {
    pub metadata: StreamMetadata,
    pub body: ByteStream,
}

impl fmt::Debug for UpstreamStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamStream")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// The upstream media resolver collaborator
#[async_trait]
pub trait MediaResolver: Send + Sync {
    /// Start a fetch for the given range; payload bytes flow through the body
    async fn fetch(&self, fetch: &UpstreamFetch) -> Result<UpstreamStream>;

    /// Learn resource metadata without serving payload bytes.
    ///
    /// The default issues a one-byte fetch and drops the body as soon as the
    /// metadata has arrived.
    async fn probe(&self, media_id: &str, encoding: EncodingConstraint) -> Result<StreamMetadata> {
        let fetch = UpstreamFetch::new(media_id, encoding, 0, Some(0));
        let UpstreamStream { metadata, body } = self.fetch(&fetch).await?;
        drop(body);
        debug!(media_id = %media_id, "Probe stream torn down after metadata");
        Ok(metadata)
    }
}
