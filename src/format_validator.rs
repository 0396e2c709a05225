//! Format Validator Module
//!
//! Checks whether the upstream can produce a stream for a media ID under an
//! encoding constraint. Only metadata is requested; no audio payload is
//! transferred.

use crate::media_resolver::{EncodingConstraint, MediaResolver};
use crate::ProxyError;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct FormatValidator {
    resolver: Arc<dyn MediaResolver>,
}

impl FormatValidator {
    pub fn new(resolver: Arc<dyn MediaResolver>) -> Self {
        Self { resolver }
    }

    pub async fn is_valid_format(&self, media_id: &str, encoding: EncodingConstraint) -> bool {
        match self.resolver.probe(media_id, encoding).await {
            Ok(metadata) => {
                let valid = encoding.matches(&metadata.format);
                debug!(
                    media_id = %media_id,
                    encoding = %encoding,
                    format = ?metadata.format,
                    valid,
                    "Format probe completed"
                );
                valid
            }
            Err(ProxyError::FormatUnavailable(_)) | Err(ProxyError::UnresolvedMedia(_)) => false,
            Err(e) => {
                warn!(
                    media_id = %media_id,
                    encoding = %encoding,
                    "Format probe failed: {}",
                    e
                );
                false
            }
        }
    }
}
