//! Lookup Service Module
//!
//! Answers whether an external catalog ID still resolves to a playable media
//! ID. Cached mappings are re-checked against the upstream on every read; a
//! failed check replaces the mapping with a tombstone.

use crate::id_cache::{IdMapping, IdResolutionCache};
use crate::media_resolver::{EncodingConstraint, MediaResolver};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct LookupService {
    id_cache: Arc<IdResolutionCache>,
    resolver: Arc<dyn MediaResolver>,
}

impl LookupService {
    pub fn new(id_cache: Arc<IdResolutionCache>, resolver: Arc<dyn MediaResolver>) -> Self {
        Self { id_cache, resolver }
    }

    pub fn id_cache(&self) -> &Arc<IdResolutionCache> {
        &self.id_cache
    }

    /// Store `external_id -> media_id`, replacing any tombstone
    pub fn register(&self, external_id: &str, media_id: &str) {
        info!(external_id = %external_id, media_id = %media_id, "Registering ID mapping");
        self.id_cache.put(external_id, media_id);
    }

    /// Cached media ID for `external_id` if the upstream can still serve it.
    ///
    /// A miss or a tombstone returns `None` without contacting the upstream.
    pub async fn verify(&self, external_id: &str) -> Option<String> {
        let media_id = match self.id_cache.get(external_id)? {
            IdMapping::Media(media_id) => media_id,
            IdMapping::Tombstone => {
                debug!(external_id = %external_id, "ID mapping is tombstoned");
                return None;
            }
        };

        match self.resolver.probe(&media_id, EncodingConstraint::Any).await {
            Ok(_) => Some(media_id),
            Err(e) => {
                warn!(
                    external_id = %external_id,
                    media_id = %media_id,
                    "Verification probe failed, tombstoning mapping: {}",
                    e
                );
                self.id_cache.tombstone(external_id);
                None
            }
        }
    }
}
