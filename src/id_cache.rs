//! ID Resolution Cache Module
//!
//! Maps external catalog IDs to media IDs. A failed verification replaces the
//! mapping with a tombstone so later lookups answer "not resolvable" without
//! contacting the upstream again. Writes are last-writer-wins per key.

use dashmap::DashMap;
use tracing::debug;

/// Cached resolution state for one external catalog ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdMapping {
    Media(String),
    /// Verification failed; the external ID is known to be unresolvable
    Tombstone,
}

impl IdMapping {
    pub fn media_id(&self) -> Option<&str> {
        match self {
            IdMapping::Media(media_id) => Some(media_id),
            IdMapping::Tombstone => None,
        }
    }
}

/// Snapshot of ID cache contents for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct IdCacheStats {
    pub entries: usize,
    pub tombstones: usize,
}

/// Process-wide external ID -> media ID cache
#[derive(Default)]
pub struct IdResolutionCache {
    mappings: DashMap<String, IdMapping>,
}

impl IdResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a mapping, overwriting any tombstone
    pub fn put(&self, external_id: &str, media_id: &str) {
        debug!(external_id = %external_id, media_id = %media_id, "ID mapping registered");
        self.mappings
            .insert(external_id.to_string(), IdMapping::Media(media_id.to_string()));
    }

    pub fn get(&self, external_id: &str) -> Option<IdMapping> {
        self.mappings.get(external_id).map(|entry| entry.clone())
    }

    /// Mark `external_id` as unresolvable
    pub fn tombstone(&self, external_id: &str) {
        debug!(external_id = %external_id, "ID mapping tombstoned");
        self.mappings
            .insert(external_id.to_string(), IdMapping::Tombstone);
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn stats(&self) -> IdCacheStats {
        let tombstones = self
            .mappings
            .iter()
            .filter(|entry| *entry.value() == IdMapping::Tombstone)
            .count();
        IdCacheStats {
            entries: self.mappings.len(),
            tombstones,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let cache = IdResolutionCache::new();
        assert_eq!(cache.get("abc"), None);
        cache.put("abc", "xyz");
        assert_eq!(cache.get("abc"), Some(IdMapping::Media("xyz".to_string())));
        assert_eq!(cache.get("abc").unwrap().media_id(), Some("xyz"));
    }

    #[test]
    fn test_tombstone_and_reregister() {
        let cache = IdResolutionCache::new();
        cache.put("abc", "xyz");
        cache.tombstone("abc");
        assert_eq!(cache.get("abc"), Some(IdMapping::Tombstone));
        assert_eq!(cache.stats(), IdCacheStats { entries: 1, tombstones: 1 });

        cache.put("abc", "xyz2");
        assert_eq!(cache.get("abc").unwrap().media_id(), Some("xyz2"));
        assert_eq!(cache.stats().tombstones, 0);
    }
}
