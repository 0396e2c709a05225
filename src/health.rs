//! Health Check Module
//!
//! Builds the `/health` status document: process uptime plus a snapshot of
//! the caches and engine counters.

use crate::id_cache::{IdCacheStats, IdResolutionCache};
use crate::proxy_engine::{EngineStats, ProxyEngine};
use crate::size_cache::{ResourceSizeCache, SizeCacheStats};
use crate::{ProxyError, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Health check status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Overall system health
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub version: &'static str,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub size_cache: SizeCacheStats,
    pub id_cache: IdCacheStats,
    pub engine: EngineStats,
}

/// Health check manager
pub struct HealthManager {
    start_time: Instant,
    size_cache: Arc<ResourceSizeCache>,
    id_cache: Arc<IdResolutionCache>,
    engine: Arc<ProxyEngine>,
}

impl HealthManager {
    pub fn new(
        size_cache: Arc<ResourceSizeCache>,
        id_cache: Arc<IdResolutionCache>,
        engine: Arc<ProxyEngine>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            size_cache,
            id_cache,
            engine,
        }
    }

    pub fn check_health(&self) -> SystemHealth {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        SystemHealth {
            // no component can degrade in-process; upstream failures surface per request
            status: HealthStatus::Healthy,
            version: env!("CARGO_PKG_VERSION"),
            timestamp,
            uptime_seconds: self.start_time.elapsed().as_secs(),
            size_cache: self.size_cache.stats(),
            id_cache: self.id_cache.stats(),
            engine: self.engine.stats(),
        }
    }

    /// Health document as pretty-printed JSON
    pub fn health_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.check_health()).map_err(|e| {
            ProxyError::SerializationError(format!("Failed to serialize health status: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_resolver::{EncodingConstraint, MediaResolver, UpstreamFetch, UpstreamStream};
    use crate::size_cache::SizeKey;
    use async_trait::async_trait;

    struct NoUpstream;

    #[async_trait]
    impl MediaResolver for NoUpstream {
        async fn fetch(&self, fetch: &UpstreamFetch) -> Result<UpstreamStream> {
            Err(ProxyError::UnresolvedMedia(fetch.media_id.clone()))
        }
    }

    #[test]
    fn test_health_document() {
        let size_cache = Arc::new(ResourceSizeCache::unbounded());
        let id_cache = Arc::new(IdResolutionCache::new());
        let engine = Arc::new(ProxyEngine::new(Arc::new(NoUpstream), Arc::clone(&size_cache)));

        size_cache.put(&SizeKey::new("vid1", EncodingConstraint::Any), 1000);
        id_cache.put("abc", "vid1");
        id_cache.tombstone("def");

        let health = HealthManager::new(size_cache, id_cache, engine);
        let json: serde_json::Value = serde_json::from_str(&health.health_json().unwrap()).unwrap();

        assert_eq!(json["status"], "Healthy");
        assert_eq!(json["sizeCache"]["entries"], 1);
        assert_eq!(json["idCache"]["entries"], 2);
        assert_eq!(json["idCache"]["tombstones"], 1);
        assert_eq!(json["engine"]["requests"], 0);
    }
}
