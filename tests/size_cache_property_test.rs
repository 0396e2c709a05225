//! Property-based tests for size discovery and caching
//!
//! Whatever sequence of ranges clients request for one media ID, the size
//! is discovered upstream once, the cached value never changes, and each
//! response declares exactly the bytes it carries.

mod common;

use common::FakeResolver;
use futures::StreamExt;
use media_range_proxy::media_resolver::{AudioFormat, EncodingConstraint};
use media_range_proxy::proxy_engine::ProxyEngine;
use media_range_proxy::size_cache::{ResourceSizeCache, SizeKey};
use quickcheck::TestResult;
use quickcheck_macros::quickcheck;
use std::sync::Arc;

#[quickcheck]
fn prop_size_discovered_once(total: u16, starts: Vec<(u16, Option<u16>)>) -> TestResult {
    let total = total as u64 + 1;
    if starts.is_empty() || starts.len() > 20 {
        return TestResult::discard();
    }

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let resolver = Arc::new(FakeResolver::new().with_media(
            "track",
            total as usize,
            AudioFormat::default(),
        ));
        let engine = ProxyEngine::new(
            resolver.clone(),
            Arc::new(ResourceSizeCache::unbounded()),
        );

        for (start, len) in &starts {
            let start = *start as u64 % total;
            let header = match len {
                Some(len) => format!("bytes={}-{}", start, start + *len as u64),
                None => format!("bytes={}-", start),
            };

            let mut response = match engine
                .serve("track", EncodingConstraint::Any, Some(&header))
                .await
            {
                Ok(response) => response,
                Err(e) => return TestResult::error(format!("'{}' failed: {}", header, e)),
            };

            let mut served = 0u64;
            while let Some(chunk) = response.body.next().await {
                match chunk {
                    Ok(chunk) => served += chunk.len() as u64,
                    Err(e) => return TestResult::error(format!("Stream failed: {}", e)),
                }
            }
            if served != response.content_length() {
                return TestResult::error(format!(
                    "'{}' declared {} bytes, served {}",
                    header,
                    response.content_length(),
                    served
                ));
            }
            if engine
                .size_cache()
                .get(&SizeKey::new("track", EncodingConstraint::Any)) != Some(total) {
                return TestResult::error("Cached size changed".to_string());
            }
        }

        if engine.stats().size_discoveries != 1 {
            return TestResult::error(format!(
                "Size discovered {} times",
                engine.stats().size_discoveries
            ));
        }
        TestResult::passed()
    })
}

/// Spread IDs over encodings so one media ID can own several entries
fn key_for(id: u8) -> SizeKey {
    let encoding = match id % 3 {
        0 => EncodingConstraint::Any,
        1 => EncodingConstraint::Mp4Aac,
        _ => EncodingConstraint::WebmOpus,
    };
    SizeKey::new(format!("media-{}", id / 3), encoding)
}

#[quickcheck]
fn prop_bounded_cache_never_exceeds_limit(limit: u8, ids: Vec<u8>) -> TestResult {
    let limit = limit as usize % 16 + 1;
    let cache = ResourceSizeCache::new(Some(limit));

    for id in &ids {
        cache.put(&key_for(*id), *id as u64 + 1);
        if cache.len() > limit {
            return TestResult::error(format!("{} entries over limit {}", cache.len(), limit));
        }
    }

    // the most recent entry always survives
    if let Some(last) = ids.last() {
        if cache.get(&key_for(*last)) != Some(*last as u64 + 1) {
            return TestResult::failed();
        }
    }
    TestResult::passed()
}
