//! Resource Size Cache Module
//!
//! Maps a media ID and encoding constraint to the last observed total byte
//! length of that upstream resource so repeat requests skip the
//! size-discovery probe. Each encoding of a media ID is a distinct resource.
//!
//! Entries live for the process lifetime unless a bound is configured, in which
//! case the oldest inserted entry is evicted first. Staleness is only detected
//! reactively: callers invalidate an entry when a fetch against it fails.

use crate::media_resolver::EncodingConstraint;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// One upstream resource: a media ID fetched under an encoding constraint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SizeKey {
    pub media_id: String,
    pub encoding: EncodingConstraint,
}

impl SizeKey {
    pub fn new(media_id: impl Into<String>, encoding: EncodingConstraint) -> Self {
        Self {
            media_id: media_id.into(),
            encoding,
        }
    }
}

impl fmt::Display for SizeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.media_id, self.encoding.as_param())
    }
}

/// Hit/miss counters for the size cache
#[derive(Debug, Default)]
pub struct SizeCacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub invalidations: AtomicU64,
}

/// Snapshot of size cache counters for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SizeCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

/// Process-wide (media ID, encoding) -> total length cache
pub struct ResourceSizeCache {
    sizes: DashMap<SizeKey, u64>,
    /// Insertion order, only tracked when bounded
    order: Mutex<VecDeque<SizeKey>>,
    max_entries: Option<usize>,
    metrics: SizeCacheMetrics,
}

impl Default for ResourceSizeCache {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl ResourceSizeCache {
    /// Create a cache; `max_entries` of `None` (or zero) means unbounded
    pub fn new(max_entries: Option<usize>) -> Self {
        Self {
            sizes: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_entries: max_entries.filter(|max| *max > 0),
            metrics: SizeCacheMetrics::default(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Last known total length for `key`
    pub fn get(&self, key: &SizeKey) -> Option<u64> {
        match self.sizes.get(key) {
            Some(size) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                Some(*size)
            }
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Record the total length for `key`, replacing any previous value
    pub fn put(&self, key: &SizeKey, total_bytes: u64) {
        let previous = self.sizes.insert(key.clone(), total_bytes);

        if previous.is_none() {
            if let Some(max_entries) = self.max_entries {
                self.track_and_evict(key, max_entries);
            }
        }

        debug!(
            resource = %key,
            total_bytes,
            replaced = ?previous,
            "Resource size cached"
        );
    }

    fn track_and_evict(&self, key: &SizeKey, max_entries: usize) {
        let mut order = match self.order.lock() {
            Ok(order) => order,
            Err(poisoned) => poisoned.into_inner(),
        };
        order.push_back(key.clone());

        while self.sizes.len() > max_entries {
            let Some(victim) = order.pop_front() else {
                break;
            };
            if self.sizes.remove(&victim).is_some() {
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(evicted = %victim, "Resource size cache evicted entry");
            }
        }
    }

    /// Drop the entry for `key` after a fetch against it failed
    pub fn invalidate(&self, key: &SizeKey) -> bool {
        let removed = self.sizes.remove(key).is_some();
        if removed {
            self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!(resource = %key, "Resource size cache entry invalidated");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn stats(&self) -> SizeCacheStats {
        SizeCacheStats {
            entries: self.sizes.len(),
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            invalidations: self.metrics.invalidations.load(Ordering::Relaxed),
        }
    }
}
