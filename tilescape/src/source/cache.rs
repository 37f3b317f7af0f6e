//! Reference-counted cache of decoded tile payloads.
//!
//! Unlike a recency cache, entries here are pinned by use: every displayed
//! TileNode holds one usage reference on its entry, and every view holding
//! a layer over the source holds one reference on the entry's CRS. An
//! entry becomes evictable when its usage count reaches zero, and is
//! dropped for good when the last view referencing its CRS goes away.
//!
//! All count mutation happens on the coordinating thread during layer
//! add/remove and frame updates, which keeps the accounting free of
//! ordering races; the map itself is concurrent so worker threads may read
//! payloads.

use dashmap::DashMap;
use tracing::{debug, warn};

use super::{SourceKey, TilePayload};
use crate::coord::Crs;

struct CacheEntry {
    payload: TilePayload,
    usage: usize,
}

/// Shared cache of decoded payloads for one source.
#[derive(Default)]
pub struct DecodeCache {
    entries: DashMap<SourceKey, CacheEntry>,
    crs_refs: DashMap<Crs, usize>,
}

impl DecodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a freshly decoded payload and takes the first usage
    /// reference for the requesting tile.
    ///
    /// If the key is already present (a racing view displayed it first),
    /// the existing payload wins and its usage count grows instead.
    pub fn insert_and_acquire(&self, key: SourceKey, payload: TilePayload) -> TilePayload {
        let mut entry = self.entries.entry(key).or_insert_with(|| CacheEntry {
            payload,
            usage: 0,
        });
        entry.usage += 1;
        entry.payload.clone()
    }

    /// Takes a usage reference on an existing entry, returning its
    /// payload. `None` on a cache miss.
    pub fn acquire(&self, key: &SourceKey) -> Option<TilePayload> {
        self.entries.get_mut(key).map(|mut entry| {
            entry.usage += 1;
            entry.payload.clone()
        })
    }

    /// Releases one usage reference. The entry stays cached for re-use
    /// until its CRS is released by every view.
    pub fn release(&self, key: &SourceKey) {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.usage == 0 {
                    warn!(%key, "Cache release without matching acquire");
                } else {
                    entry.usage -= 1;
                }
            }
            None => warn!(%key, "Cache release for unknown key"),
        }
    }

    /// Records that a view needs payloads in this CRS.
    pub fn retain_crs(&self, crs: &Crs) {
        *self.crs_refs.entry(crs.clone()).or_insert(0) += 1;
    }

    /// Releases one view's interest in a CRS.
    ///
    /// When the last reference goes, every entry in that CRS is dropped
    /// and `true` is returned so the caller can notify the source.
    pub fn release_crs(&self, crs: &Crs) -> bool {
        let freed = match self.crs_refs.get_mut(crs) {
            Some(mut count) => {
                if *count > 0 {
                    *count -= 1;
                }
                *count == 0
            }
            None => {
                warn!(%crs, "CRS release without matching retain");
                return false;
            }
        };
        if freed {
            self.crs_refs.remove(crs);
            let before = self.entries.len();
            self.entries.retain(|key, entry| {
                if key.crs() != crs {
                    return true;
                }
                if entry.usage > 0 {
                    warn!(%key, usage = entry.usage, "Dropping CRS entry still in use");
                }
                false
            });
            debug!(%crs, evicted = before - self.entries.len(), "Freed CRS cache entries");
        }
        freed
    }

    /// Number of views currently referencing a CRS.
    pub fn crs_ref_count(&self, crs: &Crs) -> usize {
        self.crs_refs.get(crs).map(|c| *c).unwrap_or(0)
    }

    /// Current usage count for an entry, if cached.
    pub fn usage(&self, key: &SourceKey) -> Option<usize> {
        self.entries.get(key).map(|entry| entry.usage)
    }

    pub fn contains(&self, key: &SourceKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops zero-usage entries until at most `max_entries` remain.
    ///
    /// Returns the number of entries evicted. Used under cache pressure;
    /// pinned entries are never touched.
    pub fn evict_unused(&self, max_entries: usize) -> usize {
        let excess = self.entries.len().saturating_sub(max_entries);
        if excess == 0 {
            return 0;
        }
        let mut evicted = 0;
        self.entries.retain(|_, entry| {
            if evicted < excess && entry.usage == 0 {
                evicted += 1;
                false
            } else {
                true
            }
        });
        evicted
    }
}
