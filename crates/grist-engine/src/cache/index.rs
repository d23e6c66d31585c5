//! Cache index
//!
//! Maps indexable-metadata identity to cached blocks. Lookups are frequent
//! (every translation request); inserts are rare, so the index sits behind
//! a reader/writer lock. Insertion arbitrates duplicate translations: the
//! first equal-identity insert wins and later ones adopt the winner's
//! cache PC.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::meta::{BlockMeta, MetaMatch, MetaRef, MetaRegistry};

/// One published translation.
#[derive(Debug)]
pub struct IndexEntry {
    pub meta: MetaRef,
    pub cache_pc: u64,
    stale: AtomicBool,
}

/// Result of an index lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// A translation reusable as-is.
    Accept { cache_pc: u64, meta: MetaRef },
    /// A translation compatible after a register-remapping shim.
    Adapt { cache_pc: u64, meta: MetaRef },
    /// No usable translation.
    Miss,
}

/// The block-metadata → cache-PC index.
pub struct CacheIndex {
    buckets: RwLock<FxHashMap<u64, Vec<IndexEntry>>>,
}

impl CacheIndex {
    pub fn new() -> CacheIndex {
        CacheIndex { buckets: RwLock::new(FxHashMap::default()) }
    }

    /// Look up a usable translation for `meta`. Prefers `Accept` over
    /// `Adapt`; stale entries never match.
    pub fn lookup(&self, registry: &MetaRegistry, meta: &BlockMeta) -> Lookup {
        let buckets = self.buckets.read();
        let mut adapt: Option<(u64, MetaRef)> = None;
        if let Some(entries) = buckets.get(&meta.identity_hash()) {
            for entry in entries {
                if entry.stale.load(Ordering::Acquire) {
                    continue;
                }
                match registry.compare(meta, &entry.meta) {
                    MetaMatch::Accept => {
                        return Lookup::Accept { cache_pc: entry.cache_pc, meta: entry.meta.clone() };
                    }
                    MetaMatch::Adapt => {
                        adapt.get_or_insert((entry.cache_pc, entry.meta.clone()));
                    }
                    MetaMatch::Reject => {}
                }
            }
        }
        // Adaptable candidates can live under other hashes too (their
        // adaptable slots feed the hash); scan is bounded to the bucket,
        // so a cross-bucket adapt candidate is found only when its hash
        // collides. Missing one only costs a fresh translation.
        match adapt {
            Some((cache_pc, meta)) => Lookup::Adapt { cache_pc, meta },
            None => Lookup::Miss,
        }
    }

    /// Insert a freshly encoded translation. If an equal-identity entry
    /// was inserted concurrently, the existing entry wins and its cache PC
    /// is returned; the caller discards its own encoding and publishes the
    /// winner's PC instead.
    pub fn insert(&self, registry: &MetaRegistry, meta: MetaRef, cache_pc: u64) -> u64 {
        let mut buckets = self.buckets.write();
        let entries = buckets.entry(meta.identity_hash()).or_default();
        for entry in entries.iter() {
            if !entry.stale.load(Ordering::Acquire)
                && matches!(registry.compare(&meta, &entry.meta), MetaMatch::Accept)
            {
                return entry.cache_pc;
            }
        }
        entries.push(IndexEntry { meta, cache_pc, stale: AtomicBool::new(false) });
        cache_pc
    }

    /// Mark every entry whose source range overlaps `[start, start+len)`
    /// stale; returns `(app_pc, cache_pc)` for the affected entries so
    /// callers can re-patch predecessor edges.
    pub fn invalidate_range(&self, start: u64, len: u64) -> Vec<(u64, u64)> {
        let buckets = self.buckets.read();
        let mut hit = Vec::new();
        for entries in buckets.values() {
            for entry in entries {
                let pc = entry.meta.start_pc();
                if pc >= start && pc < start + len && !entry.stale.swap(true, Ordering::AcqRel) {
                    hit.push((pc, entry.cache_pc));
                }
            }
        }
        hit
    }

    /// Number of live (non-stale) entries.
    pub fn live_entries(&self) -> usize {
        self.buckets
            .read()
            .values()
            .flat_map(|entries| entries.iter())
            .filter(|entry| !entry.stale.load(Ordering::Acquire))
            .count()
    }
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self::new()
    }
}
