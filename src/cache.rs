//! Reader-side cache of unpacked path annotations
//!
//! Route queries repeatedly unpack the same contracted edges; this cache
//! memoizes the resulting annotations. Entries are keyed by the dataset
//! version on top of the edge itself, so after a publish bumps the
//! version, lookups shift to new keys and stale entries age out without
//! explicit invalidation.
//!
//! Lookups take the shared side of the lock and mark recency through an
//! atomic stamp; inserts take the exclusive side and evict with a
//! second-chance sweep, so parallel query threads only serialize on
//! insertion.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
};

/// Node identifier in the edge-based graph
pub type NodeId = u32;

/// Path duration in deciseconds
pub type EdgeDuration = i32;

/// Path distance in meters
pub type EdgeDistance = f64;

/// Sentinel duration returned on a cache miss
pub const MAXIMAL_EDGE_DURATION: EdgeDuration = EdgeDuration::MAX;

/// Sentinel distance returned on a cache miss
pub const MAXIMAL_EDGE_DISTANCE: EdgeDistance = EdgeDistance::MAX;

/// Default memory budget for the cache (500 MiB)
pub const DEFAULT_MEMORY_BUDGET: usize = 500 * 1024 * 1024;

/// Cache key: one unpacked edge under one exclude class and one dataset
/// version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeKey {
    pub source: NodeId,
    pub target: NodeId,
    pub exclude_class: u32,
    pub version: u64,
}

impl EdgeKey {
    pub fn new(source: NodeId, target: NodeId, exclude_class: u32, version: u64) -> Self {
        Self {
            source,
            target,
            exclude_class,
            version,
        }
    }
}

/// Duration and distance of one unpacked edge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathAnnotation {
    pub duration: EdgeDuration,
    pub distance: EdgeDistance,
}

impl PathAnnotation {
    /// The "not cached" sentinel
    pub fn maximal() -> Self {
        Self {
            duration: MAXIMAL_EDGE_DURATION,
            distance: MAXIMAL_EDGE_DISTANCE,
        }
    }
}

struct CacheEntry {
    annotation: PathAnnotation,
    /// Recency stamp, bumped on every hit. Atomic so hits only need the
    /// shared side of the lock.
    last_used: AtomicU64,
    /// Stamp when the key was (re-)enqueued for eviction
    enqueued_at: u64,
}

#[derive(Default)]
struct CacheInner {
    map: HashMap<EdgeKey, CacheEntry>,
    order: VecDeque<EdgeKey>,
    current_version: u64,
}

/// Thread-safe bounded cache of unpacked path annotations
pub struct UnpackingCache {
    inner: RwLock<CacheInner>,
    clock: AtomicU64,
    capacity: usize,
}

impl UnpackingCache {
    /// Cache sized from the default memory budget
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_MEMORY_BUDGET)
    }

    /// Cache sized so `budget` bytes cover keys, entries, and map
    /// overhead
    pub fn with_budget(budget: usize) -> Self {
        Self::with_capacity(budget / Self::entry_cost())
    }

    /// Cache bounded to an explicit number of entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            clock: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Approximate bytes one cached entry occupies
    pub fn entry_cost() -> usize {
        // Key stored twice (map and eviction queue) plus the hash table's
        // per-slot overhead
        2 * std::mem::size_of::<EdgeKey>()
            + std::mem::size_of::<CacheEntry>()
            + std::mem::size_of::<u64>()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an annotation for this edge is cached
    pub fn is_edge_cached(&self, key: EdgeKey) -> bool {
        self.inner.read().unwrap().map.contains_key(&key)
    }

    /// Annotation for this edge, or the maximal sentinel on a miss
    pub fn get_annotation(&self, key: EdgeKey) -> PathAnnotation {
        let inner = self.inner.read().unwrap();
        match inner.map.get(&key) {
            Some(entry) => {
                let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
                entry.last_used.store(stamp, Ordering::Relaxed);
                entry.annotation
            }
            None => PathAnnotation::maximal(),
        }
    }

    /// Duration for this edge, or [`MAXIMAL_EDGE_DURATION`] on a miss
    pub fn get_duration(&self, key: EdgeKey) -> EdgeDuration {
        self.get_annotation(key).duration
    }

    /// Insert an annotation, evicting the least recently used entry when
    /// the cache is full
    pub fn add_edge(&self, key: EdgeKey, annotation: PathAnnotation) {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write().unwrap();

        if let Some(entry) = inner.map.get_mut(&key) {
            entry.annotation = annotation;
            entry.last_used.store(stamp, Ordering::Relaxed);
            return;
        }

        if inner.map.len() >= self.capacity {
            Self::evict_one(&mut inner, stamp);
        }

        inner.map.insert(
            key,
            CacheEntry {
                annotation,
                last_used: AtomicU64::new(stamp),
                enqueued_at: stamp,
            },
        );
        inner.order.push_back(key);
    }

    /// Second-chance sweep: keys touched since they were enqueued get
    /// re-enqueued, the first untouched key is evicted
    fn evict_one(inner: &mut CacheInner, stamp: u64) {
        while let Some(key) = inner.order.pop_front() {
            let Some(entry) = inner.map.get_mut(&key) else {
                continue;
            };

            if entry.last_used.load(Ordering::Relaxed) > entry.enqueued_at {
                entry.enqueued_at = stamp;
                inner.order.push_back(key);
            } else {
                inner.map.remove(&key);
                return;
            }
        }
    }

    /// Drop every entry if the dataset version changed. Version-qualified
    /// keys already make stale entries unreachable; this reclaims their
    /// memory eagerly.
    pub fn clear(&self, new_version: u64) {
        let mut inner = self.inner.write().unwrap();
        if inner.current_version != new_version {
            inner.map.clear();
            inner.order.clear();
            inner.current_version = new_version;
        }
    }
}

impl Default for UnpackingCache {
    fn default() -> Self {
        Self::new()
    }
}
