//! Cache construction: a serializable [`CacheConfig`] and the
//! programmatic [`CacheBuilder`].

use std::fmt;
use std::hash::BuildHasher;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkAllocator, HeapAllocator, PooledAllocator};
use crate::error::Result;
use crate::evict::{EvictionBatch, OnEvict};
use crate::store::{chunks_per_bucket, Cache, BUCKETS};

/// Where chunk memory comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorKind {
    /// Fresh heap buffer per chunk, freed on release.
    Heap,
    /// Heap buffers recycled through a free list.
    #[default]
    Pooled,
    /// Anonymous memory maps, recycled. Falls back to `Pooled` on Windows.
    Mmap,
}

impl AllocatorKind {
    fn build(self, max_bytes: usize) -> Result<Arc<dyn ChunkAllocator>> {
        Ok(match self {
            AllocatorKind::Heap => Arc::new(HeapAllocator),
            #[cfg(not(target_os = "windows"))]
            AllocatorKind::Mmap => Arc::new(crate::chunk::MmapAllocator::new()),
            #[cfg(target_os = "windows")]
            AllocatorKind::Mmap => {
                Arc::new(PooledAllocator::new(chunks_per_bucket(max_bytes)? * BUCKETS))
            }
            AllocatorKind::Pooled => {
                Arc::new(PooledAllocator::new(chunks_per_bucket(max_bytes)? * BUCKETS))
            }
        })
    }
}

/// Declarative cache settings, loadable from any serde format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    pub max_bytes: usize,
    #[serde(default)]
    pub allocator: AllocatorKind,
}

impl CacheConfig {
    pub fn new(max_bytes: usize) -> Self {
        CacheConfig {
            max_bytes,
            allocator: AllocatorKind::default(),
        }
    }
}

impl Cache<ahash::RandomState> {
    /// Build a cache from `config`.
    pub fn from_config(config: &CacheConfig, on_evict: Option<OnEvict>) -> Result<Self> {
        let mut builder = CacheBuilder::new(config.max_bytes).allocator(config.allocator);
        builder.on_evict = on_evict;
        builder.build()
    }
}

/// Step-by-step cache construction.
///
/// ```
/// use ringcache::{AllocatorKind, CacheBuilder};
///
/// let cache = CacheBuilder::new(32 << 20)
///     .allocator(AllocatorKind::Heap)
///     .on_evict(|batch| println!("evicted {} entries", batch.len()))
///     .build()
///     .unwrap();
/// cache.set(b"k", b"v").unwrap();
/// ```
pub struct CacheBuilder<S = ahash::RandomState> {
    max_bytes: usize,
    allocator: AllocatorKind,
    custom_allocator: Option<Arc<dyn ChunkAllocator>>,
    on_evict: Option<OnEvict>,
    hasher: S,
}

impl CacheBuilder<ahash::RandomState> {
    pub fn new(max_bytes: usize) -> Self {
        CacheBuilder {
            max_bytes,
            allocator: AllocatorKind::default(),
            custom_allocator: None,
            on_evict: None,
            hasher: ahash::RandomState::new(),
        }
    }
}

impl<S: BuildHasher> CacheBuilder<S> {
    pub fn allocator(mut self, kind: AllocatorKind) -> Self {
        self.allocator = kind;
        self.custom_allocator = None;
        self
    }

    /// Use a caller-provided allocator, shared by every bucket.
    pub fn chunk_allocator(mut self, allocator: Arc<dyn ChunkAllocator>) -> Self {
        self.custom_allocator = Some(allocator);
        self
    }

    /// Receive evicted entries on a background thread.
    pub fn on_evict<F>(mut self, callback: F) -> Self
    where
        F: Fn(EvictionBatch) + Send + Sync + 'static,
    {
        self.on_evict = Some(Arc::new(callback));
        self
    }

    /// Replace the key hasher. Routing and indexing both use it.
    pub fn hasher<H: BuildHasher>(self, hasher: H) -> CacheBuilder<H> {
        CacheBuilder {
            max_bytes: self.max_bytes,
            allocator: self.allocator,
            custom_allocator: self.custom_allocator,
            on_evict: self.on_evict,
            hasher,
        }
    }

    pub fn build(self) -> Result<Cache<S>> {
        let allocator = match self.custom_allocator {
            Some(a) => a,
            None => self.allocator.build(self.max_bytes)?,
        };
        Cache::with_parts(self.max_bytes, self.on_evict, allocator, self.hasher)
    }
}

impl<S> fmt::Debug for CacheBuilder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheBuilder")
            .field("max_bytes", &self.max_bytes)
            .field("allocator", &self.allocator)
            .field("custom_allocator", &self.custom_allocator.is_some())
            .field("on_evict", &self.on_evict.is_some())
            .finish()
    }
}
