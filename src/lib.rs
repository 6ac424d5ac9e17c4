//! Sharded, fixed-size, in-memory byte cache.
//!
//! Keys and values are arbitrary byte strings. The cache is split into 512
//! buckets, each a ring of 64 KiB chunks behind its own read-write lock; when a ring is
//! full, new writes overwrite the oldest chunk. An optional callback
//! receives overwritten entries on a background thread.
//!
//! ```
//! use ringcache::Cache;
//!
//! let cache = Cache::new(32 << 20, None).unwrap();
//! cache.set(b"hello", b"world").unwrap();
//! assert_eq!(cache.get(b"hello").unwrap(), b"world");
//! ```

pub mod chunk;
mod config;
mod error;
mod evict;
pub mod ring;
mod store;

pub use chunk::{Chunk, ChunkAllocator, HeapAllocator, PooledAllocator};
#[cfg(not(target_os = "windows"))]
pub use chunk::MmapAllocator;
pub use config::{AllocatorKind, CacheBuilder, CacheConfig};
pub use error::{CacheError, Result};
pub use evict::{EvictionBatch, OnEvict};
pub use ring::layout::{CHUNK_SIZE, MAX_KEY_LEN, MAX_VALUE_LEN};
pub use store::{Cache, CacheInfo, ValueRef, BUCKETS};
