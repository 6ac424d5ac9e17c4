use std::fmt;
use std::hash::BuildHasher;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use tracing::{debug, error};

use crate::chunk::{ChunkAllocator, PooledAllocator};
use crate::error::{CacheError, Result};
use crate::evict::{Dispatcher, EvictionBatch, OnEvict};
use crate::ring::layout::CHUNK_SIZE;
use crate::ring::Bucket;

/// Number of independently locked shards.
pub const BUCKETS: usize = 512;

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheInfo {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    /// Entries pushed out by wraparound or reset.
    pub evictions: u64,
    pub corruptions: u64,
    /// Generation advances summed over all buckets.
    pub wraps: u64,
    pub entries: usize,
    /// Chunk memory currently held.
    pub allocated_bytes: usize,
    /// Hard ceiling on chunk memory.
    pub max_bytes: usize,
}

impl fmt::Display for CacheInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheInfo(hits={}, misses={}, sets={}, deletes={}, evictions={}, entries={}, allocated_bytes={}, max_bytes={})",
            self.hits,
            self.misses,
            self.sets,
            self.deletes,
            self.evictions,
            self.entries,
            self.allocated_bytes,
            self.max_bytes
        )
    }
}

/// Borrowed view of a stored value.
///
/// Holds a shared lock on the owning bucket: reads of any key stay
/// available, but no write to that bucket can happen while it is alive.
/// Drop it before calling `set`, `update`, `del` or `reset` from the same
/// thread.
pub struct ValueRef<'a> {
    guard: MappedRwLockReadGuard<'a, [u8]>,
}

impl Deref for ValueRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl AsRef<[u8]> for ValueRef<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.guard
    }
}

impl fmt::Debug for ValueRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ValueRef").field(&&*self.guard).finish()
    }
}

/// Thread-safe, fixed-size byte cache for a large number of small entries.
///
/// Keys are hashed to one of [`BUCKETS`] shards. Each shard is a ring of
/// 64 KiB chunks; once full, new writes overwrite the oldest chunk, so
/// retention is approximately most-recently-written rather than strict LRU.
pub struct Cache<S = ahash::RandomState> {
    buckets: Box<[RwLock<Bucket>]>,
    hasher: S,
    dispatcher: Option<Dispatcher>,
    max_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

impl Cache<ahash::RandomState> {
    /// Create a cache holding at most `max_bytes` (rounded up to whole
    /// chunks per bucket), with an optional eviction callback.
    pub fn new(max_bytes: usize, on_evict: Option<OnEvict>) -> Result<Self> {
        let chunks = chunks_per_bucket(max_bytes)?;
        let allocator = Arc::new(PooledAllocator::new(chunks * BUCKETS));
        Self::with_parts(max_bytes, on_evict, allocator, ahash::RandomState::new())
    }
}

impl<S: BuildHasher> Cache<S> {
    pub(crate) fn with_parts(
        max_bytes: usize,
        on_evict: Option<OnEvict>,
        allocator: Arc<dyn ChunkAllocator>,
        hasher: S,
    ) -> Result<Self> {
        let per_bucket = bucket_bytes(max_bytes)?;
        let collect = on_evict.is_some();
        let buckets = (0..BUCKETS)
            .map(|_| Bucket::new(per_bucket, allocator.clone(), collect).map(RwLock::new))
            .collect::<Result<Vec<_>>>()?
            .into_boxed_slice();
        let dispatcher = match on_evict {
            Some(cb) => Some(Dispatcher::spawn(cb).map_err(|e| {
                error!(error = %e, "failed to spawn eviction dispatcher");
                CacheError::Dispatcher(e)
            })?),
            None => None,
        };
        let cache = Cache {
            buckets,
            hasher,
            dispatcher,
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        };
        debug!(
            max_bytes,
            capacity = cache.capacity_bytes(),
            buckets = BUCKETS,
            "cache created"
        );
        Ok(cache)
    }

    #[inline]
    fn route(&self, key: &[u8]) -> (u64, &RwLock<Bucket>) {
        let hash = self.hasher.hash_one(key);
        (hash, &self.buckets[(hash % BUCKETS as u64) as usize])
    }

    /// Run `f` on the bucket owning `hash`, then dispatch whatever it
    /// evicted once the lock is released.
    fn with_bucket<R>(&self, bucket: &RwLock<Bucket>, f: impl FnOnce(&mut Bucket) -> R) -> R {
        let mut guard = bucket.write();
        let out = f(&mut guard);
        let evicted = guard.take_evicted();
        drop(guard);
        if let Some(batch) = evicted {
            self.dispatch(batch);
        }
        out
    }

    fn dispatch(&self, batch: EvictionBatch) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch(batch);
        }
    }

    fn record_lookup<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.misses.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Return a copy of the value stored for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.get_into(key, &mut out)?;
        Ok(out)
    }

    /// Append the value stored for `key` to `out`.
    pub fn get_into(&self, key: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let (hash, bucket) = self.route(key);
        let result = bucket.read_recursive().get_into(hash, key, out);
        self.record_lookup(&result);
        result
    }

    /// Borrow the value stored for `key` without copying it.
    ///
    /// The returned guard holds a shared lock on the key's bucket until
    /// dropped; mutations of that bucket wait for it.
    pub fn get_ref(&self, key: &[u8]) -> Result<ValueRef<'_>> {
        let (hash, bucket) = self.route(key);
        let guard = bucket.read_recursive();
        let slot = guard.locate(hash, key);
        self.record_lookup(&slot);
        let slot = slot?;
        Ok(ValueRef {
            guard: RwLockReadGuard::map(guard, |b| b.value(slot)),
        })
    }

    /// True if `key` is currently retrievable.
    pub fn contains(&self, key: &[u8]) -> bool {
        let (hash, bucket) = self.route(key);
        let found = bucket.read_recursive().locate(hash, key).is_ok();
        found
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let (hash, bucket) = self.route(key);
        self.with_bucket(bucket, |b| b.set(hash, key, value))?;
        self.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Read-modify-write `key` atomically with respect to its bucket.
    ///
    /// `mutator` receives a copy of the stored value to edit in place, or an
    /// empty slice when the key is absent. Returning `Ok(Some(v))` stores
    /// `v`; `Ok(None)` commits the in-place edits without moving the entry;
    /// an error is returned as-is and the entry is left untouched.
    ///
    /// The mutator runs under the bucket lock: it must not block or call
    /// back into this cache.
    pub fn update<F, E>(&self, key: &[u8], mutator: F) -> std::result::Result<(), E>
    where
        F: FnOnce(&mut [u8]) -> std::result::Result<Option<Vec<u8>>, E>,
        E: From<CacheError>,
    {
        let (hash, bucket) = self.route(key);
        let wrote = self.with_bucket(bucket, |b| b.update(hash, key, mutator))?;
        if wrote {
            self.sets.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Forget `key`. The entry is never reported to the eviction callback.
    pub fn del(&self, key: &[u8]) -> Result<()> {
        let (hash, bucket) = self.route(key);
        bucket.write().del(hash)?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Empty every bucket and release all chunk memory.
    ///
    /// Buckets are drained one at a time, so concurrent readers may observe
    /// a partially reset cache. With a callback configured, everything
    /// drained is delivered as a single batch after this returns.
    pub fn reset(&self) {
        let mut drained = EvictionBatch::new();
        for bucket in self.buckets.iter() {
            let mut guard = bucket.write();
            guard.reset();
            if let Some(mut batch) = guard.take_evicted() {
                drained.append(&mut batch);
            }
        }
        debug!(entries = drained.len(), "cache reset");
        self.dispatch(drained);
    }

    /// Copy out every retrievable entry. Not a consistent snapshot across
    /// buckets.
    pub fn items(&self) -> EvictionBatch {
        let mut items = EvictionBatch::new();
        for bucket in self.buckets.iter() {
            bucket.read_recursive().collect_live(&mut items);
        }
        items
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read_recursive().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.read_recursive().len() == 0)
    }

    /// Bytes of chunk memory the cache may hold at most.
    pub fn capacity_bytes(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.read_recursive().chunk_count() * CHUNK_SIZE)
            .sum()
    }

    /// Budget the cache was created with.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn info(&self) -> CacheInfo {
        let mut info = CacheInfo {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            ..CacheInfo::default()
        };
        for bucket in self.buckets.iter() {
            let b = bucket.read_recursive();
            let stats = b.stats();
            info.evictions += stats.evictions;
            info.corruptions += stats.corruptions;
            info.wraps += stats.wraps;
            info.entries += b.len();
            info.allocated_bytes += b.allocated_chunks() * CHUNK_SIZE;
            info.max_bytes += b.chunk_count() * CHUNK_SIZE;
        }
        info
    }

    pub fn hasher(&self) -> &S {
        &self.hasher
    }
}

impl<S> fmt::Debug for Cache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("buckets", &self.buckets.len())
            .field("max_bytes", &self.max_bytes)
            .field("on_evict", &self.dispatcher.is_some())
            .finish()
    }
}

/// Per-bucket share of `max_bytes`, rounded up.
fn bucket_bytes(max_bytes: usize) -> Result<u64> {
    if max_bytes == 0 {
        return Err(CacheError::InvalidArgument(
            "max_bytes must be greater than 0; got 0".into(),
        ));
    }
    Ok(max_bytes.div_ceil(BUCKETS) as u64)
}

/// Chunks each bucket gets for a `max_bytes` budget.
pub(crate) fn chunks_per_bucket(max_bytes: usize) -> Result<usize> {
    Ok(bucket_bytes(max_bytes)?.div_ceil(CHUNK_SIZE as u64) as usize)
}
