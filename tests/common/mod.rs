#![allow(dead_code)]

use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ringcache::{Cache, CacheBuilder, Chunk, ChunkAllocator, EvictionBatch, BUCKETS, CHUNK_SIZE};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// FNV-1a with the low bits cleared, so every key routes to bucket 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct SameBucket;

pub struct ShiftedFnv(u64);

impl Hasher for ShiftedFnv {
    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= u64::from(*b);
            self.0 = self.0.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }

    fn finish(&self) -> u64 {
        self.0 << BUCKETS.trailing_zeros()
    }
}

impl BuildHasher for SameBucket {
    type Hasher = ShiftedFnv;

    fn build_hasher(&self) -> ShiftedFnv {
        ShiftedFnv(0xcbf2_9ce4_8422_2325)
    }
}

/// Heap allocator that tracks outstanding chunks and the peak.
#[derive(Debug, Default)]
pub struct CountingAllocator {
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl CountingAllocator {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl ChunkAllocator for CountingAllocator {
    fn get_chunk(&self) -> Chunk {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        Chunk::heap()
    }

    fn put_chunk(&self, chunk: Chunk) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        drop(chunk);
    }
}

/// Budget giving every bucket exactly `chunks` chunks.
pub fn budget(chunks: usize) -> usize {
    BUCKETS * CHUNK_SIZE * chunks
}

/// Single-bucket cache that forwards eviction batches to a channel.
pub fn same_bucket_cache(
    chunks: usize,
) -> (Cache<SameBucket>, crossbeam_channel::Receiver<EvictionBatch>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let cache = CacheBuilder::new(budget(chunks))
        .hasher(SameBucket)
        .on_evict(move |batch| {
            let _ = tx.send(batch);
        })
        .build()
        .unwrap();
    (cache, rx)
}

pub fn counting_cache(chunks: usize) -> (Cache<SameBucket>, Arc<CountingAllocator>) {
    let alloc = Arc::new(CountingAllocator::default());
    let cache = CacheBuilder::new(budget(chunks))
        .chunk_allocator(alloc.clone())
        .hasher(SameBucket)
        .build()
        .unwrap();
    (cache, alloc)
}

pub fn key(i: usize) -> Vec<u8> {
    format!("key{i:05}").into_bytes()
}

/// Value whose bytes are derived from `key`, so a read can be verified.
pub fn value_for(key: &[u8], len: usize) -> Vec<u8> {
    key.iter().copied().cycle().take(len).collect()
}
