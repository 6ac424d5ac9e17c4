/// Free-list allocator that recycles released chunks.
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{Chunk, ChunkAllocator};

/// Keeps up to `max_idle` released chunks for reuse.
///
/// A cache that owns its pool never holds more chunks than its ring
/// capacity, so sizing `max_idle` to that capacity bounds total memory.
pub struct PooledAllocator {
    idle: Mutex<Vec<Chunk>>,
    max_idle: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl PooledAllocator {
    pub fn new(max_idle: usize) -> Self {
        PooledAllocator {
            idle: Mutex::new(Vec::new()),
            max_idle,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Chunks currently parked in the free list.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Chunks allocated because the free list was empty.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Chunks served from the free list.
    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }
}

impl ChunkAllocator for PooledAllocator {
    fn get_chunk(&self) -> Chunk {
        if let Some(chunk) = self.idle.lock().pop() {
            self.reused.fetch_add(1, Ordering::Relaxed);
            return chunk;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Chunk::heap()
    }

    fn put_chunk(&self, chunk: Chunk) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(chunk);
        }
    }
}
