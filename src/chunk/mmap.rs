/// Chunk allocator backed by anonymous memory maps.
///
/// Chunk memory lives outside the process heap, so ring churn does not
/// fragment the allocator. Mappings are created once and recycled through
/// a free list; they are only unmapped when the allocator is dropped.
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::warn;

use super::{Chunk, ChunkAllocator};
use crate::ring::layout::CHUNK_SIZE;

#[derive(Default)]
pub struct MmapAllocator {
    idle: Mutex<Vec<Chunk>>,
    mapped: AtomicU64,
}

impl MmapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mappings created so far.
    pub fn mapped(&self) -> u64 {
        self.mapped.load(Ordering::Relaxed)
    }

    /// Chunks currently parked in the free list.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

impl ChunkAllocator for MmapAllocator {
    fn get_chunk(&self) -> Chunk {
        if let Some(chunk) = self.idle.lock().pop() {
            return chunk;
        }
        match MmapMut::map_anon(CHUNK_SIZE) {
            Ok(map) => {
                self.mapped.fetch_add(1, Ordering::Relaxed);
                Chunk::mapped(map)
            }
            Err(e) => {
                // Still hand out a usable buffer; only the placement differs.
                warn!(error = %e, "anonymous mmap failed, falling back to heap chunk");
                Chunk::heap()
            }
        }
    }

    fn put_chunk(&self, chunk: Chunk) {
        if chunk.is_mapped() {
            self.idle.lock().push(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_once_and_recycles() {
        let alloc = MmapAllocator::new();
        let mut chunk = alloc.get_chunk();
        assert_eq!(chunk.len(), CHUNK_SIZE);
        assert!(chunk.is_mapped());
        chunk[0] = 1;
        chunk[CHUNK_SIZE - 1] = 2;

        alloc.put_chunk(chunk);
        assert_eq!(alloc.idle(), 1);

        let again = alloc.get_chunk();
        assert_eq!(again[0], 1);
        assert_eq!(alloc.mapped(), 1);
        assert_eq!(alloc.idle(), 0);
    }

    #[test]
    fn heap_chunks_are_not_retained() {
        let alloc = MmapAllocator::new();
        alloc.put_chunk(Chunk::heap());
        assert_eq!(alloc.idle(), 0);
    }
}
