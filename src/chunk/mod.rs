//! Fixed-size chunk buffers and the allocators that hand them out.
//!
//! Buckets obtain a chunk the first time the write cursor enters that slot
//! of the ring and give every chunk back on reset or drop. Whether the
//! allocator recycles buffers is a pure performance choice.

pub mod pool;

#[cfg(not(target_os = "windows"))]
pub mod mmap;

use std::ops::{Deref, DerefMut};

use crate::ring::layout::CHUNK_SIZE;

pub use pool::PooledAllocator;

#[cfg(not(target_os = "windows"))]
pub use mmap::MmapAllocator;

enum Storage {
    Heap(Box<[u8]>),
    #[cfg(not(target_os = "windows"))]
    Mapped(memmap2::MmapMut),
}

/// A `CHUNK_SIZE` byte buffer.
pub struct Chunk {
    storage: Storage,
}

impl Chunk {
    /// Allocate a zeroed chunk on the heap.
    pub fn heap() -> Self {
        Chunk {
            storage: Storage::Heap(vec![0u8; CHUNK_SIZE].into_boxed_slice()),
        }
    }

    #[cfg(not(target_os = "windows"))]
    fn mapped(map: memmap2::MmapMut) -> Self {
        debug_assert_eq!(map.len(), CHUNK_SIZE);
        Chunk {
            storage: Storage::Mapped(map),
        }
    }

    /// True when backed by an anonymous memory map.
    pub fn is_mapped(&self) -> bool {
        match self.storage {
            Storage::Heap(_) => false,
            #[cfg(not(target_os = "windows"))]
            Storage::Mapped(_) => true,
        }
    }
}

impl Deref for Chunk {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        match &self.storage {
            Storage::Heap(buf) => &buf[..],
            #[cfg(not(target_os = "windows"))]
            Storage::Mapped(map) => &map[..],
        }
    }
}

impl DerefMut for Chunk {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Heap(buf) => &mut buf[..],
            #[cfg(not(target_os = "windows"))]
            Storage::Mapped(map) => &mut map[..],
        }
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Source of chunk buffers, shared by every bucket of a cache.
pub trait ChunkAllocator: Send + Sync {
    /// Hand out a buffer of exactly `CHUNK_SIZE` bytes. Contents are unspecified.
    fn get_chunk(&self) -> Chunk;

    /// Take back a buffer previously returned by `get_chunk`.
    fn put_chunk(&self, chunk: Chunk);
}

/// Allocates a fresh buffer every time and drops released ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl ChunkAllocator for HeapAllocator {
    fn get_chunk(&self) -> Chunk {
        Chunk::heap()
    }

    fn put_chunk(&self, chunk: Chunk) {
        drop(chunk);
    }
}
