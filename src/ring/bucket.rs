/// One shard of the cache: a ring of chunks plus a hash index into it.
///
/// Entries are appended at the write cursor. When an entry would cross a
/// chunk boundary the tail of the current chunk is abandoned and writing
/// continues in the next one; past the last chunk the cursor wraps to 0 and
/// the generation advances. Entering a chunk reclaims it: every index entry
/// still pointing into it is copied out for eviction before any byte of the
/// chunk is rewritten.
///
/// A `Bucket` is not synchronized; the cache wraps each one in a
/// read-write lock. Lookups only need `&self`, so a borrowed value can
/// coexist with other reads of the same bucket.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, warn};

use super::layout::{self, Location, CHUNK_SIZE};
use crate::chunk::{Chunk, ChunkAllocator};
use crate::error::{CacheError, Result};
use crate::evict::EvictionBatch;

/// Value position resolved by a lookup: chunk index and byte range in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ValueSlot {
    pub chunk: usize,
    pub start: usize,
    pub end: usize,
}

/// Counters maintained under the bucket lock.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct BucketStats {
    pub evictions: u64,
    pub corruptions: u64,
    pub wraps: u64,
}

pub(crate) struct Bucket {
    /// Ring of chunks; `None` until the cursor first writes there.
    chunks: Vec<Option<Chunk>>,
    /// Number of index entries pointing into each chunk.
    residents: Vec<u32>,
    /// hash(key) -> packed (generation, offset).
    index: HashMap<u64, Location>,
    /// Virtual write offset in `[0, chunks.len() * CHUNK_SIZE)`.
    cursor: u64,
    /// Current generation, never 0.
    gen: u64,
    allocator: Arc<dyn ChunkAllocator>,
    /// Copy evicted entries out (only when a callback is configured).
    collect: bool,
    pending: EvictionBatch,
    stats: BucketStats,
    /// Bumped from the read path, which only holds a shared borrow.
    corruptions: AtomicU64,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("chunks", &self.chunks.len())
            .field("entries", &self.index.len())
            .field("cursor", &self.cursor)
            .field("gen", &self.gen)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Bucket {
    /// Create a bucket able to hold `max_bytes`, rounded up to whole chunks.
    pub fn new(max_bytes: u64, allocator: Arc<dyn ChunkAllocator>, collect: bool) -> Result<Self> {
        if max_bytes == 0 {
            return Err(CacheError::InvalidArgument(
                "bucket max bytes cannot be zero".into(),
            ));
        }
        if max_bytes >= layout::MAX_BUCKET_SIZE {
            return Err(CacheError::InvalidArgument(format!(
                "too big bucket max bytes {max_bytes}; must be smaller than {}",
                layout::MAX_BUCKET_SIZE
            )));
        }
        let chunk_count = max_bytes.div_ceil(CHUNK_SIZE as u64) as usize;
        Ok(Bucket {
            chunks: (0..chunk_count).map(|_| None).collect(),
            residents: vec![0; chunk_count],
            index: HashMap::new(),
            cursor: 0,
            gen: 1,
            allocator,
            collect,
            pending: EvictionBatch::new(),
            stats: BucketStats::default(),
            corruptions: AtomicU64::new(0),
        })
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Chunks currently obtained from the allocator.
    pub fn allocated_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn stats(&self) -> BucketStats {
        BucketStats {
            corruptions: self.corruptions.load(Ordering::Relaxed),
            ..self.stats
        }
    }

    /// Take the entries evicted since the last call, if any.
    pub fn take_evicted(&mut self) -> Option<EvictionBatch> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    // --- Read path ---

    /// Resolve `key` to the position of its value.
    pub fn locate(&self, hash: u64, key: &[u8]) -> Result<ValueSlot> {
        let loc = match self.index.get(&hash) {
            Some(loc) => *loc,
            None => return Err(CacheError::NotFound),
        };
        if !loc.is_live(self.gen, self.cursor) {
            return Err(CacheError::NotFound);
        }
        let span = match decode_at(&self.chunks, loc) {
            Ok(span) => span,
            Err(e) => {
                self.corruptions.fetch_add(1, Ordering::Relaxed);
                warn!(chunk = loc.chunk(), offset = loc.chunk_offset(), "corrupted entry on read");
                return Err(e);
            }
        };
        if &chunk_at(&self.chunks, loc.chunk())[span.key] != key {
            // Hash collision with a different key
            return Err(CacheError::NotFound);
        }
        Ok(ValueSlot {
            chunk: loc.chunk(),
            start: span.value.start,
            end: span.value.end,
        })
    }

    /// Copy the value for `key` into `out`.
    pub fn get_into(&self, hash: u64, key: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let slot = self.locate(hash, key)?;
        out.extend_from_slice(self.value(slot));
        Ok(())
    }

    /// Borrow the bytes of a slot returned by [`Bucket::locate`].
    pub fn value(&self, slot: ValueSlot) -> &[u8] {
        match self.chunks.get(slot.chunk).and_then(|c| c.as_deref()) {
            Some(chunk) => &chunk[slot.start..slot.end],
            None => &[],
        }
    }

    /// Mutably borrow the bytes of a slot returned by [`Bucket::locate`].
    pub fn value_mut(&mut self, slot: ValueSlot) -> &mut [u8] {
        match self.chunks.get_mut(slot.chunk).and_then(|c| c.as_deref_mut()) {
            Some(chunk) => &mut chunk[slot.start..slot.end],
            None => &mut [],
        }
    }

    /// Snapshot every live entry.
    pub fn collect_live(&self, out: &mut EvictionBatch) {
        let mut corrupted = 0u64;
        for loc in self.index.values() {
            if !loc.is_live(self.gen, self.cursor) {
                continue;
            }
            match decode_at(&self.chunks, *loc) {
                Ok(span) => {
                    let chunk = chunk_at(&self.chunks, loc.chunk());
                    out.push(&chunk[span.key], &chunk[span.value]);
                }
                Err(_) => corrupted += 1,
            }
        }
        if corrupted > 0 {
            warn!(corrupted, "skipped corrupted entries while reading bucket");
            self.corruptions.fetch_add(corrupted, Ordering::Relaxed);
        }
    }

    // --- Write path ---

    pub fn set(&mut self, hash: u64, key: &[u8], value: &[u8]) -> Result<()> {
        let len = layout::entry_len(key, value)? as u64;

        let mut start = self.cursor;
        let mut end = start + len;
        let mut chunk_idx = (start / CHUNK_SIZE as u64) as usize;
        let next_idx = (end / CHUNK_SIZE as u64) as usize;
        if next_idx > chunk_idx {
            if next_idx >= self.chunks.len() {
                start = 0;
                chunk_idx = 0;
                self.gen = layout::next_gen(self.gen);
                self.stats.wraps += 1;
                debug!(gen = self.gen, "bucket cursor wrapped");
            } else {
                start = next_idx as u64 * CHUNK_SIZE as u64;
                chunk_idx = next_idx;
            }
            end = start + len;
            self.cursor = start;
            self.reclaim(chunk_idx, hash, key);
            if start == 0 {
                self.index.shrink_to(self.index.len());
            }
        }

        let allocator = &self.allocator;
        let chunk = self.chunks[chunk_idx].get_or_insert_with(|| allocator.get_chunk());
        let offset = (start % CHUNK_SIZE as u64) as usize;
        layout::write_entry(chunk, offset, key, value);

        let loc = Location::new(self.gen, start);
        if let Some(old) = self.index.insert(hash, loc) {
            self.release_resident(old);
        }
        self.residents[chunk_idx] += 1;
        self.cursor = end;
        Ok(())
    }

    /// Read-modify-write of `key` under the caller's lock.
    ///
    /// The mutator edits a scratch copy of the stored value, or an empty
    /// slice. `Ok(Some(v))` stores `v`; `Ok(None)` copies the edited bytes
    /// back in place; `Err` discards the copy, leaving the entry untouched.
    pub fn update<F, E>(&mut self, hash: u64, key: &[u8], mutator: F) -> std::result::Result<bool, E>
    where
        F: FnOnce(&mut [u8]) -> std::result::Result<Option<Vec<u8>>, E>,
        E: From<CacheError>,
    {
        let slot = match self.locate(hash, key) {
            Ok(slot) => Some(slot),
            Err(CacheError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        let mut scratch = match slot {
            Some(slot) => self.value(slot).to_vec(),
            None => Vec::new(),
        };
        match mutator(&mut scratch[..])? {
            Some(value) => {
                self.set(hash, key, &value)?;
                Ok(true)
            }
            None => {
                if let Some(slot) = slot {
                    self.value_mut(slot).copy_from_slice(&scratch);
                }
                Ok(false)
            }
        }
    }

    /// Drop the index entry for `hash`. Chunk bytes are left untouched.
    pub fn del(&mut self, hash: u64) -> Result<()> {
        match self.index.remove(&hash) {
            Some(old) => {
                self.release_resident(old);
                Ok(())
            }
            None => Err(CacheError::NotFound),
        }
    }

    /// Return to the empty state, collecting live entries if configured.
    pub fn reset(&mut self) {
        if self.collect && !self.index.is_empty() {
            let mut batch = EvictionBatch::with_capacity(self.index.len());
            self.collect_live(&mut batch);
            self.stats.evictions += batch.len() as u64;
            self.pending.append(&mut batch);
        }
        for slot in self.chunks.iter_mut() {
            if let Some(chunk) = slot.take() {
                self.allocator.put_chunk(chunk);
            }
        }
        self.residents.iter_mut().for_each(|n| *n = 0);
        self.index = HashMap::new();
        self.cursor = 0;
        self.gen = 1;
    }

    // --- Cleanup ---

    /// Evict every entry stored in `chunk_idx` before the cursor rewrites it.
    ///
    /// Runs with the cursor and generation already moved into the chunk, so
    /// the same pass also drops any entry that is no longer live. An entry
    /// under `replacing` that stores `key` is superseded by the write in
    /// progress and is not evicted.
    fn reclaim(&mut self, chunk_idx: usize, replacing: u64, key: &[u8]) {
        let wrapped = chunk_idx == 0;
        if self.residents[chunk_idx] == 0 && !wrapped {
            return;
        }

        let gen = self.gen;
        let cursor = self.cursor;
        let collect = self.collect;
        let chunks = &self.chunks;
        let residents = &mut self.residents;
        let pending = &mut self.pending;
        let mut evicted = 0u64;
        let mut corrupted = 0u64;
        let mut dropped = 0u64;

        self.index.retain(|&hash, loc| {
            let in_chunk = loc.chunk() == chunk_idx;
            if !in_chunk && loc.is_live(gen, cursor) {
                return true;
            }
            if let Some(n) = residents.get_mut(loc.chunk()) {
                *n = n.saturating_sub(1);
            }
            if !in_chunk {
                dropped += 1;
                return false;
            }
            match decode_at(chunks, *loc) {
                Ok(span) => {
                    let chunk = chunk_at(chunks, chunk_idx);
                    if hash == replacing && &chunk[span.key.clone()] == key {
                        return false;
                    }
                    evicted += 1;
                    if collect {
                        pending.push(&chunk[span.key], &chunk[span.value]);
                    }
                }
                Err(_) => corrupted += 1,
            }
            false
        });

        self.stats.evictions += evicted;
        if corrupted > 0 {
            self.corruptions.fetch_add(corrupted, Ordering::Relaxed);
            warn!(chunk = chunk_idx, corrupted, "dropped corrupted entries during cleanup");
        }
        if evicted > 0 || dropped > 0 {
            debug!(chunk = chunk_idx, gen, evicted, dropped, "reclaimed chunk");
        }
    }

    fn release_resident(&mut self, loc: Location) {
        if let Some(n) = self.residents.get_mut(loc.chunk()) {
            *n = n.saturating_sub(1);
        }
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        for slot in self.chunks.iter_mut() {
            if let Some(chunk) = slot.take() {
                self.allocator.put_chunk(chunk);
            }
        }
    }
}

/// Bytes of chunk `idx`, empty when it was never allocated.
fn chunk_at(chunks: &[Option<Chunk>], idx: usize) -> &[u8] {
    chunks.get(idx).and_then(|c| c.as_deref()).unwrap_or(&[])
}

/// Bounds-check the entry at `loc`, ignoring generation rules.
fn decode_at(chunks: &[Option<Chunk>], loc: Location) -> Result<layout::EntrySpan> {
    layout::decode_entry(chunk_at(chunks, loc.chunk()), loc.chunk_offset()).ok_or(
        CacheError::CorruptedData {
            chunk: loc.chunk(),
            offset: loc.chunk_offset(),
        },
    )
}
