/// Byte layout of a bucket's ring buffer.
///
/// A bucket owns `n` chunks of `CHUNK_SIZE` bytes each, addressed by a single
/// virtual offset in `[0, n * CHUNK_SIZE)`. Every entry is stored as
///
///   [key_len: u16 BE][value_len: u16 BE][key bytes][value bytes]
///
/// and never crosses a chunk boundary.
use std::ops::Range;

use crate::error::{CacheError, Result};

/// Size of one ring-buffer chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// `[key_len: u16][value_len: u16]`
pub const ENTRY_HEADER_SIZE: usize = 4;

/// Exclusive upper bound on key length (must fit the u16 header field).
pub const MAX_KEY_LEN: usize = 1 << 16;

/// Exclusive upper bound on value length.
pub const MAX_VALUE_LEN: usize = 1 << 16;

/// Bits of a packed location used for the virtual offset.
pub const BUCKET_SIZE_BITS: u32 = 40;

/// Bits of a packed location used for the generation.
pub const GEN_SIZE_BITS: u32 = 64 - BUCKET_SIZE_BITS;

/// Largest generation before it wraps back to 1.
pub const MAX_GEN: u64 = (1 << GEN_SIZE_BITS) - 1;

/// Exclusive upper bound on the bytes one bucket can address.
pub const MAX_BUCKET_SIZE: u64 = 1 << BUCKET_SIZE_BITS;

const OFFSET_MASK: u64 = MAX_BUCKET_SIZE - 1;

const _: () = assert!(CHUNK_SIZE.is_power_of_two());
const _: () = assert!((CHUNK_SIZE as u64) < MAX_BUCKET_SIZE);
const _: () = assert!(MAX_KEY_LEN - 1 <= u16::MAX as usize);
const _: () = assert!(MAX_VALUE_LEN - 1 <= u16::MAX as usize);

/// Validate sizes and return the encoded length of a `(key, value)` entry.
pub fn entry_len(key: &[u8], value: &[u8]) -> Result<usize> {
    if key.len() >= MAX_KEY_LEN {
        return Err(CacheError::KeyTooLarge { len: key.len() });
    }
    if value.len() >= MAX_VALUE_LEN {
        return Err(CacheError::ValueTooLarge { len: value.len() });
    }
    let len = ENTRY_HEADER_SIZE + key.len() + value.len();
    if len >= CHUNK_SIZE {
        return Err(CacheError::EntryExceedsChunk { len });
    }
    Ok(len)
}

/// Write an entry at `offset` inside `chunk`.
///
/// Caller must have validated the sizes with [`entry_len`] and ensured the
/// entry ends before the chunk does.
pub fn write_entry(chunk: &mut [u8], offset: usize, key: &[u8], value: &[u8]) {
    let key_start = offset + ENTRY_HEADER_SIZE;
    let value_start = key_start + key.len();
    chunk[offset..offset + 2].copy_from_slice(&(key.len() as u16).to_be_bytes());
    chunk[offset + 2..key_start].copy_from_slice(&(value.len() as u16).to_be_bytes());
    chunk[key_start..value_start].copy_from_slice(key);
    chunk[value_start..value_start + value.len()].copy_from_slice(value);
}

/// Byte ranges (relative to the chunk) of a decoded entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySpan {
    pub key: Range<usize>,
    pub value: Range<usize>,
}

/// Decode the entry header at `offset` and bounds-check it against the chunk.
///
/// Returns `None` when the header cannot describe a stored entry.
pub fn decode_entry(chunk: &[u8], offset: usize) -> Option<EntrySpan> {
    if offset + ENTRY_HEADER_SIZE >= CHUNK_SIZE || chunk.len() < CHUNK_SIZE {
        return None;
    }
    let key_len = u16::from_be_bytes([chunk[offset], chunk[offset + 1]]) as usize;
    let value_len = u16::from_be_bytes([chunk[offset + 2], chunk[offset + 3]]) as usize;
    let key_start = offset + ENTRY_HEADER_SIZE;
    if key_start + key_len + value_len >= CHUNK_SIZE {
        return None;
    }
    let value_start = key_start + key_len;
    Some(EntrySpan {
        key: key_start..value_start,
        value: value_start..value_start + value_len,
    })
}

/// Packed `(generation, virtual offset)` of an entry, as kept in the index.
///
/// A zero value never names a stored entry because generations start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location(u64);

impl Location {
    #[inline]
    pub fn new(gen: u64, offset: u64) -> Self {
        debug_assert!(gen != 0 && gen <= MAX_GEN);
        debug_assert!(offset < MAX_BUCKET_SIZE);
        Location((gen << BUCKET_SIZE_BITS) | (offset & OFFSET_MASK))
    }

    #[inline]
    pub fn gen(self) -> u64 {
        self.0 >> BUCKET_SIZE_BITS
    }

    #[inline]
    pub fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    /// Index of the chunk holding the entry.
    #[inline]
    pub fn chunk(self) -> usize {
        (self.offset() / CHUNK_SIZE as u64) as usize
    }

    /// Offset of the entry inside its chunk.
    #[inline]
    pub fn chunk_offset(self) -> usize {
        (self.offset() % CHUNK_SIZE as u64) as usize
    }

    /// Whether the bytes behind this location are still intact given the
    /// bucket's current generation and write cursor.
    ///
    /// Valid when written this generation before the cursor, or written in
    /// the previous generation at or after the cursor (including the
    /// `MAX_GEN -> 1` rollover).
    #[inline]
    pub fn is_live(self, bucket_gen: u64, cursor: u64) -> bool {
        let gen = self.gen();
        let offset = self.offset();
        (gen == bucket_gen && offset < cursor)
            || (gen + 1 == bucket_gen && offset >= cursor)
            || (gen == MAX_GEN && bucket_gen == 1 && offset >= cursor)
    }
}

/// Advance a generation counter, skipping the reserved zero.
#[inline]
pub fn next_gen(gen: u64) -> u64 {
    if gen >= MAX_GEN {
        1
    } else {
        gen + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn entry_len_limits() {
        assert_eq!(entry_len(b"key", b"value").unwrap(), 12);
        assert_eq!(entry_len(b"", b"").unwrap(), ENTRY_HEADER_SIZE);

        let big = vec![0u8; MAX_KEY_LEN];
        assert_matches!(entry_len(&big, b""), Err(CacheError::KeyTooLarge { len }) if len == MAX_KEY_LEN);
        assert_matches!(entry_len(b"", &big), Err(CacheError::ValueTooLarge { .. }));

        // Both fit u16 but together overflow the chunk
        let half = vec![0u8; CHUNK_SIZE / 2];
        assert_matches!(
            entry_len(&half, &half),
            Err(CacheError::EntryExceedsChunk { len }) if len == CHUNK_SIZE + ENTRY_HEADER_SIZE
        );

        // Exactly one byte short of a chunk is the largest storable entry
        let key = vec![0u8; 100];
        let value = vec![0u8; CHUNK_SIZE - ENTRY_HEADER_SIZE - 100 - 1];
        assert_eq!(entry_len(&key, &value).unwrap(), CHUNK_SIZE - 1);
        let value = vec![0u8; CHUNK_SIZE - ENTRY_HEADER_SIZE - 100];
        assert_matches!(entry_len(&key, &value), Err(CacheError::EntryExceedsChunk { .. }));
    }

    #[test]
    fn write_then_decode() {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        write_entry(&mut chunk, 10, b"abc", b"hello");

        // Big-endian length header
        assert_eq!(&chunk[10..14], &[0, 3, 0, 5]);

        let span = decode_entry(&chunk, 10).unwrap();
        assert_eq!(&chunk[span.key.clone()], b"abc");
        assert_eq!(&chunk[span.value.clone()], b"hello");
    }

    #[test]
    fn decode_rejects_overrun() {
        let mut chunk = vec![0u8; CHUNK_SIZE];

        // Header itself would touch the chunk end
        assert_eq!(decode_entry(&chunk, CHUNK_SIZE - ENTRY_HEADER_SIZE), None);

        // Lengths point past the end of the chunk
        chunk[0..4].copy_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(decode_entry(&chunk, 0), None);

        // Short buffer is never a valid chunk
        assert_eq!(decode_entry(&chunk[..100], 0), None);
    }

    #[test]
    fn location_packing() {
        let loc = Location::new(MAX_GEN, MAX_BUCKET_SIZE - 1);
        assert_eq!(loc.gen(), MAX_GEN);
        assert_eq!(loc.offset(), MAX_BUCKET_SIZE - 1);

        let loc = Location::new(7, 3 * CHUNK_SIZE as u64 + 42);
        assert_eq!(loc.chunk(), 3);
        assert_eq!(loc.chunk_offset(), 42);
    }

    #[test]
    fn liveness_rule() {
        // Written this generation, before the cursor
        assert!(Location::new(5, 100).is_live(5, 200));
        assert!(!Location::new(5, 200).is_live(5, 200));

        // Written last generation, not yet overwritten
        assert!(Location::new(4, 300).is_live(5, 200));
        assert!(!Location::new(4, 100).is_live(5, 200));

        // Two generations back is always gone
        assert!(!Location::new(3, 300).is_live(5, 200));

        // Rollover from MAX_GEN to 1
        assert!(Location::new(MAX_GEN, 300).is_live(1, 200));
        assert!(!Location::new(MAX_GEN, 100).is_live(1, 200));
        assert!(!Location::new(MAX_GEN - 1, 300).is_live(1, 200));
    }

    #[test]
    fn generation_skips_zero() {
        assert_eq!(next_gen(1), 2);
        assert_eq!(next_gen(MAX_GEN - 1), MAX_GEN);
        assert_eq!(next_gen(MAX_GEN), 1);
    }
}
