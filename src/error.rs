//! Error types for the ring-buffer cache

use thiserror::Error;

/// Result type alias using [`CacheError`]
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors returned by cache construction and data-path operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// Key absent, deleted, or its bytes were already overwritten
    #[error("no data for key")]
    NotFound,

    /// A stored entry failed to decode
    #[error("corrupted data in chunk {chunk} at offset {offset}")]
    CorruptedData { chunk: usize, offset: usize },

    /// Bad construction parameters
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Key length cannot be encoded in the entry header
    #[error("key length {len} too big; must be < 65536")]
    KeyTooLarge { len: usize },

    /// Value length cannot be encoded in the entry header
    #[error("value length {len} too big; must be < 65536")]
    ValueTooLarge { len: usize },

    /// Encoded entry would not fit in a single chunk
    #[error("entry length {len} exceeds chunk size")]
    EntryExceedsChunk { len: usize },

    /// The eviction dispatcher thread could not be started
    #[error("failed to start eviction dispatcher: {0}")]
    Dispatcher(#[source] std::io::Error),
}

impl CacheError {
    /// True for [`CacheError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound)
    }
}
