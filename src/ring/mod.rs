//! Per-shard ring-buffer storage.
//!
//! `layout` defines the entry encoding and packed index locations;
//! `bucket` implements the write cursor, generations and cleanup.

mod bucket;
pub mod layout;

pub(crate) use bucket::Bucket;
