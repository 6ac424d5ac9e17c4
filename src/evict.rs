//! Eviction batches and their asynchronous delivery.
//!
//! Buckets copy evicted entries out while they hold their lock and hand the
//! batch to the cache, which forwards it here after the lock is released.
//! A single background thread runs the user callback, so callback latency
//! never blocks cache operations.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;
use tracing::{debug, error, trace, warn};

/// User callback receiving evicted entries.
pub type OnEvict = Arc<dyn Fn(EvictionBatch) + Send + Sync>;

/// Owned `(key, value)` pairs evicted by one cleanup pass or reset.
///
/// Nothing in a batch aliases cache memory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionBatch {
    keys: Vec<Vec<u8>>,
    values: Vec<Vec<u8>>,
}

impl EvictionBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        EvictionBatch {
            keys: Vec::with_capacity(n),
            values: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, key: &[u8], value: &[u8]) {
        self.keys.push(key.to_vec());
        self.values.push(value.to_vec());
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[Vec<u8>] {
        &self.keys
    }

    pub fn values(&self) -> &[Vec<u8>] {
        &self.values
    }

    /// Iterate `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.keys
            .iter()
            .zip(self.values.iter())
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Move every entry of `other` into `self`.
    pub fn append(&mut self, other: &mut EvictionBatch) {
        self.keys.append(&mut other.keys);
        self.values.append(&mut other.values);
    }
}

impl IntoIterator for EvictionBatch {
    type Item = (Vec<u8>, Vec<u8>);
    type IntoIter = std::iter::Zip<std::vec::IntoIter<Vec<u8>>, std::vec::IntoIter<Vec<u8>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys.into_iter().zip(self.values)
    }
}

/// Fire-and-forget delivery of batches to the callback thread.
///
/// Dropping the dispatcher closes the channel; batches already queued are
/// still delivered, but nothing waits for them.
pub(crate) struct Dispatcher {
    tx: Sender<EvictionBatch>,
}

impl Dispatcher {
    pub(crate) fn spawn(callback: OnEvict) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<EvictionBatch>();
        thread::Builder::new()
            .name("ringcache-evict".into())
            .spawn(move || {
                for batch in rx {
                    let entries = batch.len();
                    let cb = &callback;
                    if panic::catch_unwind(AssertUnwindSafe(|| cb(batch))).is_err() {
                        error!(entries, "eviction callback panicked, batch dropped");
                    }
                }
                debug!("eviction dispatcher stopped");
            })?;
        Ok(Dispatcher { tx })
    }

    pub(crate) fn dispatch(&self, batch: EvictionBatch) {
        if batch.is_empty() {
            return;
        }
        trace!(entries = batch.len(), "dispatching eviction batch");
        if self.tx.send(batch).is_err() {
            warn!("eviction dispatcher is gone, batch dropped");
        }
    }
}
