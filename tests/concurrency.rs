mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::{init_tracing, key, value_for};
use ringcache::{AllocatorKind, Cache, CacheBuilder, CacheError};

const THREADS: usize = 8;
const PER_THREAD: usize = 2000;

#[test]
fn disjoint_writers_then_readers() {
    init_tracing();
    let cache = Arc::new(Cache::new(64 << 20, None).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    let k = key(t * PER_THREAD + i);
                    cache.set(&k, &value_for(&k, 32)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(cache.len(), THREADS * PER_THREAD);
    for i in 0..THREADS * PER_THREAD {
        let k = key(i);
        assert_eq!(cache.get(&k).unwrap(), value_for(&k, 32));
    }
    assert_eq!(cache.info().evictions, 0);
}

#[test]
fn reads_under_wraparound_are_never_torn() {
    init_tracing();
    // One chunk per bucket, so writers wrap constantly.
    let cache = Arc::new(
        CacheBuilder::new(1)
            .allocator(AllocatorKind::Heap)
            .on_evict(|_| {})
            .build()
            .unwrap(),
    );
    let barrier = Arc::new(Barrier::new(THREADS * 2));

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let writer = cache.clone();
        let wb = barrier.clone();
        handles.push(thread::spawn(move || {
            wb.wait();
            for round in 0..4 {
                for i in 0..PER_THREAD {
                    let k = key(t * PER_THREAD + i);
                    let len = 1000 + (i + round) % 500;
                    writer.set(&k, &value_for(&k, len)).unwrap();
                }
            }
        }));

        let reader = cache.clone();
        let rb = barrier.clone();
        handles.push(thread::spawn(move || {
            rb.wait();
            let mut buf = Vec::new();
            for _ in 0..4 {
                for i in 0..PER_THREAD {
                    let k = key(t * PER_THREAD + i);
                    buf.clear();
                    match reader.get_into(&k, &mut buf) {
                        Ok(()) => assert_eq!(buf, value_for(&k, buf.len())),
                        Err(CacheError::NotFound) => {}
                        Err(e) => panic!("unexpected error {e}"),
                    }
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let info = cache.info();
    assert_eq!(info.corruptions, 0);
    assert!(info.allocated_bytes <= info.max_bytes);
}

#[test]
fn concurrent_counters_lose_no_updates() {
    let cache = Arc::new(Cache::new(1 << 20, None).unwrap());
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let k = key(i % 16);
                    cache
                        .update(&k, |cur| {
                            if cur.is_empty() {
                                return Ok::<_, CacheError>(Some(1u64.to_le_bytes().to_vec()));
                            }
                            let n = u64::from_le_bytes((&*cur).try_into().unwrap()) + 1;
                            cur.copy_from_slice(&n.to_le_bytes());
                            Ok(None)
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let total: u64 = (0..16)
        .map(|i| {
            let v = cache.get(&key(i)).unwrap();
            u64::from_le_bytes(v[..].try_into().unwrap())
        })
        .sum();
    assert_eq!(total, (THREADS * PER_THREAD) as u64);
}
