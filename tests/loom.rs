//! Interleaving tests for the three hottest CAS loops in the crate: the
//! MPMC ring, the hazard-pointer queue, and the futex mutex.
//!
//! Grounded on `codyps-local-rcu/tests/loom.rs`'s shape: one `#[test]` per
//! scenario, each wrapped in `loom::model`, gated entirely behind
//! `cfg(loom)` so a normal `cargo test` never builds this file against a
//! loom-instrumented runtime it doesn't have.
//!
//! These drive the crate's real types (backed by `core::sync::atomic`)
//! from `loom::thread`s rather than through loom's own atomic types, so
//! loom explores thread interleavings and scheduling points but not
//! every possible relaxed-memory reordering of individual loads/stores.
//! Full per-atomic instrumentation would need every hot-path module
//! routed through a `cfg(loom)`-swappable atomics facade; these three
//! scenarios are the targeted subset named as needing interleaving
//! coverage, not a claim of exhaustive memory-model checking.

#![cfg(loom)]

use loom::thread;

use concur_core::hp_fifo::HpQueue;
use concur_core::mutex::Mutex;
use concur_core::ring::MpmcRing;

#[test]
fn loom_ring_one_producer_one_consumer_preserves_order() {
    loom::model(|| {
        let ring: MpmcRing<u32> = MpmcRing::new(2).unwrap();
        let ring = loom::sync::Arc::new(ring);

        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for i in 0..3u32 {
                    while ring.enqueue(i).is_err() {
                        loom::thread::yield_now();
                    }
                }
            })
        };

        let consumer = thread::spawn(move || {
            let mut prev = None;
            let mut seen = 0;
            while seen < 3 {
                if let Ok(v) = ring.dequeue() {
                    if let Some(p) = prev {
                        assert!(v > p);
                    }
                    prev = Some(v);
                    seen += 1;
                } else {
                    loom::thread::yield_now();
                }
            }
        });

        producer.join().unwrap();
        consumer.join().unwrap();
    });
}

#[test]
fn loom_hp_queue_two_producers_one_consumer_sees_every_item() {
    loom::model(|| {
        let queue: HpQueue<u32> = HpQueue::new();
        let queue = loom::sync::Arc::new(queue);

        let producers: Vec<_> = (0..2)
            .map(|t| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let guard = queue.register();
                    guard.enqueue(t);
                })
            })
            .collect();

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let guard = queue.register();
                let mut count = 0;
                while count < 2 {
                    if guard.dequeue().is_some() {
                        count += 1;
                    } else {
                        loom::thread::yield_now();
                    }
                }
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        consumer.join().unwrap();
    });
}

#[test]
fn loom_mutex_excludes_concurrent_increments() {
    loom::model(|| {
        let mutex = loom::sync::Arc::new(Mutex::<u32>::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let mutex = mutex.clone();
                thread::spawn(move || {
                    let mut guard = mutex.lock();
                    *guard += 1;
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*mutex.lock(), 2);
    });
}
