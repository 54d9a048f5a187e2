use std::hash::{Hash, Hasher};

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use concur_core::cmap::Cmap;
use concur_core::deque::Deque;
use concur_core::hp_fifo::HpQueue;
use concur_core::mcs::McsLock;
use concur_core::mutex::Mutex;
use concur_core::pool::Pool;
use concur_core::ring::MpmcRing;

fn hash_of(key: u64) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

fn ring_round_trip(c: &mut Criterion) {
    let ring: MpmcRing<u64> = MpmcRing::new(1024).unwrap();
    c.bench_function("ring_enqueue_dequeue", |b| {
        b.iter(|| {
            ring.enqueue(black_box(1)).ok();
            black_box(ring.dequeue().ok());
        })
    });
}

fn pool_acquire_release(c: &mut Criterion) {
    let pool: Pool<u64> = Pool::new(256).unwrap();
    c.bench_function("pool_acquire_release", |b| {
        b.iter(|| {
            let handle = pool.acquire(black_box(7)).unwrap();
            black_box(pool.release(handle));
        })
    });
}

fn mcs_lock_unlock(c: &mut Criterion) {
    let lock: McsLock<u64> = McsLock::new(0);
    c.bench_function("mcs_lock_unlock", |b| {
        b.iter(|| {
            let mut guard = lock.lock();
            *guard = guard.wrapping_add(1);
        })
    });
}

fn mutex_lock_unlock(c: &mut Criterion) {
    let mutex: Mutex<u64> = Mutex::new(0);
    c.bench_function("mutex_lock_unlock", |b| {
        b.iter(|| {
            let mut guard = mutex.lock();
            *guard = guard.wrapping_add(1);
        })
    });
}

fn cmap_insert_find(c: &mut Criterion) {
    let map: Cmap<u64, u64> = Cmap::new();
    let reader = map.register();
    let mut key = 0u64;
    c.bench_function("cmap_insert_find", |b| {
        b.iter(|| {
            key = key.wrapping_add(1);
            let hash = hash_of(key);
            map.insert(hash, key, key);
            black_box(reader.find(hash, &key));
        })
    });
}

fn hp_queue_enqueue_dequeue(c: &mut Criterion) {
    let queue: HpQueue<u64> = HpQueue::new();
    let guard = queue.register();
    c.bench_function("hp_queue_enqueue_dequeue", |b| {
        b.iter(|| {
            guard.enqueue(black_box(1));
            black_box(guard.dequeue());
        })
    });
}

fn deque_push_take(c: &mut Criterion) {
    let deque: Deque<u64> = Deque::new(256);
    c.bench_function("deque_push_take", |b| {
        b.iter(|| {
            deque.push(black_box(1));
            black_box(deque.take());
        })
    });
}

criterion_group!(
    benches,
    ring_round_trip,
    pool_acquire_release,
    mcs_lock_unlock,
    mutex_lock_unlock,
    cmap_insert_find,
    hp_queue_enqueue_dequeue,
    deque_push_take,
);
criterion_main!(benches);
