//! Thread parking backends for [`crate::mutex`] and its condition variable.
//!
//! Grounded on `mutex/futex.h`: [`ParkingBackend::park_if_equal`] is
//! `futex_wait` (block only if the word still holds the expected value,
//! closing the classic wait/wake race), [`ParkingBackend::unpark_one`] and
//! [`ParkingBackend::unpark_all`] are `futex_wake` with a wake count of `1`
//! or unbounded, and [`ParkingBackend::requeue`] is `futex_requeue` (used by
//! a broadcasting condvar to move waiters onto the mutex's futex instead of
//! waking every one of them only to immediately re-block).
//!
//! Three backends implement the trait:
//! - [`LinuxFutexBackend`] issues the real `futex(2)` syscall via `libc`,
//!   available under `cfg(all(target_os = "linux", feature = "linux-futex"))`.
//! - [`CondvarBackend`] buckets addresses over a fixed table of
//!   `std::sync::{Mutex, Condvar}` pairs, available whenever `std` is
//!   enabled — the portable fallback for non-Linux targets.
//! - [`SpinBackend`] busy-waits with [`crate::backoff::Backoff`]; the only
//!   option with neither `std` nor a real futex, and the weakest (it cannot
//!   truly park a thread, only spin it).

use core::sync::atomic::{AtomicU32, Ordering};

/// A mechanism for blocking a thread on a 32-bit word until another thread
/// changes it.
pub trait ParkingBackend {
    /// Block the calling thread iff `addr` still holds `expected`. Spurious
    /// wakeups are permitted; callers must re-check their condition in a
    /// loop.
    fn park_if_equal(&self, addr: &AtomicU32, expected: u32);

    /// Wake at most one thread parked on `addr`.
    fn unpark_one(&self, addr: &AtomicU32);

    /// Wake every thread parked on `addr`.
    fn unpark_all(&self, addr: &AtomicU32);

    /// Wake up to `wake_count` threads parked on `addr`; move any remaining
    /// waiters to park on `other` instead. Backends that cannot requeue
    /// simply wake everyone, which is correct but less efficient.
    fn requeue(&self, addr: &AtomicU32, wake_count: u32, other: &AtomicU32) {
        if wake_count == 0 {
            self.unpark_all(addr);
        } else {
            self.unpark_one(addr);
        }
        let _ = other;
    }
}

/// Real Linux futex syscalls, as in `mutex/futex.h`.
#[cfg(all(target_os = "linux", feature = "linux-futex"))]
#[derive(Default)]
pub struct LinuxFutexBackend;

#[cfg(all(target_os = "linux", feature = "linux-futex"))]
impl ParkingBackend for LinuxFutexBackend {
    fn park_if_equal(&self, addr: &AtomicU32, expected: u32) {
        // SAFETY: `addr` outlives the syscall (borrowed for its duration);
        // FUTEX_WAIT_PRIVATE only ever reads/compares the word and, if it
        // matches, blocks the calling thread.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                addr as *const AtomicU32 as *const u32,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected as i32,
                core::ptr::null::<libc::timespec>(),
            );
        }
    }

    fn unpark_one(&self, addr: &AtomicU32) {
        // SAFETY: see `park_if_equal`; FUTEX_WAKE never dereferences
        // beyond the word itself.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                addr as *const AtomicU32 as *const u32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
            );
        }
    }

    fn unpark_all(&self, addr: &AtomicU32) {
        // SAFETY: see `park_if_equal`.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                addr as *const AtomicU32 as *const u32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                i32::MAX,
            );
        }
    }

    fn requeue(&self, addr: &AtomicU32, wake_count: u32, other: &AtomicU32) {
        // SAFETY: both `addr` and `other` outlive the syscall; FUTEX_REQUEUE
        // reads/moves kernel-internal wait-queue entries, never user memory
        // beyond the two words.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                addr as *const AtomicU32 as *const u32,
                libc::FUTEX_REQUEUE | libc::FUTEX_PRIVATE_FLAG,
                wake_count as i32,
                i32::MAX,
                other as *const AtomicU32 as *const u32,
            );
        }
    }
}

/// A portable fallback backend: addresses are bucketed by pointer value
/// over a fixed table of `std::sync::{Mutex, Condvar}` pairs.
///
/// This is necessarily approximate (two unrelated addresses can hash to the
/// same bucket, causing a spurious wakeup — always permitted by the trait's
/// contract) but requires no OS-specific syscall.
#[cfg(feature = "std")]
pub struct CondvarBackend {
    buckets: alloc::boxed::Box<[Bucket]>,
}

#[cfg(feature = "std")]
struct Bucket {
    mutex: std::sync::Mutex<()>,
    condvar: std::sync::Condvar,
}

#[cfg(feature = "std")]
impl CondvarBackend {
    const DEFAULT_BUCKET_COUNT: usize = 64;

    /// Create a backend with the default bucket count.
    pub fn new() -> Self {
        Self::with_buckets(Self::DEFAULT_BUCKET_COUNT)
    }

    /// Create a backend with a caller-chosen, power-of-two bucket count.
    pub fn with_buckets(count: usize) -> Self {
        let count = count.next_power_of_two().max(1);
        let buckets = (0..count)
            .map(|_| Bucket {
                mutex: std::sync::Mutex::new(()),
                condvar: std::sync::Condvar::new(),
            })
            .collect::<alloc::vec::Vec<_>>()
            .into_boxed_slice();
        Self { buckets }
    }

    fn bucket_for(&self, addr: &AtomicU32) -> &Bucket {
        let idx = (addr as *const AtomicU32 as usize >> 2) & (self.buckets.len() - 1);
        &self.buckets[idx]
    }
}

#[cfg(feature = "std")]
impl Default for CondvarBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl ParkingBackend for CondvarBackend {
    fn park_if_equal(&self, addr: &AtomicU32, expected: u32) {
        let bucket = self.bucket_for(addr);
        let guard = bucket.mutex.lock().unwrap_or_else(|e| e.into_inner());
        if addr.load(Ordering::SeqCst) != expected {
            return;
        }
        let _ = bucket
            .condvar
            .wait_timeout(guard, core::time::Duration::from_millis(10))
            .unwrap_or_else(|e| e.into_inner());
    }

    fn unpark_one(&self, addr: &AtomicU32) {
        let bucket = self.bucket_for(addr);
        let _guard = bucket.mutex.lock().unwrap_or_else(|e| e.into_inner());
        bucket.condvar.notify_one();
    }

    fn unpark_all(&self, addr: &AtomicU32) {
        let bucket = self.bucket_for(addr);
        let _guard = bucket.mutex.lock().unwrap_or_else(|e| e.into_inner());
        bucket.condvar.notify_all();
    }
}

/// A backend with no OS support at all: busy-waits with exponential
/// backoff. Correct, but never truly parks the calling thread.
#[derive(Default)]
pub struct SpinBackend;

impl ParkingBackend for SpinBackend {
    fn park_if_equal(&self, addr: &AtomicU32, expected: u32) {
        let mut backoff = crate::backoff::Backoff::new();
        while addr.load(Ordering::SeqCst) == expected {
            backoff.spin();
        }
    }

    fn unpark_one(&self, _addr: &AtomicU32) {}

    fn unpark_all(&self, _addr: &AtomicU32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_backend_returns_once_value_changes() {
        let word = AtomicU32::new(0);
        word.store(1, Ordering::SeqCst);
        SpinBackend.park_if_equal(&word, 0);
    }

    #[cfg(feature = "std")]
    #[test]
    fn condvar_backend_wakes_a_parked_thread() {
        use alloc::sync::Arc;
        let backend = Arc::new(CondvarBackend::new());
        let word = Arc::new(AtomicU32::new(0));

        let b = backend.clone();
        let w = word.clone();
        let handle = std::thread::spawn(move || {
            b.park_if_equal(&w, 0);
        });

        std::thread::sleep(core::time::Duration::from_millis(5));
        word.store(1, Ordering::SeqCst);
        backend.unpark_all(&word);
        handle.join().unwrap();
    }
}
