//! A futex-style mutex and condition variable, parameterized over a
//! [`crate::futex::ParkingBackend`].
//!
//! Grounded on `mutex/mutex.h`'s default (non-PI) mutex: the lock word has
//! three states — unlocked (`0`), locked with no known waiters (`1`), and
//! locked with waiters that must be woken on unlock (`2`, `mutex_lock`'s
//! `MUTEX_LOCKED | MUTEX_SLEEPING`). A fast path spins
//! [`SPIN_ATTEMPTS`] times before committing to parking, exactly as
//! `mutex_lock_default` does before calling `futex_wait`. `Condvar` mirrors
//! `mutex/cond.h`: `notify_one` is `cond_signal` (bump the sequence, wake
//! one), `notify_all` is `cond_broadcast` (bump the sequence, requeue the
//! rest directly onto the mutex's futex rather than waking them all only to
//! immediately re-contend).
//!
//! The priority-inheritance variant the original exposes via
//! `mutexattr_setprotocol(PRIO_INHERIT)` and `FUTEX_LOCK_PI`/`FUTEX_UNLOCK_PI`
//! is real kernel PI and only expressible through the actual Linux futex
//! syscalls; [`PiMutex`] uses them under
//! `cfg(all(target_os = "linux", feature = "linux-futex"))` and degrades to
//! the ordinary (non-inheriting) protocol elsewhere, which is documented on
//! the type rather than silently assumed.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::futex::{ParkingBackend, SpinBackend};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const LOCKED_WITH_WAITERS: u32 = 2;

const SPIN_ATTEMPTS: u32 = 128;

/// A mutual-exclusion lock built on a [`ParkingBackend`].
///
/// Defaults to [`SpinBackend`], the only backend guaranteed available in a
/// `no_std` build; pick `futex::CondvarBackend` or
/// `futex::LinuxFutexBackend` explicitly for real blocking.
pub struct Mutex<T, B: ParkingBackend = SpinBackend> {
    state: AtomicU32,
    backend: B,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only ever accessed through a `MutexGuard`, which exists
// only while `state` is held in a locked state.
unsafe impl<T: Send, B: ParkingBackend + Send> Send for Mutex<T, B> {}
unsafe impl<T: Send, B: ParkingBackend + Sync> Sync for Mutex<T, B> {}

impl<T, B: ParkingBackend + Default> Mutex<T, B> {
    /// Create a new, unlocked mutex using `B`'s default construction.
    pub fn new(value: T) -> Self {
        Self::with_backend(value, B::default())
    }
}

impl<T, B: ParkingBackend> Mutex<T, B> {
    /// Create a new, unlocked mutex using the given backend instance.
    pub fn with_backend(value: T, backend: B) -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            backend,
            data: UnsafeCell::new(value),
        }
    }

    /// Try to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, B>> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Acquire the lock, spinning briefly and then parking on contention.
    pub fn lock(&self) -> MutexGuard<'_, T, B> {
        for _ in 0..SPIN_ATTEMPTS {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            core::hint::spin_loop();
        }

        let mut state = self.state.swap(LOCKED_WITH_WAITERS, Ordering::Acquire);
        while state != UNLOCKED {
            self.backend.park_if_equal(&self.state, LOCKED_WITH_WAITERS);
            state = self.state.swap(LOCKED_WITH_WAITERS, Ordering::Acquire);
        }
        MutexGuard { mutex: self }
    }

    fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == LOCKED_WITH_WAITERS {
            self.backend.unpark_one(&self.state);
        }
    }
}

impl<T: Default, B: ParkingBackend + Default> Default for Mutex<T, B> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// An RAII guard granting exclusive access to a [`Mutex`]'s data.
pub struct MutexGuard<'a, T, B: ParkingBackend> {
    mutex: &'a Mutex<T, B>,
}

impl<T, B: ParkingBackend> Deref for MutexGuard<'_, T, B> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding a `MutexGuard` is proof of exclusive access.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T, B: ParkingBackend> DerefMut for MutexGuard<'_, T, B> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see `Deref`.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T, B: ParkingBackend> Drop for MutexGuard<'_, T, B> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// A condition variable, used together with a [`Mutex`] sharing the same
/// backend.
pub struct Condvar<B: ParkingBackend = SpinBackend> {
    sequence: AtomicU32,
    backend: B,
}

impl<B: ParkingBackend + Default> Condvar<B> {
    /// Create a condvar using `B`'s default construction.
    pub fn new() -> Self {
        Self::with_backend(B::default())
    }
}

impl<B: ParkingBackend> Condvar<B> {
    /// Create a condvar using the given backend instance.
    pub fn with_backend(backend: B) -> Self {
        Self {
            sequence: AtomicU32::new(0),
            backend,
        }
    }

    /// Atomically unlock `guard`'s mutex and block until woken, then
    /// reacquire it before returning. Like `pthread_cond_wait`, spurious
    /// wakeups are possible; callers must re-check their predicate in a
    /// loop.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T, B>) -> MutexGuard<'a, T, B> {
        let seq = self.sequence.load(Ordering::Relaxed);
        let mutex = guard.mutex;
        drop(guard);

        self.backend.park_if_equal(&self.sequence, seq);
        mutex.lock()
    }

    /// Wake one waiter.
    pub fn notify_one(&self) {
        self.sequence.fetch_add(1, Ordering::Relaxed);
        self.backend.unpark_one(&self.sequence);
    }

    /// Wake every waiter. Mirrors `cond_broadcast`'s use of `futex_requeue`:
    /// backends that support it move the woken threads directly onto the
    /// mutex's futex rather than waking all of them only to immediately
    /// re-contend for the same lock.
    pub fn notify_all<T>(&self, mutex: &Mutex<T, B>) {
        self.sequence.fetch_add(1, Ordering::Relaxed);
        self.backend
            .requeue(&self.sequence, 1, &mutex.state);
    }
}

impl<B: ParkingBackend + Default> Default for Condvar<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// A mutex using the kernel's priority-inheritance protocol, as
/// `mutexattr_setprotocol(PRIO_INHERIT)` selects in `mutex_init`.
///
/// The state word holds the owning thread's TID (`0` means unlocked),
/// exactly as `mutex_trylock_pi`/`mutex_lock_pi`/`mutex_unlock_pi` use it;
/// contended acquisition and release go through `FUTEX_LOCK_PI` /
/// `FUTEX_UNLOCK_PI` so the kernel can boost the owner's priority to that
/// of the highest-priority waiter. That protocol only exists as a Linux
/// futex operation, so it is only available under
/// `cfg(all(target_os = "linux", feature = "linux-futex"))`; elsewhere
/// (and whenever that feature is off) [`PiMutex`] falls back to the same
/// CAS-and-spin protocol as [`Mutex`] with [`SpinBackend`], which is
/// correct but does not inherit priority. Callers that need the real
/// guarantee must check for the feature at build time.
pub struct PiMutex<T> {
    state: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for PiMutex<T> {}
unsafe impl<T: Send> Sync for PiMutex<T> {}

impl<T> PiMutex<T> {
    /// Create a new, unlocked priority-inheriting mutex.
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, as `mutex_lock_pi`.
    pub fn lock(&self) -> PiMutexGuard<'_, T> {
        for _ in 0..SPIN_ATTEMPTS {
            if self.try_lock_raw() {
                return PiMutexGuard { mutex: self };
            }
            core::hint::spin_loop();
        }
        self.lock_contended();
        PiMutexGuard { mutex: self }
    }

    /// Try to acquire the lock without blocking, as `mutex_trylock_pi`.
    pub fn try_lock(&self) -> Option<PiMutexGuard<'_, T>> {
        if self.try_lock_raw() {
            Some(PiMutexGuard { mutex: self })
        } else {
            None
        }
    }

    fn try_lock_raw(&self) -> bool {
        let tid = current_tid();
        self.state
            .compare_exchange(0, tid, Ordering::Acquire, Ordering::Acquire)
            .is_ok()
    }

    #[cfg(all(target_os = "linux", feature = "linux-futex"))]
    fn lock_contended(&self) {
        // SAFETY: `state` outlives the syscall; FUTEX_LOCK_PI only reads and
        // CASes the word itself, blocking in-kernel until it can set our
        // TID as owner.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.state as *const AtomicU32 as *const u32,
                libc::FUTEX_LOCK_PI | libc::FUTEX_PRIVATE_FLAG,
                0,
                core::ptr::null::<libc::timespec>(),
            );
        }
    }

    #[cfg(not(all(target_os = "linux", feature = "linux-futex")))]
    fn lock_contended(&self) {
        let mut backoff = crate::backoff::Backoff::new();
        while !self.try_lock_raw() {
            backoff.spin();
        }
    }

    fn unlock(&self) {
        let tid = current_tid();
        if self
            .state
            .compare_exchange(tid, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.unlock_contended();
    }

    #[cfg(all(target_os = "linux", feature = "linux-futex"))]
    fn unlock_contended(&self) {
        // SAFETY: see `lock_contended`; FUTEX_UNLOCK_PI hands ownership to
        // the highest-priority waiter the kernel recorded for this word.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.state as *const AtomicU32 as *const u32,
                libc::FUTEX_UNLOCK_PI | libc::FUTEX_PRIVATE_FLAG,
            );
        }
    }

    #[cfg(not(all(target_os = "linux", feature = "linux-futex")))]
    fn unlock_contended(&self) {
        // The CAS in `unlock` above already failed, meaning some other
        // thread's spin-loop `try_lock_raw` will observe the `0` we are
        // about to store; nothing further to do without a real futex.
        self.state.store(0, Ordering::Release);
    }
}

#[cfg(all(target_os = "linux", feature = "linux-futex"))]
fn current_tid() -> u32 {
    // SAFETY: `gettid` takes no arguments and always succeeds.
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

#[cfg(not(all(target_os = "linux", feature = "linux-futex")))]
fn current_tid() -> u32 {
    // No portable thread-id source without `std`; any nonzero, per-thread
    // stable value would do, but without a real futex this path only ever
    // spins (see `lock_contended`/`unlock_contended` above), so a fixed
    // sentinel is sufficient to distinguish "locked" from "unlocked".
    1
}

impl<T: Default> Default for PiMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// An RAII guard granting exclusive access to a [`PiMutex`]'s data.
pub struct PiMutexGuard<'a, T> {
    mutex: &'a PiMutex<T>,
}

impl<T> Deref for PiMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for PiMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for PiMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_excludes_a_second_try_lock() {
        let mutex: Mutex<i32> = Mutex::new(0);
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn guard_derefs_to_the_protected_value() {
        let mutex: Mutex<i32> = Mutex::new(10);
        {
            let mut guard = mutex.lock();
            *guard += 5;
        }
        assert_eq!(*mutex.lock(), 15);
    }

    #[test]
    fn unlock_wakes_a_waiter_state() {
        let mutex: Mutex<i32> = Mutex::new(0);
        let guard = mutex.lock();
        // Force the slow path's "waiters present" bit, as a blocked second
        // locker would.
        mutex.state.store(LOCKED_WITH_WAITERS, Ordering::SeqCst);
        drop(guard);
        assert_eq!(mutex.state.load(Ordering::SeqCst), UNLOCKED);
    }

    #[test]
    fn pi_mutex_excludes_a_second_try_lock() {
        let mutex: PiMutex<i32> = PiMutex::new(0);
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn pi_mutex_guard_derefs_to_the_protected_value() {
        let mutex: PiMutex<i32> = PiMutex::new(10);
        {
            let mut guard = mutex.lock();
            *guard += 5;
        }
        assert_eq!(*mutex.lock(), 15);
    }
}
