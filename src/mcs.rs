//! MCS queue lock.
//!
//! Each waiter spins on a field of its own node rather than on a shared
//! word, so contention never bounces a single cache line between cores.
//! Grounded on `mcslock.c`: acquire exchanges the lock's tail pointer with
//! the caller's node; a `None` previous tail means the lock was free and
//! acquired immediately, otherwise the caller links itself after the
//! previous tail and spins on its own `wait` flag until that predecessor
//! signals it. Release hands the lock to the successor if one has already
//! linked in, or clears the tail if not — racing a concurrent acquirer that
//! is mid-link, in which case it waits for that link to complete rather
//! than losing the successor.
//!
//! Strict FIFO: waiters are served in the order they exchanged into the
//! tail, so no thread can be starved by later arrivals.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::backoff::Backoff;

/// A waiter's queue node. Heap-allocated per acquisition so the caller's
/// stack frame need not outlive contended handoffs across threads.
struct Node {
    next: AtomicPtr<Node>,
    wait: AtomicBool,
}

/// An MCS queue-based mutual exclusion lock.
pub struct McsLock<T: ?Sized> {
    tail: AtomicPtr<Node>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for McsLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for McsLock<T> {}

impl<T> McsLock<T> {
    /// Create a new unlocked lock.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            tail: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> McsLock<T> {
    /// Acquire the lock, spinning on a private node until it is this
    /// caller's turn.
    ///
    /// Returns a guard whose `Drop` releases the lock.
    pub fn lock(&self) -> McsGuard<'_, T> {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            wait: AtomicBool::new(false),
        }));

        // A0: exchange lock, acquire-release so our later reads of shared
        // data synchronize with the previous holder's release.
        let prev = self.tail.swap(node, Ordering::AcqRel);

        if !prev.is_null() {
            // SAFETY: `node` was just allocated and not yet published
            // anywhere else.
            unsafe {
                (*node).wait.store(true, Ordering::Relaxed);
            }
            // B0: publish `next` on the predecessor, release so its C0 read
            // observes our fully-initialized node.
            unsafe {
                (*prev).next.store(node, Ordering::Release);
            }
            let mut backoff = Backoff::new();
            // C0: spin until the predecessor signals `wait = false`.
            unsafe {
                while (*node).wait.load(Ordering::Acquire) {
                    backoff.spin();
                }
            }
        }

        McsGuard { lock: self, node }
    }
}

/// RAII guard returned by [`McsLock::lock`]; releasing the lock on drop.
pub struct McsGuard<'a, T: ?Sized> {
    lock: &'a McsLock<T>,
    node: *mut Node,
}

impl<T: ?Sized> Deref for McsGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for McsGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for McsGuard<'_, T> {
    fn drop(&mut self) {
        let node = self.node;
        // B1: check for an already-linked successor.
        let next = unsafe { (*node).next.load(Ordering::Acquire) };
        if next.is_null() {
            // A1: try to clear the tail if we are still it.
            let cleared = self
                .lock
                .tail
                .compare_exchange(node, ptr::null_mut(), Ordering::Release, Ordering::Relaxed)
                .is_ok();
            if cleared {
                unsafe {
                    drop(Box::from_raw(node));
                }
                return;
            }
            // Lost the race: a successor is mid-link (past A0, before B0).
            // Wait for it to publish itself into our `next`.
            let mut backoff = Backoff::new();
            let successor = loop {
                let n = unsafe { (*node).next.load(Ordering::Acquire) };
                if !n.is_null() {
                    break n;
                }
                backoff.spin();
            };
            // C1: signal the successor.
            unsafe {
                (*successor).wait.store(false, Ordering::Release);
            }
        } else {
            // C1: signal the already-linked successor.
            unsafe {
                (*next).wait.store(false, Ordering::Release);
            }
        }
        unsafe {
            drop(Box::from_raw(node));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    #[test]
    fn uncontended_lock_unlock() {
        let lock = McsLock::new(0u32);
        {
            let mut g = lock.lock();
            *g = 5;
        }
        let g = lock.lock();
        assert_eq!(*g, 5);
    }

    #[cfg(feature = "std")]
    #[test]
    fn serializes_concurrent_increments() {
        let lock = Arc::new(McsLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let mut g = lock.lock();
                    *g += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }
}
