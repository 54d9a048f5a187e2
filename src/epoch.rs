//! QSBR (quiescent-state-based) reclamation.
//!
//! Unlike [`crate::hp`]'s per-access hazard pointers, QSBR has no
//! critical-section API: a registered thread simply calls [`Guard::quiescent`]
//! whenever it is *not* holding any reference into a QSBR-protected
//! structure (typically once per iteration of its main loop). An object
//! retired in epoch `E` is safe to free once every registered thread has
//! called `quiescent` at least once since `E` — i.e. has observed the
//! epoch advance past `E`.
//!
//! The global epoch and per-thread observed epochs live in a [`Qsbr`]
//! value the caller owns and passes explicitly (Design Notes' "eliminate
//! process-wide statics"), not in a module-level `static`. Garbage is kept
//! in two generations, `to_free1`/`to_free2`: retires land in whichever
//! generation is still accepting them, and the first thread to observe a
//! new epoch frees `to_free1` (everything retired at least one full grace
//! period ago), promotes `to_free2` into its place, and bumps the epoch —
//! matching `spec.md` §4.7's two-generation scheme exactly.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

struct Deferred {
    ptr: *mut u8,
    free_fn: unsafe fn(*mut u8),
}

/// A registered thread's observed-epoch record.
#[repr(C)]
pub struct QsbrRecord {
    observed_epoch: AtomicUsize,
    next: AtomicPtr<QsbrRecord>,
}

impl QsbrRecord {
    fn new(epoch: usize) -> Self {
        Self {
            observed_epoch: AtomicUsize::new(epoch),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Global QSBR state: the epoch counter, the registered-thread list, and
/// the two garbage generations. Owned explicitly by the caller (e.g. one
/// instance per data structure, or one shared across a subsystem) rather
/// than as a process-wide static.
pub struct Qsbr {
    global_epoch: AtomicUsize,
    records: AtomicPtr<QsbrRecord>,
    to_free1: UnsafeCell<Vec<Deferred>>,
    to_free2: UnsafeCell<Vec<Deferred>>,
    /// Which generation (`1` or `2`) retires currently land in.
    active_generation: AtomicUsize,
    /// Serializes the epoch-advance/drain step so only one thread performs
    /// it per transition even if several observe the new epoch at once.
    advancing: AtomicUsize,
}

// SAFETY: `to_free1`/`to_free2` are only mutated while `advancing` is held
// (drain/promote) or from `retire`, which is documented as requiring the
// caller to serialize retires the same way the single-writer structures
// built on this do; the record list itself is a lock-free singly linked
// list like `hp`'s.
unsafe impl Send for Qsbr {}
unsafe impl Sync for Qsbr {}

impl Qsbr {
    /// Create a fresh QSBR context starting at epoch 0.
    pub const fn new() -> Self {
        Self {
            global_epoch: AtomicUsize::new(0),
            records: AtomicPtr::new(ptr::null_mut()),
            to_free1: UnsafeCell::new(Vec::new()),
            to_free2: UnsafeCell::new(Vec::new()),
            active_generation: AtomicUsize::new(1),
            advancing: AtomicUsize::new(0),
        }
    }

    /// Current global epoch.
    #[inline]
    pub fn epoch(&self) -> usize {
        self.global_epoch.load(Ordering::Acquire)
    }

    /// Register the calling thread, returning a guard it keeps for the
    /// rest of its lifetime (or until [`Guard::unregister`]).
    pub fn register(&self) -> Guard<'_> {
        let epoch = self.epoch();
        // Stamp the new record one epoch *behind* current, never at it.
        // A thread might already hold a reference it took before calling
        // `register` (or simply may not have quiesced since joining); if
        // its record started already "caught up" at the current epoch, a
        // retire that landed in the current generation right before this
        // registration could be freed the moment every *other* thread next
        // quiesces, without this thread itself ever having passed through a
        // quiescent point since joining — short-circuiting the grace period
        // it is supposed to be part of. Forcing one real `quiescent()` call
        // before this record can count as caught-up closes that window.
        // Wrapping on `epoch == 0` is harmless: it only makes the record
        // maximally "behind", never accidentally caught up.
        let record = Box::into_raw(Box::new(QsbrRecord::new(epoch.wrapping_sub(1))));
        loop {
            let head = self.records.load(Ordering::Relaxed);
            unsafe { (*record).next.store(head, Ordering::Relaxed) };
            if self
                .records
                .compare_exchange_weak(head, record, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        Guard {
            qsbr: self,
            record,
            _marker: core::marker::PhantomData,
        }
    }

    fn all_caught_up(&self, epoch: usize) -> bool {
        let mut current = self.records.load(Ordering::Acquire);
        while !current.is_null() {
            let record = unsafe { &*current };
            if record.observed_epoch.load(Ordering::Acquire) != epoch {
                return false;
            }
            current = record.next.load(Ordering::Acquire);
        }
        true
    }

    /// Retire a pointer: appends to the generation currently accepting
    /// retires. Caller must serialize calls to `retire` the way the
    /// single-writer structure that owns this `Qsbr` already serializes
    /// its own writes.
    ///
    /// # Safety
    ///
    /// `ptr` must be a valid, uniquely-owned `Box<T>`-allocated pointer
    /// not otherwise freed.
    pub unsafe fn retire<T>(&self, ptr: *mut T) {
        let deferred = Deferred {
            ptr: ptr as *mut u8,
            free_fn: |p| drop(Box::from_raw(p as *mut T)),
        };
        let generation = self.active_generation.load(Ordering::Acquire);
        let list = if generation == 1 {
            &mut *self.to_free1.get()
        } else {
            &mut *self.to_free2.get()
        };
        list.push(deferred);
    }

    /// Drain a generation's garbage by calling each entry's deleter.
    unsafe fn drain(&self, generation: usize) {
        let list = if generation == 1 {
            &mut *self.to_free1.get()
        } else {
            &mut *self.to_free2.get()
        };
        for item in list.drain(..) {
            (item.free_fn)(item.ptr);
        }
    }
}

impl Default for Qsbr {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Qsbr {
    fn drop(&mut self) {
        // `&mut self`: no registered reader can still be observing anything
        // in either generation, grace period or not, so both can be freed
        // unconditionally rather than left to leak.
        unsafe {
            self.drain(1);
            self.drain(2);
        }
        let mut current = *self.records.get_mut();
        while !current.is_null() {
            // SAFETY: `&mut self` guarantees no other thread holds a
            // `Guard` referencing these records any more.
            let mut record = unsafe { Box::from_raw(current) };
            current = *record.next.get_mut();
        }
    }
}

/// A registered thread's handle into a [`Qsbr`] context.
pub struct Guard<'a> {
    qsbr: &'a Qsbr,
    record: *mut QsbrRecord,
    _marker: core::marker::PhantomData<*mut ()>,
}

impl<'a> Guard<'a> {
    /// Announce that the calling thread currently holds no reference into
    /// any structure protected by this `Qsbr` (no critical section to
    /// enter/leave, unlike hazard pointers — quiescence is a point in
    /// time, not a span).
    ///
    /// If this call observes that every registered thread has now reached
    /// the current global epoch, it is responsible (exactly once, via
    /// `advancing`) for draining the older garbage generation, promoting
    /// the newer one in its place, and bumping the epoch.
    pub fn quiescent(&self) {
        let record = unsafe { &*self.record };
        let epoch = self.qsbr.epoch();
        record.observed_epoch.store(epoch, Ordering::Release);

        if !self.qsbr.all_caught_up(epoch) {
            return;
        }

        if self
            .qsbr
            .advancing
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let old_generation = self.qsbr.active_generation.load(Ordering::Acquire);
        let new_generation = if old_generation == 1 { 2 } else { 1 };
        // SAFETY: `advancing` serializes this drain/promote step against
        // every other thread's `quiescent` call.
        unsafe { self.qsbr.drain(old_generation) };
        self.qsbr
            .active_generation
            .store(new_generation, Ordering::Release);
        self.qsbr
            .global_epoch
            .fetch_add(1, Ordering::AcqRel);
        self.qsbr.advancing.store(0, Ordering::Release);
    }

    /// Remove this thread's record from the registered list. After this
    /// call the thread no longer blocks epoch advancement, and must not
    /// call `quiescent` again on this guard.
    pub fn unregister(self) {
        // Dropping removes the record's influence by leaving it registered
        // at its last observed epoch forever would block progress, so we
        // physically unlink it here.
        self.unlink();
    }

    fn unlink(&self) {
        let target = self.record;
        loop {
            let head = self.qsbr.records.load(Ordering::Acquire);
            if head == target {
                let next = unsafe { (*target).next.load(Ordering::Acquire) };
                if self
                    .qsbr
                    .records
                    .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            let mut prev = head;
            loop {
                if prev.is_null() {
                    return;
                }
                let next = unsafe { (*prev).next.load(Ordering::Acquire) };
                if next == target {
                    let after = unsafe { (*target).next.load(Ordering::Acquire) };
                    unsafe { (*prev).next.store(after, Ordering::Release) };
                    return;
                }
                prev = next;
            }
        }
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.unlink();
        // SAFETY: unlinked above, no other thread can observe this record.
        unsafe {
            drop(Box::from_raw(self.record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_quiesce() {
        let qsbr = Qsbr::new();
        let guard = qsbr.register();
        guard.quiescent();
        assert!(qsbr.epoch() >= 1);
    }

    #[test]
    fn retired_object_is_freed_after_every_thread_quiesces() {
        let qsbr = Qsbr::new();
        let g1 = qsbr.register();
        let g2 = qsbr.register();

        let ptr = Box::into_raw(Box::new(7u32));
        unsafe { qsbr.retire(ptr) };

        // Neither thread has quiesced yet: advancing the epoch requires
        // every record to observe it, so this alone doesn't free it, but
        // there is nothing unsafe about calling quiescent.
        g1.quiescent();
        g2.quiescent();
        // By now every registered thread has observed the advanced epoch
        // at least once; a further quiescent call drains the prior
        // generation.
        g1.quiescent();
    }

    #[test]
    fn single_thread_advances_epoch_every_quiescent_call() {
        let qsbr = Qsbr::new();
        let guard = qsbr.register();
        let e0 = qsbr.epoch();
        guard.quiescent();
        let e1 = qsbr.epoch();
        assert!(e1 > e0);
    }

    #[test]
    fn late_registrant_cannot_short_circuit_the_grace_period() {
        struct DropCounter<'a>(&'a AtomicUsize);
        impl Drop for DropCounter<'_> {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let qsbr = Qsbr::new();
        let g1 = qsbr.register();

        let freed = AtomicUsize::new(0);
        let ptr = Box::into_raw(Box::new(DropCounter(&freed)));
        unsafe { qsbr.retire(ptr) };

        // A brand-new thread joins after the retire, before anyone has
        // quiesced. If its record were stamped as already caught up at the
        // current epoch, `g1`'s quiescent call alone would free `ptr`.
        let g2 = qsbr.register();

        g1.quiescent();
        assert_eq!(
            freed.load(Ordering::Relaxed),
            0,
            "g2 has not quiesced since joining; the grace period must not complete yet"
        );

        g2.quiescent();
        assert_eq!(freed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unregister_stops_blocking_progress() {
        let qsbr = Qsbr::new();
        let g1 = qsbr.register();
        let g2 = qsbr.register();
        g1.quiescent();
        // g2 never quiesces; unregistering it must not leave epoch frozen
        // for g1 forever.
        g2.unregister();
        let e0 = qsbr.epoch();
        g1.quiescent();
        assert!(qsbr.epoch() > e0);
    }
}
