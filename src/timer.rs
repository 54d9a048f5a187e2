//! Hierarchical/flat timer wheel with a single-sweep expiration pass.
//!
//! Grounded on `lf_timer.c`: a flat `expirations` array indexed by timer id
//! holds either [`INVALID_TICK`] (inactive) or the tick at which the timer
//! fires. [`TimerWheel::alloc`] pops a lock-free free list guarded by a
//! [`crate::tagged::Tagged`] `(tag, head index)` pair for ABA safety
//! ([`TimerWheel::free`] pushes back the same way). [`TimerWheel::set`]
//! writes the expiration with release ordering (so data the caller
//! associated with the timer, e.g. inside its callback's captured state, is
//! visible to the callback once it runs) and folds the new expiration into
//! `earliest` via a fetch-min CAS loop. [`TimerWheel::expire`] snapshots
//! `current`, resets `earliest`, fences store-before-load, then sweeps every
//! allocated entry up to the high watermark, CASing each expired entry to
//! `INVALID_TICK` with acquire ordering before invoking its callback — a
//! losing CAS means some other thread reset the timer concurrently, and
//! that thread is responsible for folding the new expiration into
//! `earliest` itself.
//!
//! Single-writer precondition (documented, not enforced, exactly as
//! `spec.md` requires): [`TimerWheel::expire`] assumes only one thread ever
//! calls it at a time. `alloc`/`set`/`reset`/`cancel` may be called
//! concurrently with each other and with `expire`.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::backoff::Backoff;
use crate::errors::{Error, Result};
use crate::tagged::{AtomicTagged, Tagged};

/// Sentinel meaning "no expiration scheduled" (timer inactive).
pub const INVALID_TICK: u64 = u64::MAX;

/// Sentinel meaning "no timer" (allocation failed).
pub const NULL_TIMER: u32 = u32::MAX;

/// A single timer's callback, invoked as `(id, expired_tick)`.
pub type Callback = Box<dyn Fn(u32, u64) + Send + Sync>;

struct Slot {
    expiration: AtomicU64,
    callback: UnsafeCell<Option<Callback>>,
    /// Valid only while the slot is on the free list.
    free_next: Tagged,
}

/// A fixed-capacity, lock-free timer wheel.
///
/// Construct with the maximum number of simultaneously allocated timers;
/// unlike the original's `MAXTIMERS = 8192` process-wide static, capacity
/// is an explicit constructor argument per Design Notes' "eliminate
/// process-wide statics".
pub struct TimerWheel {
    slots: Box<[UnsafeCell<Slot>]>,
    free_head: AtomicTagged,
    next_tag: AtomicU32,
    high_watermark: AtomicU32,
    current: AtomicU64,
    earliest: AtomicU64,
}

// SAFETY: every slot is either on the free list (touched only under the
// free-list CAS) or owned exclusively by whichever caller's `alloc`
// returned its index, until that caller calls `free`. `expiration` and
// `callback` are read by `expire` only while the slot is allocated, and a
// losing `expire` CAS defers the update to whichever thread concurrently
// reset it.
unsafe impl Send for TimerWheel {}
unsafe impl Sync for TimerWheel {}

impl TimerWheel {
    /// Build a wheel with `capacity` timer slots, all initially free.
    pub fn new(capacity: u32) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument);
        }

        let slots: Box<[UnsafeCell<Slot>]> = (0..capacity)
            .map(|i| {
                // Chain slot `i` to slot `i + 1`; the last slot ends the
                // free list with `Tagged::null()`.
                let next = if i + 1 < capacity {
                    Tagged::make(0, i + 1)
                } else {
                    Tagged::null()
                };
                UnsafeCell::new(Slot {
                    expiration: AtomicU64::new(INVALID_TICK),
                    callback: UnsafeCell::new(None),
                    free_next: next,
                })
            })
            .collect();

        Ok(Self {
            slots,
            free_head: AtomicTagged::new(Tagged::make(0, 0)),
            next_tag: AtomicU32::new(1),
            high_watermark: AtomicU32::new(0),
            current: AtomicU64::new(0),
            earliest: AtomicU64::new(INVALID_TICK),
        })
    }

    /// Total number of timer slots.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    fn slot(&self, id: u32) -> &Slot {
        unsafe { &*self.slots[id as usize].get() }
    }

    /// Allocate a timer bound to `callback`, returning [`NULL_TIMER`] if the
    /// wheel is exhausted.
    pub fn alloc(&self, callback: Callback) -> u32 {
        let mut backoff = Backoff::new();
        let index = loop {
            let head = self.free_head.load(Ordering::Acquire);
            if head.is_null() {
                return NULL_TIMER;
            }
            let next = self.slot(head.index()).free_next;
            if self.free_head.cas_weak(head, next) {
                break head.index();
            }
            backoff.spin();
        };

        let slot = self.slot(index);
        slot.expiration.store(INVALID_TICK, Ordering::Relaxed);
        unsafe {
            *slot.callback.get() = Some(callback);
        }

        // Update the high watermark so `expire` knows how far to sweep.
        let mut hw = self.high_watermark.load(Ordering::Relaxed);
        while hw < index + 1 {
            match self.high_watermark.compare_exchange_weak(
                hw,
                index + 1,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => hw = observed,
            }
        }

        index
    }

    /// Free an inactive timer.
    ///
    /// Returns [`Error::BrokenInvariant`] if the timer is currently active
    /// (a programmer error, per `spec.md` §7) or [`Error::InvalidArgument`]
    /// if `id` was never allocated.
    pub fn free(&self, id: u32) -> Result<()> {
        if id >= self.high_watermark.load(Ordering::Acquire) {
            return Err(Error::InvalidArgument);
        }
        let slot = self.slot(id);
        if slot.expiration.load(Ordering::Acquire) != INVALID_TICK {
            return Err(Error::BrokenInvariant);
        }
        unsafe {
            *slot.callback.get() = None;
        }

        let mut backoff = Backoff::new();
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            // SAFETY: this slot is not reachable from anywhere else — it was
            // either never freed before (owned since `alloc`) or its
            // previous free-list link is irrelevant once it was reacquired.
            unsafe {
                (*self.slots[id as usize].get()).free_next = head;
            }
            let new_head = Tagged::make(tag, id);
            if self.free_head.cas_weak(head, new_head) {
                return Ok(());
            }
            backoff.spin();
        }
    }

    fn update_earliest(&self, candidate: u64) {
        let mut old = self.earliest.load(Ordering::Relaxed);
        while candidate < old {
            match self.earliest.compare_exchange_weak(
                old,
                candidate,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => old = observed,
            }
        }
    }

    fn update_expiration(&self, id: u32, exp: u64, require_active: bool) -> Result<()> {
        if exp == INVALID_TICK {
            return Err(Error::InvalidArgument);
        }
        if id >= self.high_watermark.load(Ordering::Acquire) {
            return Err(Error::InvalidArgument);
        }
        let slot = self.slot(id);
        let mut old = slot.expiration.load(Ordering::Relaxed);
        loop {
            let active = old != INVALID_TICK;
            if active != require_active {
                return Err(Error::InvalidArgument);
            }
            // Release: pairs with `expire`'s acquire CAS so the caller's
            // writes prior to `set`/`reset` are visible to the callback.
            match slot.expiration.compare_exchange_weak(
                old,
                exp,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => old = observed,
            }
        }
        self.update_earliest(exp);
        Ok(())
    }

    /// Activate an inactive timer to expire at tick `exp`.
    pub fn set(&self, id: u32, exp: u64) -> Result<()> {
        self.update_expiration(id, exp, false)
    }

    /// Re-arm an active timer to a new expiration.
    pub fn reset(&self, id: u32, exp: u64) -> Result<()> {
        self.update_expiration(id, exp, true)
    }

    /// Deactivate an active timer without invoking its callback.
    pub fn cancel(&self, id: u32) -> Result<()> {
        if id >= self.high_watermark.load(Ordering::Acquire) {
            return Err(Error::InvalidArgument);
        }
        let slot = self.slot(id);
        let mut old = slot.expiration.load(Ordering::Relaxed);
        loop {
            if old == INVALID_TICK {
                return Err(Error::InvalidArgument);
            }
            match slot.expiration.compare_exchange_weak(
                old,
                INVALID_TICK,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => old = observed,
            }
        }
    }

    /// Current tick. Time never runs backwards: see [`Self::tick_set`].
    pub fn tick_get(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Advance the current tick. A `tick` not strictly greater than the
    /// current one is ignored.
    pub fn tick_set(&self, tick: u64) {
        let mut old = self.current.load(Ordering::Relaxed);
        while tick > old {
            match self.current.compare_exchange_weak(
                old,
                tick,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => old = observed,
            }
        }
    }

    fn expire_one(&self, id: u32, now: u64) -> Option<u64> {
        let slot = self.slot(id);
        let mut exp = slot.expiration.load(Ordering::Relaxed);
        loop {
            if exp > now {
                return None;
            }
            // Acquire: pairs with `set`/`reset`'s release so the callback
            // observes the caller's writes made before arming the timer.
            match slot.expiration.compare_exchange_weak(
                exp,
                INVALID_TICK,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => exp = observed,
            }
        }
        let callback = unsafe { (*slot.callback.get()).as_ref() };
        if let Some(cb) = callback {
            cb(id, exp);
        }
        Some(exp)
    }

    /// Single-threaded precondition: sweep every allocated timer whose
    /// expiration is `<= current`, invoking its callback.
    pub fn expire(&self) {
        let now = self.current.load(Ordering::Relaxed);
        let earliest = self.earliest.load(Ordering::Relaxed);
        if earliest > now {
            return;
        }

        self.earliest.store(INVALID_TICK, Ordering::Relaxed);
        // StoreLoad: the reset above must be visible before we start
        // scanning, or a concurrent `set` landing between the reset and the
        // scan could have its `update_earliest` lost to this sweep's own
        // reset.
        core::sync::atomic::fence(Ordering::SeqCst);

        let hi = self.high_watermark.load(Ordering::Acquire);
        let mut next_earliest = INVALID_TICK;
        for id in 0..hi {
            let exp = self.slot(id).expiration.load(Ordering::Relaxed);
            if exp <= now {
                // `expire_one` returning `None` means a concurrent `set`/
                // `reset` won the race; that thread already folded its new
                // expiration into `earliest` itself.
                self.expire_one(id, now);
            } else {
                next_earliest = next_earliest.min(exp);
            }
        }
        self.update_earliest(next_earliest);
    }
}
