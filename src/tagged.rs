//! Tagged-reference primitives.
//!
//! A tagged reference is a pair `(tag, value)` that is compared and
//! exchanged atomically as one unit, so that a lock-free structure can tell
//! a stale read apart from a reused value (the ABA problem). `core` has no
//! stable 128-bit atomic type, so this crate packs `(tag: u32, index: u32)`
//! into a single `AtomicU64`: `value` is always an arena index here, never a
//! raw pointer, and every arena this crate addresses (pool, broadcast slots,
//! timer free list) stays well under `u32::MAX` elements. `tag` wraps at
//! 2^32, which is large enough that wrap-around within any realistic program
//! lifetime would require on the order of four billion releases of the
//! *same* slot.
//!
//! ABA safety invariant: every release stamps a strictly greater tag, so a
//! reused index reappears with a tag the old CAS can no longer match.

use core::sync::atomic::{AtomicU64, Ordering};

/// Sentinel index meaning "no value" (a null tagged reference).
pub const NULL_INDEX: u32 = u32::MAX;

/// An immutable snapshot of a tagged reference: `(tag, index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tagged {
    tag: u32,
    index: u32,
}

impl Tagged {
    /// Build a tagged reference from its parts.
    #[inline]
    pub const fn make(tag: u32, index: u32) -> Self {
        Self { tag, index }
    }

    /// The null tagged reference: no index, tag zero.
    #[inline]
    pub const fn null() -> Self {
        Self {
            tag: 0,
            index: NULL_INDEX,
        }
    }

    /// True if this reference carries no index.
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.index == NULL_INDEX
    }

    #[inline]
    pub const fn tag(&self) -> u32 {
        self.tag
    }

    #[inline]
    pub const fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    const fn pack(self) -> u64 {
        ((self.tag as u64) << 32) | (self.index as u64)
    }

    #[inline]
    const fn unpack(bits: u64) -> Self {
        Self {
            tag: (bits >> 32) as u32,
            index: bits as u32,
        }
    }
}

/// Equality on tagged references compares both tag and index: two references
/// to the same index but different tags are distinct, by design.
#[inline]
pub fn equal(a: Tagged, b: Tagged) -> bool {
    a == b
}

/// An atomically updatable tagged reference.
#[repr(transparent)]
pub struct AtomicTagged(AtomicU64);

impl AtomicTagged {
    #[inline]
    pub const fn new(initial: Tagged) -> Self {
        Self(AtomicU64::new(initial.pack()))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> Tagged {
        Tagged::unpack(self.0.load(order))
    }

    #[inline]
    pub fn store(&self, value: Tagged, order: Ordering) {
        self.0.store(value.pack(), order);
    }

    /// A single 128-bit-equivalent compare-and-swap: both tag and index must
    /// match `expected` for the swap to succeed.
    #[inline]
    pub fn cas(&self, expected: Tagged, new: Tagged) -> bool {
        self.0
            .compare_exchange(
                expected.pack(),
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Weak variant of [`Self::cas`], suitable for use inside a retry loop
    /// that already re-reads on failure.
    #[inline]
    pub fn cas_weak(&self, expected: Tagged, new: Tagged) -> bool {
        self.0
            .compare_exchange_weak(
                expected.pack(),
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Raw packed-`u64` compare-and-swap, exposed for callers that already have
/// packed bit patterns (e.g. a value restored from a snapshot).
#[inline]
pub fn u64_cas(target: &AtomicU64, expected: u64, new: u64) -> bool {
    target
        .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Acquire fence, re-exported for call sites that only need the fence and
/// not a full load.
#[inline]
pub fn fence_acquire() {
    crate::pr::fence_acquire();
}

/// Release fence.
#[inline]
pub fn fence_release() {
    crate::pr::fence_release();
}

/// Spin-wait pause hint.
#[inline]
pub fn pause() {
    crate::pr::stall();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_has_no_index() {
        assert!(Tagged::null().is_null());
        assert!(!Tagged::make(1, 0).is_null());
    }

    #[test]
    fn equal_compares_both_fields() {
        assert!(equal(Tagged::make(3, 7), Tagged::make(3, 7)));
        assert!(!equal(Tagged::make(3, 7), Tagged::make(4, 7)));
        assert!(!equal(Tagged::make(3, 7), Tagged::make(3, 8)));
    }

    #[test]
    fn cas_fails_on_stale_tag() {
        let slot = AtomicTagged::new(Tagged::make(1, 5));
        // Same index, wrong tag: must fail even though index matches.
        assert!(!slot.cas(Tagged::make(0, 5), Tagged::make(2, 6)));
        assert!(slot.cas(Tagged::make(1, 5), Tagged::make(2, 6)));
        assert_eq!(slot.load(Ordering::Acquire), Tagged::make(2, 6));
    }

    #[test]
    fn round_trip_through_atomic_storage() {
        let slot = AtomicTagged::new(Tagged::null());
        assert!(slot.load(Ordering::Acquire).is_null());
        slot.store(Tagged::make(9, 42), Ordering::Release);
        let loaded = slot.load(Ordering::Acquire);
        assert_eq!(loaded.tag(), 9);
        assert_eq!(loaded.index(), 42);
    }
}
