//! Single-producer/multi-consumer broadcast buffer (SPMC, overwriting).
//!
//! Publishers append fixed-capacity messages into a ring of `D` slots
//! (`D` a power of two); when the ring fills, the oldest message is
//! dropped, never the newest. Subscribers remember their own read
//! position and scan forward, treating a slot whose tag no longer matches
//! their expected position as a dropped message rather than an error.
//!
//! Slots hold a tagged reference `(tag = publish position, index = message
//! offset in the backing [`Pool`])`. `head` and `tail` are independent
//! monotonic counters with `head <= tail` and `tail - head <= D` at all
//! times. Only the low 32 bits of a slot's publish position are stored (see
//! [`crate::tagged`]); comparisons between a slot's tag and the live
//! `head`/`tail` use wrapping sequence-number arithmetic, which is exact as
//! long as `head` and `tail` never drift more than `i32::MAX` apart — true
//! here since they are always within `D` of each other and `D` is a
//! caller-chosen ring depth, never remotely close to that bound.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::backoff::Backoff;
use crate::errors::{Error, Result};
use crate::pool::Pool;
use crate::tagged::{AtomicTagged, Tagged};

/// Extra pool slots over the ring's own `depth`, so a publisher can always
/// `acquire` a slot for the message it is about to write *before* it drops
/// the oldest one to make room, matching `original_source/broadcast/broadcast.c`'s
/// `#define ESTIMATED_PUBLISHERS 16` (`pool_elts = depth + ESTIMATED_PUBLISHERS`).
/// Sizing the pool at exactly `depth` would starve `publish`: once the ring
/// is full, all `depth` pool slots are checked out, so the `acquire` at the
/// top of `publish` would fail before control ever reached the drop-head
/// step below.
const ESTIMATED_PUBLISHERS: u32 = 16;

struct Message<const MAX: usize> {
    size: u64,
    payload: [u8; MAX],
}

/// True if `a` is at or after `b` in wrapping sequence-number order.
#[inline]
fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// True if `a` is strictly after `b` in wrapping sequence-number order.
#[inline]
fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// A single-producer/multi-consumer broadcast buffer over `MAX`-byte
/// messages.
pub struct Broadcast<const MAX: usize> {
    pool: Pool<Message<MAX>>,
    slots: Box<[AtomicTagged]>,
    mask: u64,
    head: AtomicU64,
    tail: AtomicU64,
}

impl<const MAX: usize> Broadcast<MAX> {
    /// Build a broadcast buffer with `depth` slots (must be a power of two)
    /// and room for `depth` in-flight messages in the backing pool.
    pub fn new(depth: u32) -> Result<Self> {
        if depth < 2 || !depth.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        let slots = (0..depth)
            .map(|_| AtomicTagged::new(Tagged::null()))
            .collect();
        Ok(Self {
            pool: Pool::new(depth + ESTIMATED_PUBLISHERS)?,
            slots,
            mask: (depth - 1) as u64,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        })
    }

    /// Publish `data`. Fails with [`Error::InvalidArgument`] if `data` is
    /// larger than `MAX`, or [`Error::Exhausted`] if the backing pool has no
    /// free message slot. The pool is over-provisioned by
    /// [`ESTIMATED_PUBLISHERS`] beyond the ring's own `depth` precisely so
    /// this acquire — which happens *before* the loop below drops the
    /// oldest message to make room — has a slot to take even when the ring
    /// is already full; `Exhausted` is only reachable under far more
    /// concurrent in-flight publishers than that headroom accounts for, and
    /// is reported rather than retried internally.
    pub fn publish(&self, data: &[u8]) -> Result<()> {
        if data.len() > MAX {
            return Err(Error::InvalidArgument);
        }
        let mut payload = [0u8; MAX];
        payload[..data.len()].copy_from_slice(data);
        let handle = self.pool.acquire(Message {
            size: data.len() as u64,
            payload,
        })?;
        let msg_index = handle.index();
        // Dropping the handle here is fine: `Handle` carries no `Drop`
        // cleanup, the pool slot stays checked out until we explicitly
        // release it by raw index below.
        drop(handle);

        let mut backoff = Backoff::new();
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);
            let idx = (tail & self.mask) as usize;
            let slot = &self.slots[idx];
            let current = slot.load(Ordering::Acquire);
            let tail32 = tail as u32;

            if !current.is_null() && current.tag() == tail32 {
                // A previous attempt at this exact position already landed;
                // someone else finished our work. Advance and retry fresh.
                let _ = self.tail.compare_exchange(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                backoff.spin();
                continue;
            }
            if !current.is_null() && seq_gt(current.tag(), tail32) {
                // A concurrent publisher already advanced past this slot.
                backoff.spin();
                continue;
            }

            // Any occupant left at this point is the oldest live message
            // (tag < tail, in [head, tail) by the ring invariant) and must
            // be dropped to make room.
            let dropping = !current.is_null();
            if dropping {
                let _ = self.head.compare_exchange(
                    head,
                    head.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }

            let new_ref = Tagged::make(tail32, msg_index);
            if slot.cas_weak(current, new_ref) {
                let _ = self.tail.compare_exchange(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                if dropping {
                    // Only now — after the slot's tagged reference has
                    // moved to the new message — is it safe to release the
                    // old one. A subscriber still holding `current`'s index
                    // always re-reads the slot before trusting its copy
                    // (see `Subscription::next`) and will observe the tag
                    // change here and discard, so it never dereferences a
                    // pool entry we are about to free.
                    // SAFETY: `current.index()` was checked out by a prior
                    // publish and has just been atomically unpublished.
                    unsafe {
                        let _: Message<MAX> = self.pool.release_index(current.index());
                    }
                }
                return Ok(());
            }
            backoff.spin();
        }
    }

    /// A received message: the byte count actually published and a copy of
    /// the payload bytes.
    pub fn begin(&self) -> Subscription<'_, MAX> {
        Subscription {
            broadcast: self,
            sub_idx: self.head.load(Ordering::Acquire),
            drops: 0,
        }
    }
}

/// A message delivered by [`Subscription::next`].
pub struct Received<const MAX: usize> {
    size: usize,
    payload: [u8; MAX],
}

impl<const MAX: usize> Received<MAX> {
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.payload[..self.size]
    }
}

/// A subscriber's forward-scanning cursor into a [`Broadcast`].
pub struct Subscription<'a, const MAX: usize> {
    broadcast: &'a Broadcast<MAX>,
    sub_idx: u64,
    drops: u64,
}

impl<'a, const MAX: usize> Subscription<'a, MAX> {
    /// Number of messages this subscriber has counted as dropped so far.
    #[inline]
    pub fn drops(&self) -> u64 {
        self.drops
    }

    /// Read the next message, if one is available.
    ///
    /// Returns `None` only when the subscriber has caught up to the
    /// publisher (nothing new has been published yet) — not when a message
    /// was dropped, which is instead counted and skipped transparently.
    pub fn next(&mut self) -> Option<Received<MAX>> {
        loop {
            let tail = self.broadcast.tail.load(Ordering::Acquire);
            if self.sub_idx >= tail {
                return None;
            }

            let idx = (self.sub_idx & self.broadcast.mask) as usize;
            let slot = &self.broadcast.slots[idx];
            let before = slot.load(Ordering::Acquire);
            let expected_tag = self.sub_idx as u32;

            if before.is_null() || before.tag() != expected_tag {
                self.sub_idx = self.sub_idx.wrapping_add(1);
                self.drops += 1;
                continue;
            }

            let size;
            let mut payload = [0u8; MAX];
            {
                // SAFETY: `before.index()` was published before our load
                // above and has not yet been released — see the re-read
                // below, which would have caught a concurrent release.
                let msg = unsafe { self.broadcast.pool.get_index(before.index()) };
                size = msg.size as usize;
                payload[..size].copy_from_slice(&msg.payload[..size]);
            }

            let after = slot.load(Ordering::Acquire);
            if after != before {
                // The slot changed mid-copy: discard and retry the same
                // position, which will now either see the new occupant or
                // (on our next loop iteration) be recognized as dropped.
                continue;
            }

            self.sub_idx = self.sub_idx.wrapping_add(1);
            return Some(Received { size, payload });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_slot_ring_drops_every_prior_message() {
        let bc: Broadcast<8> = Broadcast::new(2).unwrap();
        bc.publish(b"one").unwrap();
        bc.publish(b"two").unwrap();
        bc.publish(b"three").unwrap();

        let mut sub = bc.begin();
        // At least "three" must survive; earlier messages may have been
        // dropped depending on how far behind this subscription started.
        let mut last = None;
        while let Some(msg) = sub.next() {
            last = Some(msg.bytes().to_vec());
        }
        assert_eq!(last.as_deref(), Some(&b"three"[..]));
    }

    #[test]
    fn head_never_exceeds_tail_and_gap_is_bounded() {
        let bc: Broadcast<8> = Broadcast::new(4).unwrap();
        for i in 0..20u8 {
            bc.publish(&[i]).unwrap();
            let head = bc.head.load(Ordering::Acquire);
            let tail = bc.tail.load(Ordering::Acquire);
            assert!(head <= tail);
            assert!(tail - head <= 4);
        }
    }

    #[test]
    fn subscriber_reports_received_plus_drops_equals_total() {
        let bc: Broadcast<8> = Broadcast::new(4).unwrap();
        let mut sub = bc.begin();
        let total = 100u64;
        for i in 0..total {
            bc.publish(&(i as u32).to_le_bytes()).unwrap();
        }
        let mut received = 0u64;
        let mut last_seen: Option<u32> = None;
        while let Some(msg) = sub.next() {
            let value = u32::from_le_bytes(msg.bytes().try_into().unwrap());
            if let Some(prev) = last_seen {
                assert!(value > prev);
            }
            last_seen = Some(value);
            received += 1;
        }
        assert_eq!(received + sub.drops(), total);
    }

    #[test]
    fn publish_over_max_size_is_rejected() {
        let bc: Broadcast<4> = Broadcast::new(2).unwrap();
        assert_eq!(
            bc.publish(b"too long").unwrap_err(),
            Error::InvalidArgument
        );
    }

    #[test]
    fn non_power_of_two_depth_is_rejected() {
        let result: Result<Broadcast<4>> = Broadcast::new(3);
        assert_eq!(result.unwrap_err(), Error::InvalidArgument);
    }

}
