//! Bounded MPMC ring with per-slot sequence numbers.
//!
//! Each cell carries a `sequence` counter alongside its payload. A producer
//! at enqueue index `i` may write cell `i & mask` only once `sequence ==
//! i`; after writing it stores `sequence = i + 1` with release so a
//! consumer can tell the cell apart from one that is still empty or still
//! in flight. A consumer at dequeue index `i` may read the same cell once
//! `sequence == i + 1`, and afterwards stores `sequence = i + capacity` to
//! hand the slot back to the next producer lap. Any other observed
//! `sequence` means a concurrent producer/consumer is mid-flight on that
//! cell: full/empty for the non-blocking caller, or transient contention
//! for the `{mp,mc}` modes, which retry the index CAS rather than the cell.
//!
//! [`RingMode`] selects, at construction, whether the producer side and
//! the consumer side each use a plain load+store index update (single
//! producer/single consumer — correct only with one live producer or
//! consumer thread, matching `spec.md`'s `LFRING_FLAG_{SP,MP,SC,MC}`) or a
//! CAS retry loop (multi producer/multi consumer).

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::backoff::Backoff;
use crate::errors::{Error, Result};

/// `Ok(())` on success; on failure, the error kind plus the value handed
/// back so the caller can retry or drop it, matching the C API's pattern
/// of returning the un-enqueued payload.
pub type EnqueueResult<T> = core::result::Result<(), (Error, T)>;

/// Producer/consumer arity, selected once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingMode {
    /// Single producer, single consumer: index updates are plain stores.
    SpSc,
    /// Single producer, multiple consumers.
    SpMc,
    /// Multiple producers, single consumer.
    MpSc,
    /// Multiple producers, multiple consumers: index updates are CAS loops.
    MpMc,
}

impl RingMode {
    #[inline]
    fn multi_producer(self) -> bool {
        matches!(self, RingMode::MpSc | RingMode::MpMc)
    }

    #[inline]
    fn multi_consumer(self) -> bool {
        matches!(self, RingMode::SpMc | RingMode::MpMc)
    }
}

struct Cell<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded, lock-free MPMC ring buffer of capacity `n` (a power of two,
/// `2 <= n <= 2^28`).
pub struct MpmcRing<T> {
    cells: Box<[Cell<T>]>,
    mask: usize,
    mode: RingMode,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

// SAFETY: each cell's payload is exclusively owned by whichever side
// currently holds the matching `sequence` value; `Cell::value` itself is
// never aliased across that handoff.
unsafe impl<T: Send> Send for MpmcRing<T> {}
unsafe impl<T: Send> Sync for MpmcRing<T> {}

impl<T> MpmcRing<T> {
    /// Build a ring of `n` slots in the given [`RingMode`].
    ///
    /// `n` must be `>= 2`, `<= 2^28`, and a power of two, per `spec.md`
    /// §4.4's `make_queue` contract.
    pub fn with_mode(n: usize, mode: RingMode) -> Result<Self> {
        if n < 2 || n > (1 << 28) || !n.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        let cells: Box<[Cell<T>]> = (0..n)
            .map(|i| Cell {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Ok(Self {
            cells,
            mask: n - 1,
            mode,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        })
    }

    /// Build an MPMC-mode ring (the common case, correct for any number of
    /// concurrent producers and consumers).
    pub fn new(n: usize) -> Result<Self> {
        Self::with_mode(n, RingMode::MpMc)
    }

    /// Total number of cells.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Attempt a single non-blocking enqueue.
    ///
    /// Returns [`Error::Exhausted`] if the ring is genuinely full,
    /// [`Error::Contention`] if a concurrent producer won the race for this
    /// slot (only possible in `{Mp}` modes; retry is the caller's choice).
    pub fn try_enqueue(&self, value: T) -> EnqueueResult<T> {
        if self.mode.multi_producer() {
            self.try_enqueue_mp(value)
        } else {
            self.try_enqueue_sp(value)
        }
    }

    fn try_enqueue_sp(&self, value: T) -> EnqueueResult<T> {
        let pos = self.enqueue_pos.load(Ordering::Relaxed);
        let cell = &self.cells[pos & self.mask];
        let seq = cell.sequence.load(Ordering::Acquire);
        if seq != pos {
            let err = if seq < pos { Error::Exhausted } else { Error::Contention };
            return Err((err, value));
        }
        // SAFETY: `sequence == pos` is only ever true for the producer
        // whose turn this cell currently is; single-producer mode has
        // exactly one.
        unsafe { (*cell.value.get()).write(value) };
        cell.sequence.store(pos + 1, Ordering::Release);
        self.enqueue_pos.store(pos + 1, Ordering::Relaxed);
        Ok(())
    }

    fn try_enqueue_mp(&self, value: T) -> EnqueueResult<T> {
        let pos = self.enqueue_pos.load(Ordering::Relaxed);
        let cell = &self.cells[pos & self.mask];
        let seq = cell.sequence.load(Ordering::Acquire);
        if seq != pos {
            let err = if seq < pos { Error::Exhausted } else { Error::Contention };
            return Err((err, value));
        }
        if self
            .enqueue_pos
            .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return Err((Error::Contention, value));
        }
        // SAFETY: the CAS above gave this thread exclusive ownership of
        // `pos`, and `sequence == pos` means no one else can hold it.
        unsafe { (*cell.value.get()).write(value) };
        cell.sequence.store(pos + 1, Ordering::Release);
        Ok(())
    }

    /// Attempt a single non-blocking dequeue.
    ///
    /// Returns [`Error::Empty`] if the ring has nothing ready,
    /// [`Error::Contention`] if a concurrent consumer won the race.
    pub fn try_dequeue(&self) -> Result<T> {
        if self.mode.multi_consumer() {
            self.try_dequeue_mc()
        } else {
            self.try_dequeue_sc()
        }
    }

    fn try_dequeue_sc(&self) -> Result<T> {
        let pos = self.dequeue_pos.load(Ordering::Relaxed);
        let cell = &self.cells[pos & self.mask];
        let seq = cell.sequence.load(Ordering::Acquire);
        let target = pos + 1;
        if seq != target {
            return Err(if seq < target {
                Error::Empty
            } else {
                Error::Contention
            });
        }
        // SAFETY: `sequence == pos + 1` means the producer's write at this
        // cell has been published and not yet reclaimed by another reader.
        let value = unsafe { (*cell.value.get()).assume_init_read() };
        cell.sequence.store(pos + self.capacity(), Ordering::Release);
        self.dequeue_pos.store(target, Ordering::Relaxed);
        Ok(value)
    }

    fn try_dequeue_mc(&self) -> Result<T> {
        let pos = self.dequeue_pos.load(Ordering::Relaxed);
        let cell = &self.cells[pos & self.mask];
        let seq = cell.sequence.load(Ordering::Acquire);
        let target = pos + 1;
        if seq != target {
            return Err(if seq < target {
                Error::Empty
            } else {
                Error::Contention
            });
        }
        if self
            .dequeue_pos
            .compare_exchange_weak(pos, target, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::Contention);
        }
        // SAFETY: the CAS above gave this thread exclusive ownership of
        // `pos`, and `sequence == pos + 1` means no one else can hold it.
        let value = unsafe { (*cell.value.get()).assume_init_read() };
        cell.sequence.store(pos + self.capacity(), Ordering::Release);
        Ok(value)
    }

    /// Enqueue, retrying through transient contention until the ring is
    /// either written to or genuinely full.
    pub fn enqueue(&self, mut value: T) -> EnqueueResult<T> {
        let mut backoff = Backoff::new();
        loop {
            match self.try_enqueue(value) {
                Ok(()) => return Ok(()),
                Err((Error::Contention, v)) => {
                    value = v;
                    backoff.spin();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Dequeue, retrying through transient contention until the ring
    /// yields a value or is genuinely empty.
    pub fn dequeue(&self) -> Result<T> {
        let mut backoff = Backoff::new();
        loop {
            match self.try_dequeue() {
                Ok(v) => return Ok(v),
                Err(Error::Contention) => backoff.spin(),
                Err(e) => return Err(e),
            }
        }
    }
}

impl<T> Drop for MpmcRing<T> {
    fn drop(&mut self) {
        let mut pos = *self.dequeue_pos.get_mut();
        let tail = *self.enqueue_pos.get_mut();
        while pos != tail {
            let cell = &mut self.cells[pos & self.mask];
            // SAFETY: `&mut self`, and every position in
            // `[dequeue_pos, enqueue_pos)` was written by `enqueue` and not
            // yet taken by `dequeue`, so it still holds a live value.
            unsafe {
                cell.value.get_mut().assume_init_drop();
            }
            pos = pos.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn dropping_a_ring_with_pending_values_drops_each_of_them() {
        use alloc::rc::Rc;

        let marker = Rc::new(());
        let ring: MpmcRing<Rc<()>> = MpmcRing::new(4).unwrap();
        ring.enqueue(marker.clone()).unwrap();
        ring.enqueue(marker.clone()).unwrap();
        drop(ring.dequeue().unwrap());
        assert_eq!(Rc::strong_count(&marker), 2);
        drop(ring);
        // The one value left enqueued must be dropped along with the ring.
        assert_eq!(Rc::strong_count(&marker), 1);
    }

    #[test]
    fn sequence_after_k_round_trips_matches_the_invariant() {
        let ring: MpmcRing<u64> = MpmcRing::new(4).unwrap();
        for k in 0..10u64 {
            ring.enqueue(k).unwrap();
            assert_eq!(ring.dequeue().unwrap(), k);
        }
    }

    #[test]
    fn fills_to_capacity_then_reports_exhausted() {
        let ring: MpmcRing<u32> = MpmcRing::new(2).unwrap();
        assert!(ring.try_enqueue(1).is_ok());
        assert!(ring.try_enqueue(2).is_ok());
        match ring.try_enqueue(3) {
            Err((Error::Exhausted, 3)) => {}
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[test]
    fn dequeue_on_empty_ring_reports_empty() {
        let ring: MpmcRing<u32> = MpmcRing::new(2).unwrap();
        assert_eq!(ring.try_dequeue().unwrap_err(), Error::Empty);
    }

    #[test]
    fn non_power_of_two_capacity_rejected() {
        assert_eq!(
            MpmcRing::<u8>::new(3).unwrap_err(),
            Error::InvalidArgument
        );
    }

    #[test]
    fn capacity_one_is_rejected_two_is_minimum() {
        assert_eq!(
            MpmcRing::<u8>::new(1).unwrap_err(),
            Error::InvalidArgument
        );
        assert!(MpmcRing::<u8>::new(2).is_ok());
    }

    #[test]
    fn fifo_order_is_preserved_under_single_thread() {
        let ring: MpmcRing<u32> = MpmcRing::new(8).unwrap();
        for i in 0..8 {
            ring.enqueue(i).unwrap();
        }
        let mut out = Vec::new();
        while let Ok(v) = ring.try_dequeue() {
            out.push(v);
        }
        assert_eq!(out, (0..8).collect::<Vec<_>>());
    }
}

