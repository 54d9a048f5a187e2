//! Sequence counter (seqlock).
//!
//! This module provides a sequence counter for implementing seqlocks,
//! which allow readers to detect when a write has occurred during their read.
//!
//! # Usage
//!
//! Writers increment the sequence at the start and end of a write.
//! Readers check that the sequence is even and unchanged after reading.
//!
//! ```
//! use concur_core::sequence::Sequence;
//!
//! let seq = Sequence::new();
//!
//! // Writer
//! seq.write_begin();
//! // ... modify shared data ...
//! seq.write_end();
//!
//! // Reader
//! loop {
//!     let s1 = seq.read_begin();
//!     // ... read shared data ...
//!     if seq.read_retry(s1) {
//!         continue; // A write occurred, retry
//!     }
//!     break;
//! }
//! ```

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// A sequence counter for seqlock implementation.
#[repr(C)]
pub struct Sequence {
    counter: AtomicUsize,
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence {
    /// Create a new sequence counter initialized to 0.
    #[inline]
    pub const fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    /// Get the current sequence value.
    #[inline]
    pub fn read(&self) -> usize {
        self.counter.load(Ordering::Acquire)
    }

    /// Begin a read-side critical section.
    ///
    /// Returns the current sequence number. If it's odd, a write is in progress.
    #[inline]
    pub fn read_begin(&self) -> usize {
        loop {
            let seq = self.counter.load(Ordering::Acquire);
            if seq & 1 == 0 {
                return seq;
            }
            crate::pr::stall();
        }
    }

    /// Check if a retry is needed after reading.
    ///
    /// Returns `true` if the sequence changed (write occurred), meaning
    /// the read should be retried.
    #[inline]
    pub fn read_retry(&self, start: usize) -> bool {
        crate::pr::fence_acquire();
        self.counter.load(Ordering::Relaxed) != start
    }

    /// Begin a write-side critical section.
    ///
    /// Increments the sequence to an odd number, indicating a write is in progress.
    #[inline]
    pub fn write_begin(&self) {
        let seq = self.counter.fetch_add(1, Ordering::Release);
        debug_assert!(seq & 1 == 0, "nested write_begin");
    }

    /// End a write-side critical section.
    ///
    /// Increments the sequence to an even number, indicating the write is complete.
    #[inline]
    pub fn write_end(&self) {
        let seq = self.counter.fetch_add(1, Ordering::Release);
        debug_assert!(seq & 1 == 1, "write_end without write_begin");
    }

    /// Perform a complete write sequence.
    ///
    /// Convenience method that calls `write_begin`, executes the closure,
    /// then calls `write_end`.
    #[inline]
    pub fn write<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.write_begin();
        let result = f();
        self.write_end();
        result
    }

    /// Perform a read with automatic retry.
    ///
    /// Calls the closure repeatedly until a consistent read is achieved.
    #[inline]
    pub fn read_with<F, R>(&self, mut f: F) -> R
    where
        F: FnMut() -> R,
        R: Copy,
    {
        loop {
            let seq = self.read_begin();
            let result = f();
            if !self.read_retry(seq) {
                return result;
            }
        }
    }
}

// Sequence is Send + Sync
unsafe impl Send for Sequence {}
unsafe impl Sync for Sequence {}

/// Copy `size_of::<T>()` bytes from `src` to `dst` using relaxed atomic
/// loads/stores instead of a plain `memcpy`.
///
/// A plain load or store racing with a concurrent plain store on the same
/// memory is a data race and immediate UB under the Rust memory model, even
/// if the bytes involved are never inspected — `core::ptr::read_volatile`
/// does not help, since "volatile" only constrains compiler reordering, not
/// concurrent-access races. Routing every byte through an atomic access
/// with `Relaxed` ordering makes a concurrent writer's in-progress update
/// merely a *torn* read rather than undefined behavior; the seqlock's
/// sequence check around the call is what turns that torn read into a
/// detected, retried failure rather than a value the caller ever trusts.
///
/// Copies in `usize`-sized chunks when both pointers happen to already be
/// `usize`-aligned (always true here, since `src`/`dst` are a [`Seqlock`]'s
/// `UnsafeCell<T>` and a same-`T`-typed local, which share `T`'s natural
/// alignment), falling back to byte-sized atomics for any unaligned
/// remainder so the copy is sound for every `T` regardless of its size.
///
/// # Safety
/// `src` must be valid to read and `dst` valid to write for
/// `size_of::<T>()` bytes, non-overlapping, for the duration of the call.
#[inline]
unsafe fn atomic_copy<T>(src: *const T, dst: *mut T) {
    let len = core::mem::size_of::<T>();
    let src = src as *const u8;
    let dst = dst as *mut u8;
    let word = core::mem::size_of::<usize>();
    let word_aligned = word > 0 && (src as usize) % word == 0 && (dst as usize) % word == 0;

    let mut i = 0;
    if word_aligned {
        while i + word <= len {
            // SAFETY: in bounds per the caller contract; alignment checked
            // above.
            unsafe {
                let s = &*(src.add(i) as *const AtomicUsize);
                let d = &*(dst.add(i) as *const AtomicUsize);
                d.store(s.load(Ordering::Relaxed), Ordering::Relaxed);
            }
            i += word;
        }
    }
    while i < len {
        // SAFETY: in bounds per the caller contract; `AtomicU8` has no
        // alignment requirement beyond 1.
        unsafe {
            let s = &*(src.add(i) as *const AtomicU8);
            let d = &*(dst.add(i) as *const AtomicU8);
            d.store(s.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        i += 1;
    }
}

/// A seqlock-protected payload of arbitrary `Copy` type.
///
/// Readers proceed optimistically: they snapshot the sequence, copy the
/// payload word-by-word with relaxed atomic loads (so a writer racing
/// underneath is never observed as a data race, only as a torn read the
/// caller detects and retries), then re-check the sequence. Writers take
/// the seqlock for exclusive access and write through the same word-by-word
/// relaxed atomic stores, which is what makes the reader's concurrent
/// word-by-word loads sound in the first place — concurrent writers must
/// still serialize externally (the writer side is single-writer), matching
/// `spec.md` §4.10.
pub struct Seqlock<T> {
    seq: Sequence,
    payload: core::cell::UnsafeCell<T>,
}

// SAFETY: all access to `payload` goes through the word-by-word atomic
// copy helper above, gated by `seq`; never a plain unsynchronized load or
// store.
unsafe impl<T: Send> Send for Seqlock<T> {}
unsafe impl<T: Send> Sync for Seqlock<T> {}

impl<T: Copy> Seqlock<T> {
    /// Wrap `initial` in a new seqlock.
    #[inline]
    pub const fn new(initial: T) -> Self {
        Self {
            seq: Sequence::new(),
            payload: core::cell::UnsafeCell::new(initial),
        }
    }

    /// Overwrite the payload. Only one writer may call this at a time.
    pub fn write(&self, value: T) {
        self.seq.write_begin();
        // SAFETY: `write_begin` has claimed exclusive writer access; no
        // reader dereferences `payload` directly, only through the
        // word-by-word atomic copy, which is exactly what makes a
        // concurrent reader's racing loads here well-defined (a torn read
        // detected by the sequence check, not a data race).
        unsafe {
            atomic_copy(&value as *const T, self.payload.get());
        }
        self.seq.write_end();
    }

    /// Read the payload, retrying until a consistent (non-torn) copy is
    /// observed.
    pub fn read(&self) -> T {
        loop {
            let before = self.seq.read_begin();
            let mut copy = core::mem::MaybeUninit::<T>::uninit();
            // SAFETY: a concurrent writer may be mid-`write` here; every
            // byte is read through `atomic_copy`'s relaxed atomic loads, so
            // racing with the writer's atomic stores is a torn read, never
            // a data race — we only ever return a copy proven untorn by the
            // sequence check below.
            unsafe {
                atomic_copy(self.payload.get() as *const T, copy.as_mut_ptr());
            }
            if !self.seq.read_retry(before) {
                // SAFETY: every byte of `copy` was written by `atomic_copy`
                // above.
                return unsafe { copy.assume_init() };
            }
        }
    }
}

#[cfg(test)]
mod seqlock_tests {
    use super::*;

    #[test]
    fn read_after_write_returns_the_written_value() {
        let lock = Seqlock::new([0u8; 23]);
        let mut msg = [0u8; 23];
        msg.copy_from_slice(b"Mary had a little lamb");
        lock.write(msg);
        assert_eq!(lock.read(), msg);
    }

    #[test]
    fn write_does_not_disturb_bytes_outside_the_payload() {
        #[derive(Clone, Copy, PartialEq, Eq, Debug)]
        #[repr(C)]
        struct Framed {
            payload: [u8; 23],
            sentinel: u8,
        }
        let lock = Seqlock::new(Framed {
            payload: [0u8; 23],
            sentinel: 0xAA,
        });
        let mut msg = [0u8; 23];
        msg.copy_from_slice(b"Mary had a little lamb");
        lock.write(Framed {
            payload: msg,
            sentinel: 0xAA,
        });
        let got = lock.read();
        assert_eq!(got.payload, msg);
        assert_eq!(got.sentinel, 0xAA);
    }

    #[test]
    fn round_trips_without_a_concurrent_writer() {
        let lock = Seqlock::new(123u64);
        assert_eq!(lock.read(), 123);
        lock.write(456);
        assert_eq!(lock.read(), 456);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let seq = Sequence::new();
        assert_eq!(seq.read(), 0);
    }

    #[test]
    fn test_write_sequence() {
        let seq = Sequence::new();

        seq.write_begin();
        assert_eq!(seq.read(), 1); // Odd during write

        seq.write_end();
        assert_eq!(seq.read(), 2); // Even after write
    }

    #[test]
    fn test_read_begin_waits_for_write() {
        let seq = Sequence::new();

        // Complete write should work
        seq.write_begin();
        seq.write_end();

        let s = seq.read_begin();
        assert_eq!(s, 2);
        assert!(!seq.read_retry(s));
    }

    #[test]
    fn test_read_retry_detects_write() {
        let seq = Sequence::new();

        let s1 = seq.read_begin();
        seq.write_begin();
        seq.write_end();

        assert!(seq.read_retry(s1));
    }

    #[test]
    fn test_write_closure() {
        let seq = Sequence::new();
        let result = seq.write(|| {
            assert_eq!(seq.read() & 1, 1); // Odd during write
            42
        });
        assert_eq!(result, 42);
        assert_eq!(seq.read(), 2);
    }

    #[test]
    fn test_read_with() {
        let seq = Sequence::new();
        let counter = core::sync::atomic::AtomicUsize::new(0);

        let result = seq.read_with(|| {
            counter.fetch_add(1, Ordering::Relaxed);
            42
        });

        assert_eq!(result, 42);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
}
