//! Fixed-capacity object pool.
//!
//! A lock-free LIFO free-list over a fixed-size arena. The free-list head is
//! a [`Tagged`] reference so that a popped-and-repushed element is
//! distinguishable from one that was never touched (ABA safety), per
//! `TaggedRef`'s release-stamps-a-fresh-tag invariant.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::backoff::Backoff;
use crate::errors::{Error, Result};
use crate::tagged::{AtomicTagged, Tagged};

struct Cell<T> {
    /// Valid only while the element is on the free list.
    next: Tagged,
    value: MaybeUninit<T>,
}

/// A fixed-capacity lock-free pool of `T`.
pub struct Pool<T> {
    arena: Box<[UnsafeCell<Cell<T>>]>,
    head: AtomicTagged,
    next_tag: AtomicU32,
    in_use: AtomicU32,
}

// SAFETY: access to each arena slot is serialized by the free-list CAS;
// a slot is either reachable from exactly one place (the free list) or
// held exclusively by whichever caller popped it.
unsafe impl<T: Send> Send for Pool<T> {}
unsafe impl<T: Send> Sync for Pool<T> {}

/// A handle to an in-use pool element.
///
/// Carries the element's arena index so that [`Pool::release`] can push it
/// back onto the free list without a linear search.
pub struct Handle<T> {
    index: u32,
    _marker: core::marker::PhantomData<T>,
}

impl<T> Handle<T> {
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl<T> Pool<T> {
    /// Build a pool with `count` free elements, all chained into the free
    /// list in index order.
    pub fn new(count: u32) -> Result<Self> {
        if count == 0 {
            return Err(Error::InvalidArgument);
        }

        let arena: Box<[UnsafeCell<Cell<T>>]> = (0..count)
            .map(|_| {
                UnsafeCell::new(Cell {
                    next: Tagged::null(),
                    value: MaybeUninit::uninit(),
                })
            })
            .collect();

        let pool = Self {
            arena,
            head: AtomicTagged::new(Tagged::null()),
            next_tag: AtomicU32::new(1),
            in_use: AtomicU32::new(0),
        };

        // Chain every element into the free list, as the public contract
        // describes: release is used during initialization to push each one.
        for i in 0..count {
            // SAFETY: single-threaded constructor, no concurrent access yet.
            unsafe {
                pool.push_free(i);
            }
        }

        Ok(pool)
    }

    /// Total number of elements in the arena.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.arena.len()
    }

    /// Number of elements currently checked out.
    #[inline]
    pub fn in_use(&self) -> u32 {
        self.in_use.load(Ordering::Relaxed)
    }

    unsafe fn push_free(&self, index: u32) {
        let mut backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            (*self.arena[index as usize].get()).next = head;
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            let new_head = Tagged::make(tag, index);
            if self.head.cas_weak(head, new_head) {
                return;
            }
            backoff.spin();
        }
    }

    /// Pop the head of the free list and initialize it with `value`.
    ///
    /// Fails with [`Error::Exhausted`] only if the free list is empty.
    pub fn acquire(&self, value: T) -> Result<Handle<T>> {
        let mut backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return Err(Error::Exhausted);
            }

            // SAFETY: `head.index()` was published by a previous release and
            // cannot be reused until our CAS below (or a competitor's)
            // swaps the head away from it.
            let next = unsafe { (*self.arena[head.index() as usize].get()).next };

            if self.head.cas_weak(head, next) {
                self.in_use.fetch_add(1, Ordering::Relaxed);
                // SAFETY: we own this slot exclusively now.
                unsafe {
                    (*self.arena[head.index() as usize].get())
                        .value
                        .write(value);
                }
                return Ok(Handle {
                    index: head.index(),
                    _marker: core::marker::PhantomData,
                });
            }

            backoff.spin();
        }
    }

    /// Read the value held by `handle` without removing it from use.
    #[inline]
    pub fn get(&self, handle: &Handle<T>) -> &T {
        // SAFETY: the handle's owner holds it exclusively until released.
        unsafe { (*self.arena[handle.index as usize].get()).value.assume_init_ref() }
    }

    /// Read the value at a raw arena index, bypassing [`Handle`].
    ///
    /// Used by callers (the broadcast buffer, the hash map) that stash a
    /// bare `u32` index inside their own tagged reference instead of
    /// holding onto a [`Handle`].
    ///
    /// # Safety
    ///
    /// `index` must denote a slot currently checked out (acquired and not
    /// yet released).
    #[inline]
    pub unsafe fn get_index(&self, index: u32) -> &T {
        (*self.arena[index as usize].get()).value.assume_init_ref()
    }

    /// Release a raw arena index back to the free list, stamping a fresh
    /// tag, returning the value it held.
    ///
    /// # Safety
    ///
    /// `index` must denote a slot currently checked out exactly once; the
    /// caller must not use `index` again until it is reacquired.
    #[inline]
    pub unsafe fn release_index(&self, index: u32) -> T {
        let value = core::mem::replace(
            &mut (*self.arena[index as usize].get()).value,
            MaybeUninit::uninit(),
        )
        .assume_init();
        self.push_free(index);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        value
    }

    /// Release `handle` back to the free list, stamping a fresh tag.
    pub fn release(&self, handle: Handle<T>) -> T {
        let index = handle.index;
        core::mem::forget(handle);

        // SAFETY: we exclusively owned this slot until this call.
        let value = unsafe {
            core::mem::replace(
                &mut (*self.arena[index as usize].get()).value,
                MaybeUninit::uninit(),
            )
            .assume_init()
        };

        // SAFETY: slot is no longer referenced by any handle.
        unsafe {
            self.push_free(index);
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        value
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        // The free list only threads together the *unused* slots; whatever
        // index isn't reachable from it is still checked out and holds a
        // live `T` that must be dropped explicitly (`MaybeUninit` does not
        // drop on its own). `&mut self`: no concurrent acquire/release can
        // be racing this walk.
        let mut free = alloc::vec![false; self.arena.len()];
        let mut current = self.head.load(Ordering::Relaxed);
        while !current.is_null() {
            let idx = current.index() as usize;
            free[idx] = true;
            // SAFETY: `&mut self`, so this traversal races nothing.
            current = unsafe { (*self.arena[idx].get()).next };
        }
        for (idx, free) in free.into_iter().enumerate() {
            if !free {
                // SAFETY: not reachable from the free list, so this slot is
                // still checked out and holds an initialized `T`.
                unsafe {
                    (*self.arena[idx].get()).value.assume_init_drop();
                }
            }
        }
    }
}
