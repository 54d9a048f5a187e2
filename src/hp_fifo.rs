//! Lock-free FIFO queue with hazard-pointer reclamation.
//!
//! A Michael–Scott queue: `head` and `tail` are `AtomicPtr`s into a singly
//! linked list that always carries at least one dummy node, so that
//! "empty" is `head.next == null` rather than `head == null` — the queue
//! never has to free the node a concurrent reader might still be
//! dereferencing just to detect emptiness.
//!
//! `enqueue` links the new node after the current tail (helping along any
//! producer that published `next` but hasn't yet swung `tail` itself, the
//! classic MS-queue helping step) and then advances `tail`. `dequeue_tid`
//! protects `head` with the caller's hazard slot, re-reads to confirm it
//! hasn't already moved, reads `head.next`, and CAS-advances `head` past
//! it; only the *old* head (now unreachable from any future traversal) is
//! handed to [`HpGuard::retire`] — the value it carried lived in the node
//! that becomes the new dummy, per the standard MS-queue trick of storing
//! a dequeued value in the node ahead of the one actually being freed.

use alloc::boxed::Box;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::backoff::Backoff;
use crate::hp::{HazardPointers, HpGuard};

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: MaybeUninit<T>,
}

impl<T> Node<T> {
    fn dummy() -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: MaybeUninit::uninit(),
        }))
    }
}

/// A lock-free, hazard-pointer-protected FIFO queue.
pub struct HpQueue<T> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
    hp: HazardPointers,
}

// `AtomicPtr<Node<T>>` is `Send`/`Sync` regardless of `T`, so without these
// explicit impls the compiler would auto-derive `HpQueue<T>: Send + Sync`
// for every `T` including ones that are not themselves `Send` — unsound,
// since `dequeue` moves a `T` out across whichever thread calls it.
unsafe impl<T: Send> Send for HpQueue<T> {}
unsafe impl<T: Send> Sync for HpQueue<T> {}

impl<T> HpQueue<T> {
    /// Create a new empty queue, seeded with its permanent dummy node.
    pub fn new() -> Self {
        let dummy = Node::dummy();
        Self {
            head: AtomicPtr::new(dummy),
            tail: AtomicPtr::new(dummy),
            hp: HazardPointers::new(),
        }
    }

    /// Register the calling thread for hazard-pointer-protected access.
    pub fn register(&self) -> HpQueueGuard<'_, T> {
        HpQueueGuard {
            queue: self,
            hp_guard: self.hp.register(),
        }
    }

    /// `true` if the queue currently holds no values (only the dummy node).
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        // SAFETY: `head` always points at a live node (the dummy, at
        // minimum) for the lifetime of the queue.
        unsafe { (*head).next.load(Ordering::Acquire).is_null() }
    }
}

impl<T> Default for HpQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for HpQueue<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no concurrent access; every node is
        // reachable from `head` exactly once.
        unsafe {
            let mut current = *self.head.get_mut();
            // The node at `head` is always the dummy: its `value` was
            // never initialized, so it must not be dropped.
            if !current.is_null() {
                let mut dummy = Box::from_raw(current);
                current = *dummy.next.get_mut();
            }
            while !current.is_null() {
                let mut node = Box::from_raw(current);
                let next = *node.next.get_mut();
                node.value.assume_init_drop();
                current = next;
            }
        }
    }
}

/// A thread's hazard-pointer-protected handle onto an [`HpQueue`].
pub struct HpQueueGuard<'a, T> {
    queue: &'a HpQueue<T>,
    hp_guard: HpGuard<'a>,
}

impl<'a, T> HpQueueGuard<'a, T> {
    /// Append `value` to the tail of the queue.
    pub fn enqueue(&self, value: T) {
        let new_node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: MaybeUninit::new(value),
        }));

        let mut backoff = Backoff::new();
        loop {
            let tail = self.queue.tail.load(Ordering::Acquire);
            self.hp_guard.protect(0, tail);
            if self.queue.tail.load(Ordering::Acquire) != tail {
                continue;
            }

            // SAFETY: `tail` was hazard-protected above and re-confirmed;
            // it cannot have been freed.
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if next.is_null() {
                // SAFETY: publishing `new_node` into `tail.next`; `new_node`
                // is fully initialized and not yet reachable from anywhere
                // else.
                let cas_ok = unsafe {
                    (*tail)
                        .next
                        .compare_exchange(
                            ptr::null_mut(),
                            new_node,
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                };
                if cas_ok {
                    let _ = self.queue.tail.compare_exchange(
                        tail,
                        new_node,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    self.hp_guard.clear(0);
                    return;
                }
            } else {
                // Help a stalled producer finish swinging tail forward.
                let _ = self.queue.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            }
            backoff.spin();
        }
    }

    /// Remove and return the value at the head of the queue, or `None` if
    /// empty.
    pub fn dequeue(&self) -> Option<T> {
        let mut backoff = Backoff::new();
        loop {
            let head = self.queue.head.load(Ordering::Acquire);
            self.hp_guard.protect(0, head);
            if self.queue.head.load(Ordering::Acquire) != head {
                backoff.spin();
                continue;
            }

            // SAFETY: `head` is hazard-protected and re-confirmed live.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if next.is_null() {
                self.hp_guard.clear(0);
                return None;
            }

            // SAFETY: `next` cannot be freed while `head` (its predecessor,
            // currently hazard-protected) has not itself been retired —
            // the queue only ever retires a node after CAS-advancing
            // `head` past it.
            let value = unsafe { (*next).value.as_ptr().read() };

            if self
                .queue
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                self.hp_guard.clear(0);
                // SAFETY: `head` is no longer reachable from the queue;
                // any reader still protecting it will be caught by the
                // hazard scan before this is freed.
                unsafe { self.hp_guard.retire(head) };
                return Some(value);
            }

            // Lost the CAS: another thread already advanced past `head`
            // and took this value. Forget our read to avoid a double
            // drop/use — the winner's copy is the one callers observe.
            core::mem::forget(value);
            backoff.spin();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_queue_is_empty() {
        let q: HpQueue<i32> = HpQueue::new();
        assert!(q.is_empty());
    }

    #[test]
    fn enqueue_dequeue_preserves_fifo_order() {
        let q: HpQueue<i32> = HpQueue::new();
        let guard = q.register();
        guard.enqueue(1);
        guard.enqueue(2);
        guard.enqueue(3);
        assert_eq!(guard.dequeue(), Some(1));
        assert_eq!(guard.dequeue(), Some(2));
        assert_eq!(guard.dequeue(), Some(3));
        assert_eq!(guard.dequeue(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn dummy_node_survives_empty_detection() {
        let q: HpQueue<i32> = HpQueue::new();
        let guard = q.register();
        guard.enqueue(42);
        assert!(!q.is_empty());
        assert_eq!(guard.dequeue(), Some(42));
        assert!(q.is_empty());
        // Queue must remain usable: the dummy node was never freed.
        guard.enqueue(7);
        assert_eq!(guard.dequeue(), Some(7));
    }
}
