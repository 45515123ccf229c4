//! Shared deque and shared memory: cross-task producer/consumer primitives
//!
//! Both are thin compositions of primitives defined elsewhere: the shared
//! deque is an intrusive [`List`] guarded by a [`Semaphore`]; shared memory
//! is a [`Ring`] plus a `Semaphore` plus a reference count. This mirrors how
//! the reference kernel's `shared_deq_test.c` and the IPC shared-memory test
//! compose `LIST_ELEMENT` / semaphores rather than inventing new locking.

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use core::cell::Cell;
use core::ptr::NonNull;

use crate::list::{IntrusiveNode, List};
use crate::ring::Ring;
use crate::sync::Semaphore;

/// A deque shared between producers and consumers, guarded by a semaphore.
///
/// `pop` never blocks: an empty deque returns `None` immediately, matching
/// `__sdeq_pop`'s non-blocking contract in the reference implementation.
pub struct SharedDeque<T: IntrusiveNode> {
    list: List<T>,
    lock: Semaphore,
}

impl<T: IntrusiveNode> SharedDeque<T> {
    pub const fn new() -> Self {
        SharedDeque {
            list: List::new(),
            lock: Semaphore::new(),
        }
    }

    /// Append `node` to the tail.
    ///
    /// # Safety
    ///
    /// `node` must not already be linked into this or any other list
    /// sharing the same `Link<T>` field, and must outlive its membership.
    pub unsafe fn add(&self, node: NonNull<T>) {
        self.lock.lock();
        unsafe { self.list.push_back(node) };
        self.lock.unlock();
    }

    /// Pop the head, or `None` if the deque is currently empty.
    pub fn pop(&self) -> Option<NonNull<T>> {
        self.lock.lock();
        let node = unsafe { self.list.pop_front() };
        self.lock.unlock();
        node
    }
}

/// A named ring buffer shared by however many tasks currently hold it open.
///
/// Reads block (by yielding) while the ring is empty; writes are lossy,
/// dropping bytes once the ring fills, matching the documented policy for
/// shared-memory IPC resources.
pub struct SharedMemory<const N: usize> {
    ring: Ring<N>,
    lock: Semaphore,
    refcount: Cell<u32>,
}

// SAFETY: `refcount` is only ever mutated under `lock`.
unsafe impl<const N: usize> Sync for SharedMemory<N> {}

impl<const N: usize> SharedMemory<N> {
    pub const fn new() -> Self {
        SharedMemory {
            ring: Ring::new(),
            lock: Semaphore::new(),
            refcount: Cell::new(0),
        }
    }

    /// Register a new handle onto this shared-memory region.
    pub fn open(&self) {
        self.lock.lock();
        self.refcount.set(self.refcount.get() + 1);
        self.lock.unlock();
    }

    /// Drop a handle. Returns `true` if this was the last one (the caller
    /// is then responsible for any higher-level teardown, since the ring
    /// and semaphore themselves need no explicit reclamation in Rust).
    pub fn close(&self) -> bool {
        self.lock.lock();
        let remaining = self.refcount.get().saturating_sub(1);
        self.refcount.set(remaining);
        self.lock.unlock();
        remaining == 0
    }

    /// Read up to `buf.len()` bytes, blocking (by yielding) while the ring
    /// is empty.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        loop {
            self.lock.lock();
            let is_empty = unsafe { self.ring.is_empty() };
            if !is_empty {
                let n = unsafe { self.ring.read(buf) };
                self.lock.unlock();
                return n;
            }
            self.lock.unlock();
            crate::sched::yield_if_possible();
        }
    }

    /// Write as many bytes from `data` as fit; excess bytes are dropped.
    /// Returns the number of bytes actually written.
    pub fn write(&self, data: &[u8]) -> usize {
        self.lock.lock();
        let n = unsafe { self.ring.write(data) };
        self.lock.unlock();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        value: u32,
        link: crate::list::Link<Item>,
    }

    impl Item {
        fn new(value: u32) -> Self {
            Item {
                value,
                link: crate::list::Link::new(),
            }
        }
    }

    impl IntrusiveNode for Item {
        fn link(&self) -> &crate::list::Link<Self> {
            &self.link
        }
    }

    #[test]
    fn drain_in_fifo_order_with_two_consumers() {
        let deque: SharedDeque<Item> = SharedDeque::new();
        let a = Item::new(1);
        let b = Item::new(2);
        let c = Item::new(3);

        unsafe {
            deque.add(NonNull::from(&a));
            deque.add(NonNull::from(&b));
            deque.add(NonNull::from(&c));
        }

        let first = unsafe { deque.pop().unwrap().as_ref() }.value;
        let second = unsafe { deque.pop().unwrap().as_ref() }.value;
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        let third = unsafe { deque.pop().unwrap().as_ref() }.value;
        assert_eq!(third, 3);
        assert!(deque.pop().is_none());
    }

    #[test]
    fn shared_memory_refcount_reaches_zero_after_matching_closes() {
        let shm: SharedMemory<16> = SharedMemory::new();
        shm.open();
        shm.open();
        assert!(!shm.close());
        assert!(shm.close());
    }

    #[test]
    fn shared_memory_write_then_read_roundtrip() {
        let shm: SharedMemory<16> = SharedMemory::new();
        assert_eq!(shm.write(b"hello"), 5);
        let mut out = [0u8; 5];
        assert_eq!(shm.read(&mut out), 5);
        assert_eq!(&out, b"hello");
    }
}

// End of File
