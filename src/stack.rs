//! Holds the [`Stack`] type: fixed-size, 8-byte-aligned static storage
//!
//! Task stacks themselves are now carved dynamically out of the kernel
//! arena (see [`crate::sched`]), but the arena itself has to live
//! somewhere: each arena's backing bytes are one `static Stack<N>`,
//! handed to [`crate::Kernel::init`] as a base pointer. The type keeps its
//! original name and alignment guarantee since both uses — a descending
//! call stack, or a buddy arena's backing region — need the same thing:
//! a large, 8-byte-aligned, statically-allocated byte array.

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::UnsafeCell;

/// `LEN` bytes of 8-byte-aligned static storage, as required by AAPCS for
/// a stack and convenient for a buddy arena besides.
///
/// The value of `LEN` must be a multiple of 4, which is checked with an
/// assert.
#[repr(align(8))]
pub struct Stack<const LEN: usize> {
    /// The memory reserved for the task stack
    contents: UnsafeCell<[u8; LEN]>,
}

impl<const LEN: usize> Stack<LEN> {
    /// Create a new stack
    pub const fn new() -> Self {
        assert!(LEN.is_multiple_of(4));
        Self {
            contents: UnsafeCell::new([0u8; LEN]),
        }
    }

    /// Get the top of the stack
    pub const fn top(&self) -> *mut u32 {
        // SAFETY: Pointing one past this object is allowed, as this is full
        // descending stack and we never write to the 'top' address - only
        // below it
        unsafe { self.contents.get().add(1) as *mut u32 }
    }

    /// Get the base (lowest address) of the region, for use as an arena's
    /// backing pointer.
    pub const fn base(&self) -> *mut u8 {
        self.contents.get() as *mut u8
    }
}

/// SAFETY: Our stack object only exposes pointers to itself, so is thread-safe
/// despite containing an `UnsafeCell`.
unsafe impl<const LEN: usize> Sync for Stack<LEN> {}

impl<const LEN: usize> Default for Stack<LEN> {
    fn default() -> Self {
        Stack::new()
    }
}

// End of File
