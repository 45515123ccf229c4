//! Compile-time kernel configuration
//!
//! Everything a port is expected to tune lives here, the same way the
//! scheduler keeps its own timing constants (`MIN_STACK_SIZE`,
//! `DEFAULT_CPSR`) next to the code that uses them rather than scattered
//! through the tree.

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

/// Smallest block order the kernel arena will ever hand out.
///
/// Smallest block = `2^KERNEL_MIN_ORDER` bytes, header included.
pub const KERNEL_MIN_ORDER: u8 = 5; // 32 bytes

/// Largest block order the kernel arena supports; this is also
/// `log2(KERNEL_ARENA_SIZE)`.
pub const KERNEL_MAX_ORDER: u8 = 16; // 64 KiB

/// Total size, in bytes, of the static region backing the kernel arena.
pub const KERNEL_ARENA_SIZE: usize = 1 << KERNEL_MAX_ORDER;

/// Smallest block order the user arena will ever hand out.
pub const USER_MIN_ORDER: u8 = 5; // 32 bytes

/// Largest block order the user arena supports.
pub const USER_MAX_ORDER: u8 = 15; // 32 KiB

/// Total size, in bytes, of the static region backing the user arena.
pub const USER_ARENA_SIZE: usize = 1 << USER_MAX_ORDER;

/// Largest single allocation `malloc` will service (excludes header).
pub const MM_MAX_USER_SIZE: usize = (1 << USER_MAX_ORDER) - MM_HEADER_SIZE;

/// Largest single allocation `kmalloc` will service (excludes header).
pub const MM_MAX_KERNEL_SIZE: usize = (1 << KERNEL_MAX_ORDER) - MM_HEADER_SIZE;

/// Tag stamped into every live heap node header. Any node reachable from a
/// free list or handed back to a caller whose header does not carry this
/// value indicates heap corruption.
pub const MM_MAGIC: u32 = 0xF4A5_0BED;

/// Size, in bytes, of the header that precedes every block (free or
/// allocated).
pub const MM_HEADER_SIZE: usize = core::mem::size_of::<crate::mm::Header>();

/// Number of resource handle slots in each task's handle table.
pub const RESOURCE_TABLE_SIZE: usize = 16;

/// Number of distinct priority buckets in the ready queue. A task's 8-bit
/// priority indexes directly into this array, so it must be 256.
pub const PRIORITY_LEVELS: usize = 256;

/// Priority assigned to the idle task; it is always the least urgent task
/// in the system.
pub const IDLE_TASK_PRIORITY: u8 = 0;

/// Default stack size, in bytes, for a task created without an explicit
/// size override.
pub const DEFAULT_TASK_STACK_SIZE: usize = 1024;

/// Maximum number of tasks the deadlock detector will walk through a
/// donation chain before concluding a cycle exists. Set to a value no
/// legitimate donation chain can reach.
pub const MAX_DONATION_CHAIN: usize = 64;

/// Capacity, in bytes, of each shared-memory resource's backing ring
/// buffer. Must be a power of two.
pub const SHARED_MEM_RING_SIZE: usize = 256;

// End of File
