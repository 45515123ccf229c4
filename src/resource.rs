//! Resource handles: the reader/writer/closer abstraction every task's I/O
//! goes through
//!
//! Mirrors the `resource` triple from the reference kernel's USB character
//! device: a handful of function pointers plus an opaque environment
//! pointer, guarded by a semaphore, rather than a trait object — the same
//! hand-rolled-vtable shape used throughout that codebase for device
//! polymorphism.

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use core::ptr::NonNull;

use crate::config;
use crate::kernel_panic;
use crate::sync::Semaphore;

/// A reader pulls up to `buf.len()` bytes from the device into `buf`,
/// returning the number actually read.
pub type ReaderFn = fn(env: Option<NonNull<()>>, buf: &mut [u8]) -> usize;

/// A writer pushes `buf` to the device, returning the number of bytes
/// actually accepted.
pub type WriterFn = fn(env: Option<NonNull<()>>, buf: &[u8]) -> usize;

/// A closer releases whatever `env` refers to. Called exactly once, when
/// the last handle referencing this resource is closed.
pub type CloserFn = fn(env: Option<NonNull<()>>);

fn null_reader(_env: Option<NonNull<()>>, _buf: &mut [u8]) -> usize {
    kernel_panic!("resource: read on an unopened/default device");
}

fn null_writer(_env: Option<NonNull<()>>, _buf: &[u8]) -> usize {
    kernel_panic!("resource: write on an unopened/default device");
}

fn null_closer(_env: Option<NonNull<()>>) {}

/// A device, addressable only through its handle-table slot.
///
/// The default (`Resource::null()`) reader/writer deliberately panic on
/// use: an uninitialized handle slot should never be read from or written
/// to, and failing loudly catches a "forgot to open a real device" bug
/// immediately instead of silently discarding I/O.
pub struct Resource {
    reader: ReaderFn,
    writer: WriterFn,
    closer: CloserFn,
    env: Option<NonNull<()>>,
    lock: Semaphore,
}

impl Resource {
    pub const fn null() -> Self {
        Resource {
            reader: null_reader,
            writer: null_writer,
            closer: null_closer,
            env: None,
            lock: Semaphore::new(),
        }
    }

    pub fn new(
        reader: ReaderFn,
        writer: WriterFn,
        closer: CloserFn,
        env: Option<NonNull<()>>,
    ) -> Self {
        Resource {
            reader,
            writer,
            closer,
            env,
            lock: Semaphore::new(),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> usize {
        self.lock.lock();
        let n = (self.reader)(self.env, buf);
        self.lock.unlock();
        n
    }

    pub fn write(&self, buf: &[u8]) -> usize {
        self.lock.lock();
        let n = (self.writer)(self.env, buf);
        self.lock.unlock();
        n
    }

    fn close(&self) {
        (self.closer)(self.env);
    }
}

/// Per-task table of open resource handles.
///
/// Indices `[0, top_rd)` are either empty or hold a live resource owned by
/// this task; `top_rd` only ever grows when a new slot past the current
/// high-water mark is claimed.
pub struct ResourceTable {
    slots: [Option<NonNull<Resource>>; config::RESOURCE_TABLE_SIZE],
    top_rd: usize,
}

/// A handle into a [`ResourceTable`]: a small integer index.
pub type Handle = usize;

impl ResourceTable {
    pub(crate) const fn new() -> Self {
        ResourceTable {
            slots: [None; config::RESOURCE_TABLE_SIZE],
            top_rd: 0,
        }
    }

    /// Register `resource` at the lowest free slot, bumping `top_rd` if
    /// needed. Returns `None` if the table is full.
    pub fn open(&mut self, resource: NonNull<Resource>) -> Option<Handle> {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(resource);
                if idx >= self.top_rd {
                    self.top_rd = idx + 1;
                }
                return Some(idx);
            }
        }
        None
    }

    pub fn get(&self, handle: Handle) -> Option<NonNull<Resource>> {
        self.slots.get(handle).copied().flatten()
    }

    pub fn read(&self, handle: Handle, buf: &mut [u8]) -> Option<usize> {
        let resource = self.get(handle)?;
        Some(unsafe { resource.as_ref() }.read(buf))
    }

    pub fn write(&self, handle: Handle, buf: &[u8]) -> Option<usize> {
        let resource = self.get(handle)?;
        Some(unsafe { resource.as_ref() }.write(buf))
    }

    /// Close the slot, running the resource's closer. A no-op (returns
    /// `false`) if the slot was already empty.
    pub fn close(&mut self, handle: Handle) -> bool {
        let Some(slot) = self.slots.get_mut(handle) else {
            return false;
        };
        match slot.take() {
            Some(resource) => {
                unsafe { resource.as_ref() }.close();
                true
            }
            None => false,
        }
    }

    /// Close every open slot. Called once by `task_exit`.
    pub(crate) fn close_all(&mut self) {
        for idx in 0..self.top_rd {
            self.close(idx);
        }
    }
}

/// Register `resource` in the current task's handle table at the lowest
/// free slot. Returns `None` if the table is full.
pub fn open(resource: NonNull<Resource>) -> Option<Handle> {
    let mut task = crate::sched::current_task();
    unsafe { task.as_mut() }.resources_mut().open(resource)
}

/// Read from `handle` in the current task's handle table. `None` if the
/// handle is not open.
pub fn read(handle: Handle, buf: &mut [u8]) -> Option<usize> {
    let task = crate::sched::current_task();
    unsafe { task.as_ref() }.resources().read(handle, buf)
}

/// Write to `handle` in the current task's handle table. `None` if the
/// handle is not open.
pub fn write(handle: Handle, buf: &[u8]) -> Option<usize> {
    let task = crate::sched::current_task();
    unsafe { task.as_ref() }.resources().write(handle, buf)
}

/// Close `handle` in the current task's handle table, running its closer.
/// A no-op (returns `false`) if the handle was already closed.
pub fn close(handle: Handle) -> bool {
    let mut task = crate::sched::current_task();
    unsafe { task.as_mut() }.resources_mut().close(handle)
}

/// Read a single byte from the current task's registered stdin handle.
/// `None` if the task has no stdin registered, or the device had nothing
/// to offer.
pub fn getc() -> Option<u8> {
    let task = crate::sched::current_task();
    let handle = unsafe { task.as_ref() }.stdin()?;
    let mut buf = [0u8; 1];
    match read(handle, &mut buf) {
        Some(1) => Some(buf[0]),
        _ => None,
    }
}

/// A `core::fmt::Write` adapter over the current task's stdout handle, for
/// use by [`printf`].
struct Stdout;

impl core::fmt::Write for Stdout {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let task = crate::sched::current_task();
        let handle = unsafe { task.as_ref() }
            .stdout()
            .unwrap_or_else(|| kernel_panic!("resource: printf with no stdout registered"));
        write(handle, s.as_bytes());
        Ok(())
    }
}

/// Write formatted text to the current task's registered stdout handle.
/// Called through the [`crate::printf`] macro rather than directly, the
/// same way `core::fmt::Arguments` backs `print!`/`println!`.
///
/// Fatal if the task has no stdout registered: an uninitialized stdio
/// handle should never be written through, the same logic as
/// `Resource::null`'s panic-on-use default.
pub fn printf(args: core::fmt::Arguments) {
    use core::fmt::Write;
    let _ = Stdout.write_fmt(args);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_reader(env: Option<NonNull<()>>, buf: &mut [u8]) -> usize {
        let counter = env.unwrap().cast::<u32>();
        let value = unsafe { *counter.as_ref() };
        if let Some(slot) = buf.first_mut() {
            *slot = value as u8;
            1
        } else {
            0
        }
    }

    fn noop_writer(_env: Option<NonNull<()>>, buf: &[u8]) -> usize {
        buf.len()
    }

    #[test]
    fn open_assigns_lowest_free_slot_and_bumps_top_rd() {
        let mut table = ResourceTable::new();
        let mut counter: u32 = 42;
        let counter_ptr = NonNull::from(&mut counter).cast::<()>();
        let mut resource = Resource::new(counting_reader, noop_writer, null_closer, Some(counter_ptr));
        let handle = table.open(NonNull::from(&mut resource)).unwrap();
        assert_eq!(handle, 0);

        let mut buf = [0u8; 1];
        assert_eq!(table.read(handle, &mut buf), Some(1));
        assert_eq!(buf[0], 42);
    }

    #[test]
    fn close_runs_closer_exactly_once() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static CLOSES: AtomicU32 = AtomicU32::new(0);
        fn counting_closer(_env: Option<NonNull<()>>) {
            CLOSES.fetch_add(1, Ordering::Relaxed);
        }

        let mut table = ResourceTable::new();
        let mut resource = Resource::new(null_reader, noop_writer, counting_closer, None);
        let handle = table.open(NonNull::from(&mut resource)).unwrap();

        assert!(table.close(handle));
        assert_eq!(CLOSES.load(Ordering::Relaxed), 1);
        // closing an already-closed slot is a no-op, not a second call
        assert!(!table.close(handle));
        assert_eq!(CLOSES.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn table_reports_full_once_all_slots_taken() {
        let mut table = ResourceTable::new();
        let mut resources: std::vec::Vec<Resource> = (0..config::RESOURCE_TABLE_SIZE)
            .map(|_| Resource::new(null_reader, noop_writer, null_closer, None))
            .collect();
        for resource in resources.iter_mut() {
            assert!(table.open(NonNull::from(resource)).is_some());
        }
        let mut overflow = Resource::new(null_reader, noop_writer, null_closer, None);
        assert!(table.open(NonNull::from(&mut overflow)).is_none());
    }
}

// End of File
