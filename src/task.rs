//! Holds the [`Task`] type and methods

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use core::cell::Cell;
use core::ptr::NonNull;

use crate::list::{IntrusiveNode, Link, List};
use crate::resource::{Handle, ResourceTable};
use crate::sync::Mutex;

/// The function signature for our task entry functions.
///
/// Unlike the reference scheduler's `fn() -> !`, a task entry function may
/// return normally: the initial stack frame's `LR` points at a small
/// trampoline that calls [`crate::sched::task_exit`], so returning from
/// `entry_fn` has the same effect as calling [`crate::task_abort`].
pub type TaskEntryFn = fn();

/// Where a task currently sits in its lifecycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum TaskState {
    Ready,
    Running,
    BlockedOnMutex,
    Sleeping,
    Zombie,
}

/// Represents a task that the scheduler is managing.
pub struct Task {
    /// Stable, small integer identity used in diagnostics.
    id: u32,
    /// The stack pointer for our task.
    ///
    /// This is the value taken from PSP when a task is suspended, and is
    /// therefore the value to put back into PSP when the task is resumed.
    ///
    /// When a task is suspended, the callee-saved register state should be
    /// the first thing found above this pointer.
    stack: Cell<*mut u32>,
    /// Base of the stack region, as returned by the kernel arena. Needed at
    /// `task_exit` to free the allocation.
    stack_base: NonNull<u8>,
    /// The function to call when the task first starts.
    entry_fn: TaskEntryFn,
    /// Base priority this task was created with.
    base_priority: u8,
    /// Effective priority: `base_priority` plus any donation currently in
    /// effect. Always `>= base_priority`.
    effective_priority: Cell<u8>,
    /// `0` for an aperiodic task; otherwise the wakeup period in ticks.
    period_ticks: u32,
    /// Next tick at which a periodic task should re-enter the ready queue.
    next_wake: Cell<u32>,
    /// Current lifecycle state.
    state: Cell<TaskState>,
    /// The mutex this task is blocked on, if `state == BlockedOnMutex`.
    blocked_on: Cell<Option<NonNull<Mutex>>>,
    /// Mutexes currently held by this task, used to release everything on
    /// exit and to walk donation chains.
    held_locks: List<Mutex>,
    /// Link used for exactly one of: the ready queue bucket, the periodic
    /// list, or a mutex's wait queue — a task is only ever a member of one
    /// of these at a time.
    wait_link: Link<Task>,
    /// Handle table for this task's open resources.
    resources: ResourceTable,
    /// This task's standard input, output, and error handles, if any have
    /// been registered. `None` until whatever opened the underlying device
    /// (a driver-registration framework, out of this kernel's scope) calls
    /// `set_stdin`/`set_stdout`/`set_stderr` with a handle already `open`ed
    /// into `resources`.
    stdin: Cell<Option<Handle>>,
    stdout: Cell<Option<Handle>>,
    stderr: Cell<Option<Handle>>,
}

impl IntrusiveNode for Task {
    fn link(&self) -> &Link<Self> {
        &self.wait_link
    }
}

impl Task {
    /// Minimum usable stack, in bytes: space for the full exception frame
    /// plus the callee-saved registers we push ourselves, plus headroom.
    pub const MIN_STACK_SIZE: usize = (4 * 16) + 8;

    /// The value of the Processor Status Register when a task starts.
    ///
    /// The only bit we need to set is the T bit, to indicate that the task
    /// should run in Thumb mode (the only supported mode on Armv7-M).
    pub(crate) const DEFAULT_CPSR: u32 = 1 << 24;

    /// The offset, in bytes, to the `stack` field — where the PendSV
    /// trampoline saves and restores a suspended task's stack pointer.
    pub(crate) const STACK_OFFSET: usize = core::mem::offset_of!(Task, stack);

    /// Build a new task descriptor. The stack has already been allocated
    /// from the kernel arena and its initial exception frame already pushed
    /// by the caller (the scheduler, in `new_task`).
    pub(crate) fn new(
        id: u32,
        entry_fn: TaskEntryFn,
        stack_base: NonNull<u8>,
        initial_sp: *mut u32,
        priority: u8,
        period_ticks: u32,
    ) -> Task {
        Task {
            id,
            stack: Cell::new(initial_sp),
            stack_base,
            entry_fn,
            base_priority: priority,
            effective_priority: Cell::new(priority),
            period_ticks,
            next_wake: Cell::new(0),
            state: Cell::new(TaskState::Ready),
            blocked_on: Cell::new(None),
            held_locks: List::new(),
            wait_link: Link::new(),
            resources: ResourceTable::new(),
            stdin: Cell::new(None),
            stdout: Cell::new(None),
            stderr: Cell::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Get the initial entry function for this task.
    pub(crate) const fn entry_fn(&self) -> TaskEntryFn {
        self.entry_fn
    }

    /// Get the current stack pointer for this task.
    pub(crate) fn stack(&self) -> *mut u32 {
        self.stack.get()
    }

    /// Set the current stack pointer for this task.
    ///
    /// # Safety
    ///
    /// The task will execute using the stack given, so it must point to the
    /// last item in a valid Arm EABI stack, with a full exception frame
    /// proceeding it.
    pub(crate) unsafe fn set_stack(&self, new_stack: *mut u32) {
        self.stack.set(new_stack);
    }

    pub(crate) fn stack_base(&self) -> NonNull<u8> {
        self.stack_base
    }

    pub fn base_priority(&self) -> u8 {
        self.base_priority
    }

    pub fn priority(&self) -> u8 {
        self.effective_priority.get()
    }

    pub fn is_periodic(&self) -> bool {
        self.period_ticks != 0
    }

    pub(crate) fn period_ticks(&self) -> u32 {
        self.period_ticks
    }

    pub(crate) fn next_wake(&self) -> u32 {
        self.next_wake.get()
    }

    pub(crate) fn set_next_wake(&self, tick: u32) {
        self.next_wake.set(tick);
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.set(state);
    }

    pub(crate) fn blocked_on(&self) -> Option<NonNull<Mutex>> {
        self.blocked_on.get()
    }

    pub(crate) fn set_blocked_on(&self, mutex: Option<NonNull<Mutex>>) {
        self.blocked_on.set(mutex);
    }

    pub(crate) fn held_locks(&self) -> &List<Mutex> {
        &self.held_locks
    }

    pub(crate) fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    pub(crate) fn resources_mut(&mut self) -> &mut ResourceTable {
        &mut self.resources
    }

    pub fn stdin(&self) -> Option<Handle> {
        self.stdin.get()
    }

    pub fn set_stdin(&self, handle: Handle) {
        self.stdin.set(Some(handle));
    }

    pub fn stdout(&self) -> Option<Handle> {
        self.stdout.get()
    }

    pub fn set_stdout(&self, handle: Handle) {
        self.stdout.set(Some(handle));
    }

    pub fn stderr(&self) -> Option<Handle> {
        self.stderr.get()
    }

    pub fn set_stderr(&self, handle: Handle) {
        self.stderr.set(Some(handle));
    }

    /// Raise this task's effective priority if `donated` is higher than
    /// what it currently has in effect. Donation only ever raises, never
    /// lowers — lowering happens in [`Task::undonate`], which recomputes
    /// from scratch.
    pub(crate) fn donate(&self, donated: u8) {
        if donated > self.effective_priority.get() {
            self.effective_priority.set(donated);
        }
    }

    /// Recompute effective priority from `base_priority` plus the highest
    /// priority among tasks still waiting on any mutex this task holds.
    /// Called on release/abandon of a mutex, so a dropped donation doesn't
    /// linger.
    pub(crate) fn undonate(&self) {
        let mut highest = self.base_priority;
        let mut cur = self.held_locks.front();
        while let Some(mutex_ptr) = cur {
            let mutex = unsafe { mutex_ptr.as_ref() };
            if let Some(waiter) = mutex.highest_waiter_priority() {
                highest = highest.max(waiter);
            }
            cur = mutex.link().next();
        }
        self.effective_priority.set(highest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_starts_ready_with_base_priority() {
        let mut stack_mem = [0u8; 256];
        let base = NonNull::new(stack_mem.as_mut_ptr()).unwrap();
        let sp = unsafe { base.as_ptr().add(256) } as *mut u32;
        let task = Task::new(1, || loop {}, base, sp, 7, 0);
        assert_eq!(task.state(), TaskState::Ready);
        assert_eq!(task.priority(), 7);
        assert_eq!(task.base_priority(), 7);
        assert!(!task.is_periodic());
    }

    #[test]
    fn donate_raises_but_never_lowers_effective_priority() {
        let mut stack_mem = [0u8; 256];
        let base = NonNull::new(stack_mem.as_mut_ptr()).unwrap();
        let sp = unsafe { base.as_ptr().add(256) } as *mut u32;
        let task = Task::new(1, || loop {}, base, sp, 3, 0);

        task.donate(10);
        assert_eq!(task.priority(), 10);

        task.donate(5);
        assert_eq!(task.priority(), 10);
    }
}

// End of File
