//! Contains the [`Scheduler`] type
//!
//! Generalizes the reference scheduler's round-robin `task_list` into a
//! priority-driven ready queue (one intrusive FIFO per priority level plus
//! a bitmap for O(1) highest-nonempty lookup) and a periodic-wakeup list,
//! while keeping its exact PendSV/SysTick shape: a `Scheduler` object with
//! a known, `repr(C)` field layout, located through one global pointer, so
//! that the free-standing exception handlers can find it without going
//! through any Rust-level indirection.

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::config;
use crate::kernel_panic;
use crate::list::{IntrusiveNode, List};
use crate::stack_pusher::StackPusher;
use crate::sync::Mutex;
use crate::task::{Task, TaskEntryFn, TaskState};

mod ready_queue;
use ready_queue::ReadyQueue;

/// A pre-emptive, priority-driven task-switching scheduler.
///
/// The Arm hardware pushes `{CPSR, PC, LR, R12, R3, R2, R1, R0}` to PSP when
/// an exception occurs. We then push the rest (`R11` to `R4`) ourselves, in
/// the PendSV trampoline in the crate root.
#[repr(C)]
pub struct Scheduler {
    /// Which task is currently running.
    current_task: Cell<Option<NonNull<Task>>>,
    /// Which task should PendSV switch to next.
    next_task: Cell<Option<NonNull<Task>>>,
    /// Monotonic tick counter, advanced by the SysTick handler.
    ticks: AtomicU32,
    /// Tasks ready to run right now, bucketed by effective priority.
    ready: ReadyQueue,
    /// Tasks sleeping until their next period.
    periodic: List<Task>,
    /// The always-runnable, lowest-priority filler task.
    idle_task: Cell<Option<NonNull<Task>>>,
    /// A task `task_exit` has switched away from but whose stack and record
    /// are not yet freed. Reclaiming them has to wait until some other,
    /// still-live context is provably running — see `reap_zombie`.
    zombie: Cell<Option<NonNull<Task>>>,
    /// Count of tasks not in `Zombie` state.
    total_tasks: AtomicUsize,
    /// Next task id to hand out.
    next_id: AtomicU32,
    /// Set once by `start`; used to tell bootstrap-time single-threaded
    /// allocation from steady-state task-switching allocation.
    started: AtomicBool,
}

/// SAFETY: every field is only mutated from inside `crate::critical::free`
/// (or, for the atomics, via atomic operations), the same discipline the
/// reference scheduler applies to its own `task_list`/`current_task`.
unsafe impl Sync for Scheduler {}

impl Scheduler {
    /// The offset, in bytes, to the `current_task` field.
    pub(crate) const CURRENT_TASK_OFFSET: usize = core::mem::offset_of!(Scheduler, current_task);

    /// The offset, in bytes, to the `next_task` field.
    pub(crate) const NEXT_TASK_OFFSET: usize = core::mem::offset_of!(Scheduler, next_task);

    pub(crate) const fn new() -> Scheduler {
        Scheduler {
            current_task: Cell::new(None),
            next_task: Cell::new(None),
            ticks: AtomicU32::new(0),
            ready: ReadyQueue::new(),
            periodic: List::new(),
            idle_task: Cell::new(None),
            zombie: Cell::new(None),
            total_tasks: AtomicUsize::new(0),
            next_id: AtomicU32::new(0),
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    pub fn now(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn total_tasks(&self) -> usize {
        self.total_tasks.load(Ordering::Relaxed)
    }

    /// Allocate a task record and stack from the kernel arena, build its
    /// initial exception frame, and make it runnable.
    ///
    /// `period_ticks == 0` means aperiodic: the task joins the ready queue
    /// immediately. Otherwise it joins the periodic list with
    /// `next_wake = now + period_ticks`.
    ///
    /// Returns `None` on kernel-arena exhaustion.
    pub fn new_task(
        &self,
        entry_fn: TaskEntryFn,
        priority: u8,
        period_ticks: u32,
        stack_size: usize,
    ) -> Option<NonNull<Task>> {
        let stack_size = stack_size.max(Task::MIN_STACK_SIZE);
        let stack_base = crate::mm::kmalloc(stack_size)?;
        let task_mem = match crate::mm::kmalloc(core::mem::size_of::<Task>()) {
            Some(mem) => mem,
            None => {
                unsafe { crate::mm::kfree(stack_base) };
                return None;
            }
        };

        let stack_top = unsafe { stack_base.as_ptr().add(stack_size) } as *mut u32;
        let mut pusher = unsafe { StackPusher::new(stack_top) };
        pusher.push(Task::DEFAULT_CPSR);
        pusher.push(entry_fn as usize as u32);
        pusher.push(task_exit_trampoline as usize as u32); // LR
        pusher.push(0); // R12
        pusher.push(0); // R3
        pusher.push(0); // R2
        pusher.push(0); // R1
        pusher.push(0); // R0
        pusher.push(0); // R11
        pusher.push(0); // R10
        pusher.push(0); // R9
        pusher.push(0); // R8
        pusher.push(0); // R7
        pusher.push(0); // R6
        pusher.push(0); // R5
        pusher.push(0); // R4

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Task::new(id, entry_fn, stack_base, pusher.current(), priority, period_ticks);
        let task_ptr = task_mem.cast::<Task>();
        unsafe { task_ptr.as_ptr().write(task) };

        crate::critical::free(|| {
            self.total_tasks.fetch_add(1, Ordering::Relaxed);
            if period_ticks == 0 {
                unsafe { self.ready.push(task_ptr, priority) };
            } else {
                unsafe { task_ptr.as_ref() }.set_state(TaskState::Sleeping);
                unsafe { task_ptr.as_ref() }.set_next_wake(self.now().wrapping_add(period_ticks));
                unsafe { self.periodic.push_back(task_ptr) };
            }
        });

        Some(task_ptr)
    }

    /// Run the scheduler. Must be called from `main`, with all hardware
    /// configured, in Privileged Thread mode on the Main stack, and may
    /// only be called once.
    pub fn start(&self, mut syst: cortex_m::peripheral::SYST, systicks_per_sched_tick: u32) -> ! {
        if self.started.swap(true, Ordering::SeqCst) {
            kernel_panic!("sched: tried to re-start scheduler");
        }

        let next = self
            .select_next_task()
            .unwrap_or_else(|| kernel_panic!("sched: no runnable task (missing idle task?)"));
        self.next_task.set(Some(next));

        syst.set_reload(systicks_per_sched_tick);
        syst.clear_current();
        syst.enable_counter();
        syst.enable_interrupt();

        defmt::debug!("Hit PendSV");
        cortex_m::peripheral::SCB::set_pendsv();
        cortex_m::asm::isb();
        unreachable!();
    }

    /// Register the idle task: the lowest-priority, always-runnable task
    /// that keeps the ready queue from ever being empty. Call once, before
    /// `start`.
    pub fn set_idle_task(&self, entry_fn: TaskEntryFn, stack_size: usize) -> Option<NonNull<Task>> {
        let task = self.new_task(entry_fn, config::IDLE_TASK_PRIORITY, 0, stack_size)?;
        self.idle_task.set(Some(task));
        Some(task)
    }

    /// Promote any periodic task whose wake time has arrived into the
    /// ready queue. Must run under a critical section.
    fn promote_periodic(&self) {
        let now = self.now();
        let mut cur = self.periodic.front();
        while let Some(task_ptr) = cur {
            let task = unsafe { task_ptr.as_ref() };
            let next = task.link().next();
            if now >= task.next_wake() {
                unsafe { self.periodic.unlink(task_ptr) };
                task.set_state(TaskState::Ready);
                unsafe { self.ready.push(task_ptr, task.priority()) };
            }
            cur = next;
        }
    }

    /// Pure selection logic, callable without touching hardware: promote
    /// due periodic tasks, then pick the highest-priority ready task
    /// (falling back to the idle task, which is never itself enqueued in
    /// `ready` once running). Must run under a critical section.
    fn select_next_task(&self) -> Option<NonNull<Task>> {
        self.promote_periodic();
        if let Some(current) = self.current_task.get() {
            let current_ref = unsafe { current.as_ref() };
            if current_ref.state() == TaskState::Running {
                let highest_ready = self.ready.highest_nonempty_priority();
                let keep_current = match highest_ready {
                    Some(p) => current_ref.priority() >= p,
                    None => true,
                };
                if keep_current {
                    return Some(current);
                }
                current_ref.set_state(TaskState::Ready);
                unsafe { self.ready.push(current, current_ref.priority()) };
            }
        }
        match unsafe { self.ready.pop_highest() } {
            Some(next) => {
                unsafe { next.as_ref() }.set_state(TaskState::Running);
                Some(next)
            }
            None => self.idle_task.get(),
        }
    }

    /// Recompute `next_task` and request a PendSV switch. Does not itself
    /// perform the switch — the trampoline does that on exception return.
    fn reschedule_locked(&self) {
        if let Some(next) = self.select_next_task() {
            self.next_task.set(Some(next));
            cortex_m::peripheral::SCB::set_pendsv();
        }
    }

    /// Called from the SysTick handler.
    pub fn sched_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.perform_reschedule();
    }

    /// Run the selection algorithm under a critical section and request a
    /// PendSV switch if it picked someone new. The only thing the `SVCall`
    /// and `SysTick` handlers do.
    ///
    /// Also reaps any zombie left behind by a prior `task_exit`: reaching
    /// this function at all means some task is currently running in thread
    /// mode, which means whatever switch carried it away from the zombie
    /// has already completed, so the zombie's stack and record are safe to
    /// free now.
    pub(crate) fn perform_reschedule(&self) {
        crate::critical::free(|| {
            self.reap_zombie();
            self.reschedule_locked();
        });
    }

    /// Force an immediate switch to `task`, bypassing the ready-queue
    /// selection entirely. Privileged: intended for kernel/diagnostic
    /// callers, not general application code — it does not check priority
    /// ordering or fairness.
    ///
    /// Returns `false` if `task` is not runnable (`Zombie`, or currently
    /// blocked on a mutex).
    pub fn task_switch(&self, task: Option<NonNull<Task>>) -> bool {
        match task {
            None => {
                self.perform_reschedule();
                true
            }
            Some(target) => crate::critical::free(|| {
                let state = unsafe { target.as_ref() }.state();
                if !matches!(state, TaskState::Ready | TaskState::Running) {
                    return false;
                }
                if state == TaskState::Ready {
                    unsafe { self.ready.remove(target, unsafe { target.as_ref() }.priority()) };
                }
                if let Some(current) = self.current_task.get() {
                    if current != target {
                        let current_ref = unsafe { current.as_ref() };
                        if current_ref.state() == TaskState::Running {
                            current_ref.set_state(TaskState::Ready);
                            unsafe { self.ready.push(current, current_ref.priority()) };
                        }
                    }
                }
                unsafe { target.as_ref() }.set_state(TaskState::Running);
                self.next_task.set(Some(target));
                cortex_m::peripheral::SCB::set_pendsv();
                true
            }),
        }
    }

    /// Whether `task` is presently schedulable: `Ready` or `Running`. A
    /// `Zombie`, a task blocked on a mutex, and a periodic task sleeping
    /// until its next period are all not runnable.
    pub fn task_runnable(&self, task: NonNull<Task>) -> bool {
        crate::critical::free(|| {
            matches!(
                unsafe { task.as_ref() }.state(),
                TaskState::Ready | TaskState::Running
            )
        })
    }

    /// Compare two tasks by effective priority: `0` if equal, `>0` if
    /// `a` outranks `b`, `<0` if `b` outranks `a`.
    pub fn task_compare(&self, a: NonNull<Task>, b: NonNull<Task>) -> i32 {
        let pa = unsafe { a.as_ref() }.priority() as i32;
        let pb = unsafe { b.as_ref() }.priority() as i32;
        pa - pb
    }

    /// Tear down the current task: release its resources and mutexes, mark
    /// it a zombie, and yield. Never returns.
    ///
    /// Does not free the exiting task's own stack or record here: `PendSV`
    /// only fires once this function re-enables interrupts on return from
    /// `crate::critical::free`, so at the moment `reschedule_locked` pends
    /// the switch, this task is still the one executing — its stack is
    /// still live and its `Task` record is still what the PendSV
    /// trampoline reads `stack`/writes the saved `sp` into. Freeing either
    /// here would hand that memory back to the allocator out from under a
    /// switch that hasn't happened yet. Instead the task is parked in
    /// `self.zombie` and reaped the next time some other, now-current task
    /// reaches the scheduler (another `task_exit`, or the next tick/SVC),
    /// by which point the switch away from it is guaranteed complete.
    pub fn task_exit(&self) -> ! {
        crate::critical::free(|| {
            let current = self
                .current_task
                .get()
                .unwrap_or_else(|| kernel_panic!("sched: task_exit with no current task"));
            let task = unsafe { current.as_mut() };
            task.resources_mut().close_all();
            Mutex::abandon(current);
            task.set_state(TaskState::Zombie);
            self.total_tasks.fetch_sub(1, Ordering::Relaxed);
            // Safe to reap whatever zombie is already parked here: it was
            // left behind by an earlier task_exit, and we are a different,
            // still-running task, which can only be true if that earlier
            // switch away from it already completed.
            self.reap_zombie();
            self.zombie.set(Some(current));
            self.reschedule_locked();
        });
        loop {
            cortex_m::asm::wfi();
        }
    }

    /// Free the stack and record of whatever task `task_exit` last parked
    /// in `self.zombie`, if any. Must only be called from a context where
    /// the caller itself is not that zombie — see `task_exit` and
    /// `perform_reschedule`.
    fn reap_zombie(&self) {
        if let Some(zombie) = self.zombie.take() {
            let stack_base = unsafe { zombie.as_ref() }.stack_base();
            unsafe {
                crate::mm::kfree(stack_base);
                core::ptr::drop_in_place(zombie.as_ptr());
                crate::mm::kfree(zombie.cast());
            }
        }
    }
}

/// What a task's initial `LR` points at, so returning from `entry_fn`
/// exits the task the same way an explicit [`crate::task_abort`] would.
extern "C" fn task_exit_trampoline() -> ! {
    crate::kernel().scheduler.task_exit()
}

/// The currently running task. Panics (a kernel invariant violation, not a
/// user error) if called before the scheduler has started.
pub fn current_task() -> NonNull<Task> {
    match crate::kernel().scheduler.current_task.get() {
        Some(task) => task,
        None => kernel_panic!("sched: current_task() called before scheduler start"),
    }
}

/// The held-locks list of `task`.
///
/// # Safety
///
/// `task` must be a live task pointer.
pub(crate) unsafe fn held_locks_of(task: NonNull<Task>) -> &'static List<Mutex> {
    unsafe { task.as_ref() }.held_locks()
}

/// Mark the current task `BlockedOnMutex`, record `mutex` as what it is
/// blocked on, and enqueue it on `waiters`. Does not itself yield — the
/// caller must follow up with [`yield_if_possible`] once it has released
/// its own critical section.
///
/// # Safety
///
/// Must run inside a critical section, with `waiters` belonging to `mutex`.
pub(crate) unsafe fn block_current_on(mutex: NonNull<Mutex>, waiters: &List<Task>) {
    let current = current_task();
    let task = unsafe { current.as_ref() };
    task.set_state(TaskState::BlockedOnMutex);
    task.set_blocked_on(Some(mutex));
    unsafe { waiters.push_back(current) };
}

/// Transition `task` back to `Ready` and into the ready queue, clearing
/// its mutex block. Used to wake a task a mutex `unlock`/`abandon` handed
/// ownership to.
pub(crate) fn wake(task: NonNull<Task>) {
    crate::critical::free(|| {
        let task_ref = unsafe { task.as_ref() };
        task_ref.set_blocked_on(None);
        task_ref.set_state(TaskState::Ready);
        unsafe { crate::kernel().scheduler.ready.push(task, task_ref.priority()) };
    });
}

/// Request a task switch from thread-mode code, via a supervisor call —
/// the `SVCall` handler is what actually runs the selection algorithm and
/// performs the switch. A no-op before the scheduler has started.
///
/// This is the function every blocking wait (a contended mutex, an empty
/// shared-memory read) re-enters through after recording its own block
/// state, so that interrupts are enabled again — and the tick/PendSV
/// machinery free to actually switch away — for as long as the wait
/// lasts.
pub fn yield_if_possible() {
    if !crate::kernel().scheduler.is_started() {
        return;
    }
    unsafe { core::arch::asm!("svc 0", options(nomem, nostack)) };
}

/// Run `f` under `lock`, except before the scheduler has started: at that
/// point there is exactly one thread of control (boot code, running with
/// interrupts enabled but nothing else to contend with), so locking would
/// only get in its own way the first time the kernel arena is touched
/// (e.g. to build the idle task's own stack).
pub(crate) fn with_bootstrap_lock<R>(lock: &Mutex, f: impl FnOnce() -> R) -> R {
    if crate::kernel().scheduler.is_started() {
        lock.lock();
        let result = f();
        lock.unlock();
        result
    } else {
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_scheduler_has_no_current_task_and_zero_ticks() {
        let sched = Scheduler::new();
        assert_eq!(sched.now(), 0);
        assert_eq!(sched.total_tasks(), 0);
        assert!(!sched.is_started());
    }

    fn make_task(priority: u8, stack: &mut [u8]) -> Task {
        let base = NonNull::new(stack.as_mut_ptr()).unwrap();
        let sp = unsafe { base.as_ptr().add(stack.len()) } as *mut u32;
        Task::new(1, || {}, base, sp, priority, 0)
    }

    #[test]
    fn task_runnable_reflects_state() {
        let sched = Scheduler::new();
        let mut mem = [0u8; 256];
        let task = make_task(4, &mut mem);
        let ptr = NonNull::from(&task);

        assert_eq!(task.state(), TaskState::Ready);
        assert!(sched.task_runnable(ptr));

        task.set_state(TaskState::Running);
        assert!(sched.task_runnable(ptr));

        task.set_state(TaskState::BlockedOnMutex);
        assert!(!sched.task_runnable(ptr));

        task.set_state(TaskState::Sleeping);
        assert!(!sched.task_runnable(ptr));

        task.set_state(TaskState::Zombie);
        assert!(!sched.task_runnable(ptr));
    }

    #[test]
    fn task_compare_orders_by_effective_priority() {
        let sched = Scheduler::new();
        let mut low_mem = [0u8; 256];
        let mut high_mem = [0u8; 256];
        let low = make_task(2, &mut low_mem);
        let high = make_task(9, &mut high_mem);

        assert!(sched.task_compare(NonNull::from(&high), NonNull::from(&low)) > 0);
        assert!(sched.task_compare(NonNull::from(&low), NonNull::from(&high)) < 0);
        assert_eq!(sched.task_compare(NonNull::from(&low), NonNull::from(&low)), 0);
    }
}

// End of File
