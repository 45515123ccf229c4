#![no_std]

use core::{
    arch::naked_asm,
    cell::UnsafeCell,
    sync::atomic::{AtomicPtr, Ordering},
};

#[cfg(test)]
extern crate std;

pub mod config;
mod critical;
mod list;
mod mm;
mod resource;
mod ring;
pub mod sched;
mod shared;
mod stack;
mod stack_pusher;
mod sync;
mod task;

pub use list::{IntrusiveNode, Link};
pub use mm::{free, kfree, kmalloc, malloc};
pub use resource::{
    CloserFn, Handle, ReaderFn, Resource, ResourceTable, WriterFn, close as close_resource,
    getc, open as open_resource, printf as printf_fmt, read as read_resource,
    write as write_resource,
};
pub use sched::Scheduler;
pub use shared::{SharedDeque, SharedMemory};
pub use stack::Stack;
pub use sync::{Mutex, Semaphore};
pub use task::{Task, TaskEntryFn, TaskState};

/// Funnel every kernel invariant violation through one fatal, non-recoverable
/// path: bad allocator magic, release-by-non-holder, a detected donation
/// cycle, double free, use of the null resource. Whatever message the caller
/// builds is what `#[panic_handler]` below prints through `defmt`.
#[macro_export]
macro_rules! kernel_panic {
    ($($arg:tt)*) => {
        panic!($($arg)*)
    };
}

/// Format and write to the current task's registered stdout handle,
/// exactly like the reference kernel's `printf` routed through
/// `curr_task->_stdout`. Panics if the task has no stdout registered.
#[macro_export]
macro_rules! printf {
    ($($arg:tt)*) => {
        $crate::printf_fmt(core::format_args!($($arg)*))
    };
}

/// The kernel's process-wide state: both buddy arenas and the scheduler.
///
/// An application declares exactly one `static KERNEL: corvus::Kernel`,
/// calls [`Kernel::init`] once during boot with the backing memory for each
/// arena, and then [`Kernel::start_sched`] to hand control to the scheduler.
/// Reached from interrupt context through [`KERNEL_PTR`], the same shape the
/// reference scheduler uses for its own `SCHEDULER_PTR`.
pub struct Kernel {
    pub(crate) kernel_arena: mm::ArenaAllocator,
    pub(crate) user_arena: mm::ArenaAllocator,
    pub(crate) scheduler: sched::Scheduler,
}

impl Kernel {
    pub const fn new() -> Self {
        Kernel {
            kernel_arena: mm::ArenaAllocator::new(
                config::KERNEL_MIN_ORDER,
                config::KERNEL_MAX_ORDER,
                config::MM_MAX_KERNEL_SIZE,
            ),
            user_arena: mm::ArenaAllocator::new(
                config::USER_MIN_ORDER,
                config::USER_MAX_ORDER,
                config::MM_MAX_USER_SIZE,
            ),
            scheduler: sched::Scheduler::new(),
        }
    }

    /// Initialize both arenas over the given backing memory and publish this
    /// `Kernel` as the one every exception handler and free function reaches
    /// through. Must be called exactly once, before any task is created.
    ///
    /// # Safety
    ///
    /// `kernel_mem` and `user_mem` must each point to at least
    /// [`config::KERNEL_ARENA_SIZE`] / [`config::USER_ARENA_SIZE`] bytes of
    /// memory that nothing else touches for the remaining lifetime of the
    /// program, and `self` must have `'static` storage duration (a `static
    /// KERNEL: Kernel`).
    pub unsafe fn init(&'static self, kernel_mem: *mut u8, user_mem: *mut u8) {
        unsafe {
            self.kernel_arena.init(kernel_mem);
            self.user_arena.init(user_mem);
        }
        KERNEL_PTR.store(self as *const Kernel as *mut Kernel, Ordering::Release);
    }

    /// Allocate a task record and stack from the kernel arena and make it
    /// runnable. See [`Scheduler::new_task`].
    pub fn new_task(
        &self,
        entry_fn: TaskEntryFn,
        priority: u8,
        period_ticks: u32,
        stack_size: usize,
    ) -> Option<core::ptr::NonNull<Task>> {
        self.scheduler.new_task(entry_fn, priority, period_ticks, stack_size)
    }

    /// Register the always-runnable, lowest-priority idle task. Must be
    /// called once, before `start_sched`.
    pub fn set_idle_task(&self, entry_fn: TaskEntryFn, stack_size: usize) -> Option<core::ptr::NonNull<Task>> {
        self.scheduler.set_idle_task(entry_fn, stack_size)
    }

    /// Start the scheduler. The idle task must already be registered via
    /// `set_idle_task`. Never returns.
    pub fn start_sched(&'static self, syst: cortex_m::peripheral::SYST, systicks_per_sched_tick: u32) -> ! {
        self.scheduler.start(syst, systicks_per_sched_tick)
    }

    /// Force an immediate switch. See [`Scheduler::task_switch`].
    pub fn task_switch(&self, task: Option<core::ptr::NonNull<Task>>) -> bool {
        self.scheduler.task_switch(task)
    }

    /// Whether `task` is presently schedulable. See
    /// [`Scheduler::task_runnable`].
    pub fn task_runnable(&self, task: core::ptr::NonNull<Task>) -> bool {
        self.scheduler.task_runnable(task)
    }

    /// Compare two tasks by effective priority. See
    /// [`Scheduler::task_compare`].
    pub fn task_compare(&self, a: core::ptr::NonNull<Task>, b: core::ptr::NonNull<Task>) -> i32 {
        self.scheduler.task_compare(a, b)
    }

    /// Count of tasks not in `Zombie` state.
    pub fn total_tasks(&self) -> usize {
        self.scheduler.total_tasks()
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Kernel::new()
    }
}

static KERNEL_PTR: AtomicPtr<Kernel> = AtomicPtr::new(core::ptr::null_mut());

/// The one `Kernel` published by [`Kernel::init`].
///
/// Panics if called before `init`: every caller (the exception handlers, the
/// free functions in [`sched`]/[`mm`]) only runs after boot has published a
/// `Kernel`, so reaching this before `init` is itself a kernel bug.
pub(crate) fn kernel() -> &'static Kernel {
    let ptr = KERNEL_PTR.load(Ordering::Acquire);
    if ptr.is_null() {
        kernel_panic!("corvus: kernel() called before Kernel::init");
    }
    unsafe { &*ptr }
}

/// Yield repeatedly until at least `ticks` have elapsed. Busy-waits between
/// yields rather than sleeping, so it is only appropriate for short delays;
/// a task that wants to re-enter `Sleeping` for a whole period should be
/// periodic instead (see [`Scheduler::new_task`]).
pub fn delay(ticks: u32) {
    let start = now();
    while now().wrapping_sub(start) <= ticks {
        sched::yield_if_possible();
    }
}

/// The current tick count, or `u32::MAX` before `Kernel::init`.
pub fn now() -> u32 {
    let ptr = KERNEL_PTR.load(Ordering::Acquire);
    if ptr.is_null() {
        return u32::MAX;
    }
    unsafe { &*ptr }.scheduler.now()
}

/// Abort the current task immediately, exactly as if its entry function had
/// returned.
pub fn task_abort() -> ! {
    kernel().scheduler.task_exit()
}

/// SysTick Handler: advances the tick count and runs the selection
/// algorithm, requesting a `PendSV` switch if it picked someone new.
#[unsafe(no_mangle)]
extern "C" fn SysTick() {
    kernel().scheduler.sched_tick();
}

/// Supervisor Call Handler: the landing pad for `svc 0`, issued by
/// [`sched::yield_if_possible`] from thread-mode code that wants to step
/// aside. Runs the same selection algorithm as the tick handler.
#[unsafe(no_mangle)]
extern "C" fn SVCall() {
    kernel().scheduler.perform_reschedule();
}

/// PendSV Handler
///
/// This is the task switch code. It is called by hardware when the PendSV
/// bit is set and all other interrupts have finished.
///
/// On entry, we will find that PC, LR, R12, R3, R2, R1 and R0 will have been
/// pushed onto the PSP. We thus push the remaining registers (which are as
/// the running task left them) and then restore the registers from another
/// task. Exiting from this function will cause the hardware to restore PC,
/// LR, R12, R3, R2, R1, and R0 from the new task's PSP, and so the new task
/// will resume.
///
/// Unlike the reference scheduler's index-into-a-task-array design, `r2`
/// here is the `Task` pointer itself (not an id to multiply up): the
/// `Scheduler`'s `current_task`/`next_task` fields and each `Task`'s `stack`
/// field are all plain `Option<NonNull<Task>>`/`*mut u32` values, located by
/// constant byte offset via `core::mem::offset_of!` the same way the
/// reference scheduler locates its own fields from raw assembly.
#[unsafe(no_mangle)]
#[unsafe(naked)]
unsafe extern "C" fn PendSV() {
    naked_asm!(r#"
	// r1 = the address of the Kernel object
	ldr     r1, ={kernel_ptr}
	ldr     r1, [r1]
	// r1 = the address of its Scheduler field
	add     r1, r1, {sched_off}

	// r2 = the current task pointer (0 means "none yet", at first switch)
	ldr     r2, [r1, {current_off}]
	cmp     r2, #0
	beq     1f

	// r3 = &current_task.stack
	add     r3, r2, {stack_off}

	// r0 = the current task stack pointer
	mrs     r0, psp

	// Push the additional state into stack at r0
	stmfd   r0!, {{ r4 - r11 }}

	// save the stack pointer (in r0) into the task's stack field
	str     r0, [r3]

	1:

	// r2 = the next task pointer
	ldr     r2, [r1, {next_off}]
	add     r3, r2, {stack_off}

	// r0 = the stack pointer from the task object
	ldr     r0, [r3]

	// Pop the additional state from it
	ldmfd   r0!, {{ r4 - r11 }}

	// Set the current task stack pointer
	msr     psp, r0

	// copy the next task pointer to the current task pointer
	str     r2, [r1, {current_off}]

	// return to thread mode on the process stack
	mov     lr, #0xFFFFFFFD
	bx      lr
	"#,
    kernel_ptr = sym KERNEL_PTR,
    sched_off = const core::mem::offset_of!(Kernel, scheduler),
    current_off = const sched::Scheduler::CURRENT_TASK_OFFSET,
    next_off = const sched::Scheduler::NEXT_TASK_OFFSET,
    stack_off = const task::Task::STACK_OFFSET);
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    defmt::println!("PANIC: {}", defmt::Debug2Format(info));
    cortex_m::asm::udf();
}

#[cortex_m_rt::exception]
unsafe fn HardFault(info: &cortex_m_rt::ExceptionFrame) -> ! {
    defmt::println!("FAULT: {}", defmt::Debug2Format(info));
    cortex_m::asm::udf();
}

defmt::timestamp!("{=u32:010}", now());

// End of File
