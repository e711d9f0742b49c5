//! Threads
//!
//! A thread is a kernel stack, a register-save area, and a tiny state
//! machine. The intrusive `next` link belongs to whichever queue holds the
//! thread; `(wait_for, timer_ticket)` tie the three wake paths together so
//! exactly one of them fires per wait.

use alloc::boxed::Box;

use core::cell::{Cell, UnsafeCell};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::arch::{self, context::FpuState, CpuContext};
use crate::bugcheck::Reason;
use crate::mm::vspace::kernel_space;
use crate::mm::PAGE_SIZE;
use crate::object::waitable::{KernelObject, ObjectKind, WaitReason, Waitable};
use crate::sched::{self, queue, this_core, MAX_PRIORITY};
use crate::sync::InterruptGuard;
use crate::timer;

use super::pcb::Process;

pub type ThreadId = u32;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready = 0,
    Running = 1,
    Waiting = 2,
    Stopped = 3,
}

impl ThreadState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Waiting,
            _ => Self::Stopped,
        }
    }
}

static NEXT_ID: AtomicU32 = AtomicU32::new(0);

/// Priority given to threads whose creator does not choose one.
pub const DEFAULT_PRIORITY: u16 = 16;

/// Kernel thread entry point; receives the creator's argument in rcx.
/// Thread creation takes a raw rip so the service layer can seed user
/// entry points the same way.
pub type Procedure = extern "C" fn(arg: u64) -> !;

pub struct Thread {
    id: ThreadId,
    /// Joiners block here; notified once on STOPPED, terminal.
    waitable: Waitable,
    state: AtomicU8,
    priority: AtomicU16,
    reason: AtomicU8,
    ticket: AtomicU64,
    /// The waitable whose queue holds this thread, while WAITING on one.
    /// Non-owning: cleared by the same transition that leaves the queue.
    wait_for: Cell<Option<NonNull<Waitable>>>,
    /// Intrusive queue link, owned by the containing queue.
    next: Cell<Option<NonNull<Thread>>>,
    context: UnsafeCell<CpuContext>,
    fpu: UnsafeCell<Option<Box<FpuState>>>,
    kstack_base: u64,
    kstack_pages: usize,
    owner: NonNull<Process>,
}

// SAFETY: scheduling fields (`next`, `wait_for`, `context`) are only
// touched with local interrupts masked under the owning queue or core, per
// the locking discipline; the rest is atomic.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// Create a runnable kernel thread: reserves `stack_pages` of kernel
    /// stack, commits the top page (the rest is demand guard) and seeds
    /// the register area. The caller publishes it and hands it to the
    /// scheduler.
    pub(super) fn new(
        owner: NonNull<Process>,
        entry: u64,
        arg: u64,
        stack_pages: usize,
        priority: u16,
    ) -> Option<Box<Thread>> {
        debug_assert!(stack_pages >= 1);
        let vm = kernel_space();
        let base = vm.reserve(0, stack_pages);
        if base == 0 {
            bugcheck!(Reason::BadAlloc, "kernel stack reserve of {stack_pages} pages failed");
        }
        let top = base + (stack_pages * PAGE_SIZE) as u64;
        if !vm.commit(top - PAGE_SIZE as u64, 1) {
            bugcheck!(Reason::BadAlloc, "kernel stack commit at {top:#x} failed");
        }
        log::debug!("kernel stack at {base:#x}, {stack_pages} pages");
        let context = CpuContext::kernel_entry(entry, arg, top);
        Some(Thread::raw(owner, ThreadState::Ready, priority, context, base, stack_pages))
    }

    fn raw(
        owner: NonNull<Process>,
        state: ThreadState,
        priority: u16,
        context: CpuContext,
        kstack_base: u64,
        kstack_pages: usize,
    ) -> Box<Thread> {
        Box::new(Thread {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            waitable: Waitable::new(),
            state: AtomicU8::new(state as u8),
            priority: AtomicU16::new(priority),
            reason: AtomicU8::new(WaitReason::Passed as u8),
            ticket: AtomicU64::new(0),
            wait_for: Cell::new(None),
            next: Cell::new(None),
            context: UnsafeCell::new(context),
            fpu: UnsafeCell::new(None),
            kstack_base,
            kstack_pages,
            owner,
        })
    }

    /// The boot thread: already RUNNING on its loader-provided stack.
    pub(super) fn new_initial(owner: NonNull<Process>) -> Box<Thread> {
        let thread = Thread::raw(
            owner,
            ThreadState::Running,
            MAX_PRIORITY - 2,
            CpuContext::zeroed(),
            0,
            0,
        );
        debug_assert_eq!(thread.id, 0);
        thread
    }

    /// A per-core idle thread at the lowest priority; dispatched directly
    /// by the core, never queued.
    pub(super) fn new_idle(owner: NonNull<Process>, entry: Procedure) -> Option<Box<Thread>> {
        Thread::new(owner, entry as usize as u64, 0, 1, MAX_PRIORITY - 1)
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn priority(&self) -> u16 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: u16) -> bool {
        if priority >= MAX_PRIORITY - 1 {
            return false;
        }
        self.priority.store(priority, Ordering::Relaxed);
        true
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == ThreadState::Stopped
    }

    pub fn last_reason(&self) -> WaitReason {
        WaitReason::from_raw(self.reason.load(Ordering::Acquire))
    }

    pub fn ticket(&self) -> u64 {
        self.ticket.load(Ordering::Acquire)
    }

    pub fn owner(&self) -> &Process {
        // SAFETY: the owning process outlives its threads; it is erased
        // from the process table only after the thread map empties.
        unsafe { self.owner.as_ref() }
    }

    pub(crate) fn owner_ptr(&self) -> NonNull<Process> {
        self.owner
    }

    pub fn kstack_base(&self) -> u64 {
        self.kstack_base
    }

    pub fn kstack_pages(&self) -> usize {
        self.kstack_pages
    }

    pub(crate) fn context_ptr(&self) -> *mut CpuContext {
        self.context.get()
    }

    pub(crate) fn has_fpu(&self) -> bool {
        // SAFETY: read with interrupts masked on the owning core.
        unsafe { (*self.fpu.get()).is_some() }
    }

    // Intrusive link accessors; caller must own the containing queue.
    pub(crate) unsafe fn next(&self) -> Option<NonNull<Thread>> {
        self.next.get()
    }

    pub(crate) unsafe fn set_next(&self, next: Option<NonNull<Thread>>) {
        self.next.set(next);
    }

    pub(crate) unsafe fn take_next(&self) -> Option<NonNull<Thread>> {
        self.next.take()
    }

    /// RUNNING -> WAITING with the wake bookkeeping armed.
    pub(crate) unsafe fn set_waiting(&self, ticket: u64, wait_for: Option<NonNull<Waitable>>) {
        debug_assert!(!arch::interrupts_enabled());
        debug_assert_eq!(self.state(), ThreadState::Running);
        debug_assert!(ticket != 0 || wait_for.is_some());
        debug_assert!(self.wait_for.get().is_none() && self.ticket() == 0);
        self.ticket.store(ticket, Ordering::Release);
        self.wait_for.set(wait_for);
        self.state.store(ThreadState::Waiting as u8, Ordering::Release);
    }

    /// WAITING -> READY through one of the three wake paths; defeats the
    /// other two (cancels the timer, or leaves the wait queue).
    pub(crate) unsafe fn wake(&self, reason: WaitReason) {
        debug_assert!(!arch::interrupts_enabled());
        debug_assert_eq!(self.state(), ThreadState::Waiting);
        match reason {
            WaitReason::Notify | WaitReason::Abandoned => {
                let ticket = self.ticket();
                if ticket != 0 {
                    timer::cancel(ticket);
                }
            }
            WaitReason::Timeout => {
                debug_assert!(self.ticket() != 0);
                if let Some(waitable) = self.wait_for.get() {
                    // SAFETY: the waitable is alive while this thread sits
                    // on its queue.
                    unsafe { waitable.as_ref().cancel(NonNull::from(self)) };
                }
            }
            WaitReason::Passed => bugcheck!(Reason::Corrupted, "wake with PASSED"),
        }
        self.reason.store(reason as u8, Ordering::Release);
        self.wait_for.set(None);
        self.ticket.store(0, Ordering::Release);
        self.state.store(ThreadState::Ready as u8, Ordering::Release);
    }

    /// RUNNING -> READY (preemption).
    pub(crate) unsafe fn set_ready(&self) {
        debug_assert!(!arch::interrupts_enabled());
        debug_assert_eq!(self.state(), ThreadState::Running);
        self.state.store(ThreadState::Ready as u8, Ordering::Release);
    }

    /// READY -> RUNNING (dispatch).
    pub(crate) unsafe fn set_running(&self) {
        debug_assert!(!arch::interrupts_enabled());
        debug_assert_eq!(self.state(), ThreadState::Ready);
        self.state.store(ThreadState::Running as u8, Ordering::Release);
    }

    /// Terminal transition.
    pub(crate) unsafe fn set_stopped(&self) {
        debug_assert!(!arch::interrupts_enabled());
        self.state.store(ThreadState::Stopped as u8, Ordering::Release);
    }

    /// Test-harness support on hosted targets: put the boot thread back
    /// into the RUNNING state regardless of where a test left it.
    #[cfg(not(target_os = "none"))]
    pub fn force_running(&self) {
        self.state.store(ThreadState::Running as u8, Ordering::Release);
        self.wait_for.set(None);
        self.ticket.store(0, Ordering::Release);
    }

    /// Forcibly stop a thread that is not the caller. The owning process
    /// lock serializes against state transitions from other paths.
    pub(crate) unsafe fn kill(thread: NonNull<Thread>) {
        debug_assert!(!arch::interrupts_enabled());
        // SAFETY: caller holds the owning process lock with interrupts
        // masked.
        let th = unsafe { thread.as_ref() };
        match th.state() {
            ThreadState::Stopped => return,
            ThreadState::Ready => {
                if !queue::unlink(thread) {
                    bugcheck!(Reason::Corrupted, "ready thread missing from queue");
                }
            }
            ThreadState::Waiting => {
                let ticket = th.ticket();
                if ticket != 0 {
                    timer::cancel(ticket);
                }
                if let Some(waitable) = th.wait_for.get() {
                    unsafe { waitable.as_ref().cancel(thread) };
                }
                th.wait_for.set(None);
                th.ticket.store(0, Ordering::Release);
            }
            ThreadState::Running => {
                // Only the current thread can be RUNNING here; callers
                // kill it last, through the exit path.
                bugcheck!(Reason::Corrupted, "kill of a running thread");
            }
        }
        unsafe { th.set_stopped() };
        // The thread never reaches its exit path, so its kernel stack is
        // reclaimed here; it is guaranteed off-CPU.
        if th.kstack_pages > 0 && !kernel_space().release(th.kstack_base, th.kstack_pages) {
            bugcheck!(Reason::Corrupted, "stack release for killed thread {}", th.id);
        }
        th.waitable.notify_queued(WaitReason::Notify);
    }

    /// Give up the CPU: park for `us` microseconds (0 = yield).
    pub fn sleep(us: u64) {
        let _ig = InterruptGuard::new();
        let core = this_core();
        let thread = core.current_thread();
        // SAFETY: current thread on this core, interrupts masked.
        unsafe {
            if us > 0 {
                let ticket = timer::put(us, crate::object::waitable::on_timer, thread);
                thread.as_ref().set_waiting(ticket, None);
            } else {
                thread.as_ref().set_ready();
                queue::enqueue(thread);
            }
        }
        core.switch_to(sched::next_ready());
    }

    /// Terminate the calling thread: STOPPED, detach from the owning
    /// process, then escape onto the gc stack so the kernel stack can be
    /// freed. Never returns on bare metal.
    pub fn exit() {
        arch::interrupts_save_off();
        let core = this_core();
        let thread = core.current_thread();
        // SAFETY: current thread on this core, interrupts masked for good.
        unsafe {
            let th = thread.as_ref();
            th.set_stopped();
            th.waitable.notify(WaitReason::Notify);
            let has_fpu = th.has_fpu();
            let stack_base = th.kstack_base;
            let stack_pages = th.kstack_pages;
            th.owner().on_thread_exit(thread);
            core.escape(has_fpu, stack_base, stack_pages);
        }
    }
}

impl KernelObject for Thread {
    fn waitable(&self) -> &Waitable {
        &self.waitable
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Thread
    }

    /// Terminal: satisfied exactly when STOPPED.
    fn check(&self) -> bool {
        self.is_stopped()
    }

    fn relax(&self) -> bool {
        let _ig = InterruptGuard::new();
        if self.waitable.release_ref() > 0 {
            return true;
        }
        self.owner().erase_thread(self.id);
        false
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if !self.is_stopped() {
            bugcheck!(Reason::Corrupted, "dropping live thread {}", self.id);
        }
        // The kernel stack was released by the escape path.
    }
}
