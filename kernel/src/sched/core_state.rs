//! Per-core scheduler state
//!
//! `this_core()` is the facade the rest of the kernel talks to: it owns the
//! current-thread pointer, performs `switch_to`, and provides `escape`, the
//! exit path that frees a thread's kernel stack after switching off it.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::arch;
use crate::bugcheck::Reason;
use crate::mm::vspace::kernel_space;
use crate::process::thread::Thread;

/// Cores the per-core table is provisioned for.
pub const MAX_CORES: usize = 16;

/// Stack the exit path runs on while the dying thread's stack is freed.
#[repr(C, align(16))]
struct GcStack([u8; 4096]);

static mut GC_STACKS: [GcStack; MAX_CORES] = unsafe { core::mem::zeroed() };

pub struct CoreState {
    current: AtomicPtr<Thread>,
    idle: AtomicPtr<Thread>,
    /// Thread whose FPU state is live on this core, if any.
    fpu_owner: AtomicPtr<Thread>,
    /// A thread that finished exiting on this core and still holds its
    /// table reference; dropped at the next safe point after the switch.
    reap: AtomicPtr<Thread>,
}

impl CoreState {
    const fn new() -> Self {
        Self {
            current: AtomicPtr::new(core::ptr::null_mut()),
            idle: AtomicPtr::new(core::ptr::null_mut()),
            fpu_owner: AtomicPtr::new(core::ptr::null_mut()),
            reap: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Install the boot thread and the idle thread during staging.
    pub fn install(&self, initial: NonNull<Thread>, idle: NonNull<Thread>) {
        self.current.store(initial.as_ptr(), Ordering::Release);
        self.idle.store(idle.as_ptr(), Ordering::Release);
    }

    /// The thread running on this core.
    pub fn current_thread(&self) -> NonNull<Thread> {
        match NonNull::new(self.current.load(Ordering::Acquire)) {
            Some(thread) => thread,
            None => bugcheck!(Reason::Corrupted, "core has no current thread"),
        }
    }

    /// This core's idle thread.
    pub fn idle_thread(&self) -> NonNull<Thread> {
        match NonNull::new(self.idle.load(Ordering::Acquire)) {
            Some(thread) => thread,
            None => bugcheck!(Reason::Corrupted, "core has no idle thread"),
        }
    }

    /// Switch to `next`. No-op when `next` is already current. Interrupts
    /// must be masked; the switch resumes in `next`'s context and returns
    /// here only when something switches back.
    pub fn switch_to(&self, next: NonNull<Thread>) {
        debug_assert!(!arch::interrupts_enabled());
        let current = self.current_thread();
        if current == next {
            // A yield that immediately won the queue again: keep the state
            // machine consistent without a register switch.
            // SAFETY: current thread on this core, interrupts masked.
            unsafe {
                if next.as_ref().state() == crate::process::thread::ThreadState::Ready {
                    next.as_ref().set_running();
                }
            }
            return;
        }
        // SAFETY: masked interrupts pin both threads' scheduling fields.
        unsafe {
            next.as_ref().set_running();
            // Reload the paging root only when crossing into a different
            // owning process; kernel threads run on whatever root is live.
            if let Some(cr3) = next.as_ref().owner().vspace().cr3() {
                if arch::read_cr3() != cr3 {
                    arch::write_cr3(cr3);
                }
            }
            self.current.store(next.as_ptr(), Ordering::Release);
            arch::context_switch(current.as_ref().context_ptr(), next.as_ref().context_ptr());
        }
        // Running again (possibly much later, as whoever switched back to
        // us): drop the reference of a thread that exited on this core.
        self.drain_reap();
    }

    /// Release the pending dead thread's table reference, if any. The
    /// object stayed alive through the final context save; by now nothing
    /// on any CPU references it.
    fn drain_reap(&self) {
        let dead = self.reap.swap(core::ptr::null_mut(), Ordering::AcqRel);
        if let Some(dead) = NonNull::new(dead) {
            use crate::object::waitable::KernelObject;
            // SAFETY: the thread map still pins the object until this
            // relax.
            unsafe { dead.as_ref().relax() };
        }
    }

    /// Exit path: free the outgoing thread's kernel stack *after* switching
    /// off it, then resume the next ready thread. Interrupts must be
    /// masked; the calling thread is already STOPPED and never returns.
    #[cfg(target_os = "none")]
    pub fn escape(&self, has_fpu: bool, stack_base: u64, stack_pages: usize) -> ! {
        debug_assert!(!arch::interrupts_enabled());
        self.drain_reap();
        if has_fpu {
            self.drop_fpu_owner();
        }
        let core_idx = arch::core_id() % MAX_CORES;
        // SAFETY: each core only ever touches its own gc stack, and the
        // dying thread cannot be rescheduled (it is STOPPED).
        unsafe {
            let gc_top = (&raw mut GC_STACKS[core_idx] as *mut u8 as u64) + 4096;
            core::arch::asm!(
                "mov rsp, {top}",
                "call {gc}",
                top = in(reg) gc_top,
                gc = sym gc_entry,
                in("rdi") stack_base,
                in("rsi") stack_pages,
                options(noreturn),
            );
        }
    }

    /// Host build: no stack to pivot off, release directly and record the
    /// handoff to the next ready thread.
    #[cfg(not(target_os = "none"))]
    pub fn escape(&self, has_fpu: bool, stack_base: u64, stack_pages: usize) {
        debug_assert!(!arch::interrupts_enabled());
        if has_fpu {
            self.drop_fpu_owner();
        }
        if stack_pages > 0 && !kernel_space().release(stack_base, stack_pages) {
            bugcheck!(Reason::Corrupted, "kernel stack release failed at {stack_base:#x}");
        }
        // No real stack to pivot off on the host: the dead thread's table
        // reference can drop right away.
        let dying = self.current_thread();
        let next = crate::sched::next_ready();
        self.switch_to(next);
        use crate::object::waitable::KernelObject;
        // SAFETY: STOPPED, no queue holds it.
        unsafe { dying.as_ref().relax() };
    }

    fn drop_fpu_owner(&self) {
        let current = self.current.load(Ordering::Acquire);
        let _ = self.fpu_owner.compare_exchange(
            current,
            core::ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }
}

/// Tail of the bare-metal escape path, entered on the gc stack.
#[cfg(target_os = "none")]
extern "C" fn gc_entry(stack_base: u64, stack_pages: usize) -> ! {
    if stack_pages > 0 && !kernel_space().release(stack_base, stack_pages) {
        bugcheck!(Reason::Corrupted, "kernel stack release failed at {stack_base:#x}");
    }
    let core = this_core();
    // The dying thread's context area must survive the final save; its
    // reference drops after the switch, on the next thread.
    core.reap.store(core.current_thread().as_ptr(), Ordering::Release);
    let next = crate::sched::next_ready();
    // The dying thread is STOPPED, so switch_to never comes back here.
    core.switch_to(next);
    bugcheck!(Reason::Corrupted, "escaped thread was rescheduled");
}

static CORES: [CoreState; MAX_CORES] = {
    const CORE: CoreState = CoreState::new();
    [CORE; MAX_CORES]
};

/// The executing core's scheduler state.
pub fn this_core() -> &'static CoreState {
    &CORES[arch::core_id() % MAX_CORES]
}
