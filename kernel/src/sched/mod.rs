//! Preemptive priority scheduler
//!
//! A single global ready queue ordered by priority (lower number wins,
//! FIFO within a level) and a per-core facade that performs the context
//! switch. Threads are linked intrusively through their `next` field; a
//! thread is on at most one queue at any moment.

pub mod core_state;
pub mod queue;

pub use core_state::{this_core, CoreState};
pub use queue::{ThreadQueue, MAX_PRIORITY};

use core::ptr::NonNull;

use crate::process::thread::Thread;

/// Highest-priority ready thread, or the current core's idle thread.
pub fn next_ready() -> NonNull<Thread> {
    queue::dequeue().unwrap_or_else(|| this_core().idle_thread())
}

/// Hand a freshly-readied thread to the scheduler: preempt if it outranks
/// the running thread, otherwise enqueue it. Interrupts must be masked.
pub fn preempt_or_enqueue(thread: NonNull<Thread>) {
    debug_assert!(!crate::arch::interrupts_enabled());
    let core = this_core();
    let current = core.current_thread();
    // SAFETY: both pointers reference live threads; masked interrupts keep
    // the running thread's fields stable on this core.
    let (new_prio, cur_prio, cur_stopped) = unsafe {
        (
            thread.as_ref().priority(),
            current.as_ref().priority(),
            current.as_ref().is_stopped(),
        )
    };
    if new_prio < cur_prio && !cur_stopped {
        unsafe { current.as_ref().set_ready() };
        queue::enqueue(current);
        core.switch_to(thread);
    } else {
        queue::enqueue(thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::testing;
    use crate::process::thread::ThreadState;
    use crate::sync::InterruptGuard;

    #[test]
    fn preemption_respects_priority() {
        let _order = testing::serialize();
        testing::reset_current();
        let harness = testing::init();
        // SAFETY: the kernel process lives forever.
        let process = unsafe { harness.kernel_process.as_ref() };
        let boot = harness.initial_thread;

        // A weaker thread queues behind the boot thread.
        let weak = process.spawn_parked(31).unwrap();
        {
            let _ig = InterruptGuard::new();
            preempt_or_enqueue(weak);
            assert_eq!(this_core().current_thread(), boot);
        }
        // A stronger thread preempts: the boot thread goes READY onto the
        // queue and the newcomer runs.
        let strong = process.spawn_parked(2).unwrap();
        {
            let _ig = InterruptGuard::new();
            preempt_or_enqueue(strong);
        }
        assert_eq!(this_core().current_thread(), strong);
        // SAFETY: harness threads.
        unsafe {
            assert_eq!(strong.as_ref().state(), ThreadState::Running);
            assert_eq!(boot.as_ref().state(), ThreadState::Ready);
        }
        testing::reset_current();
    }

    #[test]
    fn next_ready_falls_back_to_idle() {
        let _order = testing::serialize();
        testing::reset_current();
        let _ig = InterruptGuard::new();
        assert_eq!(next_ready(), this_core().idle_thread());
    }
}
