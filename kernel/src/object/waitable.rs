//! The waitable primitive
//!
//! A waitable carries a spin lock, a FIFO wait queue of threads, and a
//! reference count. `wait` parks the calling thread until exactly one of
//! three wake paths fires: a notify, its one-shot timer, or abandonment
//! when the object dies. The thread records `(timer_ticket, wait_for)` so
//! whichever path wins cancels the other two.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::mutex::SpinMutex;

use crate::bugcheck::Reason;
use crate::process::thread::Thread;
use crate::sched::{self, queue, this_core, ThreadQueue};
use crate::sync::InterruptGuard;
use crate::timer;

/// Why a wait returned.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// The fast path: already satisfied, never blocked.
    Passed = 0,
    /// Woken by a notify/signal.
    Notify = 1,
    /// The timeout elapsed first.
    Timeout = 2,
    /// The waitable was destroyed while the thread waited.
    Abandoned = 3,
}

impl WaitReason {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Passed,
            1 => Self::Notify,
            2 => Self::Timeout,
            _ => Self::Abandoned,
        }
    }
}

/// Object type discriminator surfaced through `handle_type`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Event = 1,
    Semaphore = 2,
    Process = 3,
    Thread = 4,
    File = 5,
    Stream = 6,
}

/// A fat pointer to any kernel object; handle-table currency.
pub type ObjPtr = NonNull<dyn KernelObject>;

/// The shared base of every waitable object.
pub struct Waitable {
    queue: SpinMutex<ThreadQueue>,
    refs: AtomicU32,
}

impl Waitable {
    /// A fresh waitable holding one reference for its creator.
    pub const fn new() -> Self {
        Self {
            queue: SpinMutex::new(ThreadQueue::new()),
            refs: AtomicU32::new(1),
        }
    }

    /// Take another reference; fails only on an object already dead.
    pub fn acquire(&self) -> bool {
        let mut refs = self.refs.load(Ordering::Relaxed);
        loop {
            if refs == 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                refs,
                refs + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(cur) => refs = cur,
            }
        }
    }

    /// Unconditional extra reference (the `manage` double-count).
    pub fn manage_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference, returning the remaining count.
    pub fn release_ref(&self) -> u32 {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        prev - 1
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// The wait engine. `try_consume` runs under the queue lock so the
    /// satisfaction check is atomic with enqueueing; `on_acquire` runs in
    /// the same window on the fast path. The slow path parks the current
    /// thread and switches away; the returned reason tells which wake path
    /// fired.
    pub fn wait_with(
        &self,
        timeout_us: u64,
        try_consume: impl FnOnce() -> bool,
        on_acquire: Option<&mut dyn FnMut()>,
    ) -> WaitReason {
        let _ig = InterruptGuard::new();
        let mut queue = self.queue.lock();
        if try_consume() {
            if let Some(hook) = on_acquire {
                hook();
            }
            return WaitReason::Passed;
        }
        let core = this_core();
        let thread = core.current_thread();
        let ticket = if timeout_us > 0 {
            timer::put(timeout_us, on_timer, thread)
        } else {
            0
        };
        // SAFETY: current thread on this core, interrupts masked.
        unsafe { thread.as_ref().set_waiting(ticket, Some(NonNull::from(self))) };
        queue.put(thread);
        drop(queue);
        core.switch_to(sched::next_ready());
        // Back from the switch: exactly one wake path has run.
        unsafe { thread.as_ref().last_reason() }
    }

    /// Wake every waiter with `reason`, preempting if the best of them
    /// outranks the running thread. Returns how many threads woke.
    pub fn notify(&self, reason: WaitReason) -> usize {
        let _ig = InterruptGuard::new();
        let chain = self.queue.lock().steal();
        imp_notify(chain, reason)
    }

    /// Wake every waiter without the preemption check: used on paths that
    /// hold locks a switched-in thread might need (the kill loop under the
    /// process lock).
    pub fn notify_queued(&self, reason: WaitReason) -> usize {
        debug_assert!(!crate::arch::interrupts_enabled());
        let mut cursor = self.queue.lock().steal();
        let mut count = 0;
        while let Some(thread) = cursor {
            // SAFETY: stolen chain is exclusively ours.
            unsafe {
                cursor = thread.as_ref().take_next();
                thread.as_ref().wake(reason);
            }
            queue::enqueue(thread);
            count += 1;
        }
        count
    }

    /// Run `f` with the wait-queue lock held: subtype state updates that
    /// must be atomic with the satisfaction check use this.
    pub(crate) fn locked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _queue = self.queue.lock();
        f()
    }

    /// Pop one waiter off the queue without waking it yet; with nobody
    /// waiting, run `on_empty` before the lock drops so the subtype's
    /// fallback (latch the event, bank the unit) is atomic against a
    /// concurrent wait. Interrupts must already be masked.
    pub(crate) fn pop_or(&self, on_empty: impl FnOnce()) -> Option<NonNull<Thread>> {
        debug_assert!(!crate::arch::interrupts_enabled());
        let mut queue = self.queue.lock();
        let popped = queue.get();
        if popped.is_none() {
            on_empty();
        }
        popped
    }

    /// Remove a thread that is leaving the wait by another path (timeout).
    /// Linear scan; cancellation is the rare path.
    pub fn cancel(&self, thread: NonNull<Thread>) {
        debug_assert!(!crate::arch::interrupts_enabled());
        if !self.queue.lock().remove(thread) {
            bugcheck!(Reason::Corrupted, "cancelled thread not on wait queue");
        }
    }

    #[cfg(test)]
    pub(crate) fn test_park(&self, thread: NonNull<Thread>) {
        self.queue.lock().put(thread);
    }

    #[cfg(test)]
    pub(crate) fn test_queue_len(&self) -> usize {
        let queue = self.queue.lock();
        let mut len = 0;
        let mut cursor = queue.peek_head();
        while let Some(thread) = cursor {
            len += 1;
            cursor = unsafe { thread.as_ref().next() };
        }
        len
    }
}

impl Drop for Waitable {
    fn drop(&mut self) {
        // Destruction returns only after the wait queue has drained: any
        // still-waiting thread wakes deterministically.
        self.notify(WaitReason::Abandoned);
    }
}

/// Transition a stolen chain of waiters to READY and arbitrate preemption:
/// the best wakee switches in if it outranks the running thread.
pub(crate) fn imp_notify(chain: Option<NonNull<Thread>>, reason: WaitReason) -> usize {
    debug_assert!(!crate::arch::interrupts_enabled());
    let Some(first) = chain else {
        return 0;
    };
    let core = this_core();
    let current = core.current_thread();
    // SAFETY: current is this core's running thread; chain threads are
    // exclusively ours after the steal.
    let mut best_priority = unsafe { current.as_ref().priority() };
    let mut target: Option<NonNull<Thread>> = None;
    let mut count = 0;
    let mut cursor = Some(first);
    while let Some(thread) = cursor {
        // The link is consumed before the thread becomes visible to other
        // queues.
        cursor = unsafe { thread.as_ref().take_next() };
        unsafe { thread.as_ref().wake(reason) };
        let priority = unsafe { thread.as_ref().priority() };
        if priority < best_priority {
            if let Some(displaced) = target.replace(thread) {
                queue::enqueue(displaced);
            }
            best_priority = priority;
        } else {
            queue::enqueue(thread);
        }
        count += 1;
    }
    if let Some(target) = target {
        if unsafe { current.as_ref().is_stopped() } {
            queue::enqueue(target);
        } else {
            unsafe { current.as_ref().set_ready() };
            queue::enqueue(current);
            core.switch_to(target);
        }
    }
    count
}

/// One-shot timer callback for waits with a timeout. Ticket identity
/// defeats the race against a notify that already won.
pub(crate) fn on_timer(ticket: u64, thread: NonNull<Thread>) {
    debug_assert!(!crate::arch::interrupts_enabled());
    // SAFETY: the thread outlives its pending ticket; timer and wake paths
    // both run with interrupts masked.
    unsafe {
        if thread.as_ref().ticket() != ticket {
            return;
        }
        thread.as_ref().wake(WaitReason::Timeout);
    }
    sched::preempt_or_enqueue(thread);
}

/// Capability set shared by every object a handle can name.
pub trait KernelObject: Send + Sync {
    fn waitable(&self) -> &Waitable;

    fn kind(&self) -> ObjectKind;

    /// Non-consuming satisfaction probe (the `check` syscall).
    fn check(&self) -> bool;

    /// Consume-if-satisfied; runs under the wait-queue lock so the check
    /// is atomic with parking.
    fn try_consume(&self) -> bool {
        self.check()
    }

    /// Block until satisfied, notified, timed out, or abandoned.
    fn wait(&self, timeout_us: u64) -> WaitReason {
        self.waitable()
            .wait_with(timeout_us, || self.try_consume(), None)
    }

    /// Subtype signal (event set, semaphore release). Objects that cannot
    /// be signalled refuse.
    fn signal(&self, mode: u64) -> bool {
        let _ = mode;
        false
    }

    /// The byte-stream surface, for objects that have one (files and
    /// streams). Handle-based I/O dispatches through this.
    fn as_file(&self) -> Option<&dyn crate::io::FileObject> {
        None
    }

    fn acquire(&self) -> bool {
        self.waitable().acquire()
    }

    /// Drop one reference; `false` means the object is gone. The last
    /// reference triggers type-specific teardown (registry removal, table
    /// erasure, deallocation).
    fn relax(&self) -> bool;

    /// Registration hook for named/global objects: takes the second,
    /// owner-held reference.
    fn manage(&self) {
        self.waitable().manage_ref();
    }
}

/// Free a leaked heap object through its last reference.
///
/// # Safety
///
/// `obj` must have been created by `Box::leak`/`Box::into_raw`, no other
/// reference may remain, and it must not be used afterwards.
pub(crate) unsafe fn destroy<T>(obj: &T) {
    // SAFETY: forwarded to the caller.
    unsafe { drop(alloc::boxed::Box::from_raw(obj as *const T as *mut T)) };
}
