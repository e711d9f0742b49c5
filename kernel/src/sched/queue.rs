//! Thread queues
//!
//! [`ThreadQueue`] is the intrusive FIFO used by both the ready queue and
//! every waitable's wait queue; the link lives in the thread itself
//! (`Thread::next`), owned by whichever queue currently holds it.

use core::ptr::NonNull;

use lazy_static::lazy_static;

use crate::bugcheck::Reason;
use crate::process::thread::Thread;
use crate::sync::IrqMutex;

/// Priority levels; priority 0 is the most urgent, `MAX_PRIORITY - 1` is
/// reserved for idle threads.
pub const MAX_PRIORITY: u16 = 32;

/// Intrusive single-linked FIFO of threads.
pub struct ThreadQueue {
    head: Option<NonNull<Thread>>,
    tail: Option<NonNull<Thread>>,
}

// Thread pointers are only followed while the owning lock is held.
unsafe impl Send for ThreadQueue {}

impl ThreadQueue {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Append to the tail. The thread must not be on any queue.
    pub fn put(&mut self, thread: NonNull<Thread>) {
        // SAFETY: ownership of `next` transfers to this queue.
        unsafe {
            debug_assert!(thread.as_ref().next().is_none());
            thread.as_ref().set_next(None);
        }
        match self.tail {
            Some(tail) => {
                unsafe { tail.as_ref().set_next(Some(thread)) };
                self.tail = Some(thread);
            }
            None => {
                debug_assert!(self.head.is_none());
                self.head = Some(thread);
                self.tail = Some(thread);
            }
        }
    }

    /// Pop the head.
    pub fn get(&mut self) -> Option<NonNull<Thread>> {
        let head = self.head?;
        // SAFETY: this queue owns `next` of every linked thread.
        let next = unsafe { head.as_ref().take_next() };
        self.head = next;
        if next.is_none() {
            debug_assert_eq!(self.tail, Some(head));
            self.tail = None;
        }
        Some(head)
    }

    /// Head of the queue without detaching it.
    pub(crate) fn peek_head(&self) -> Option<NonNull<Thread>> {
        self.head
    }

    /// Detach the whole chain, leaving the queue empty. The caller walks
    /// the chain through the threads' own links.
    pub fn steal(&mut self) -> Option<NonNull<Thread>> {
        let head = self.head.take();
        self.tail = None;
        head
    }

    /// Unlink one thread, wherever it sits. Linear; removal is the rare
    /// path and FIFO pop is the optimized one.
    pub fn remove(&mut self, thread: NonNull<Thread>) -> bool {
        let Some(head) = self.head else {
            return false;
        };
        if head == thread {
            self.get();
            return true;
        }
        let mut prev = head;
        // SAFETY: links are owned by this queue for the whole walk.
        unsafe {
            while let Some(cursor) = prev.as_ref().next() {
                if cursor == thread {
                    let after = cursor.as_ref().take_next();
                    prev.as_ref().set_next(after);
                    if after.is_none() {
                        self.tail = Some(prev);
                    }
                    return true;
                }
                prev = cursor;
            }
        }
        false
    }
}

/// The global ready queue: one FIFO per priority level.
pub struct ReadyQueue {
    levels: [ThreadQueue; MAX_PRIORITY as usize],
}

impl ReadyQueue {
    fn new() -> Self {
        Self {
            levels: core::array::from_fn(|_| ThreadQueue::new()),
        }
    }

    fn put(&mut self, thread: NonNull<Thread>) {
        // SAFETY: priority reads are stable while the queue lock is held.
        let priority = unsafe { thread.as_ref().priority() };
        if priority >= MAX_PRIORITY {
            bugcheck!(Reason::OutOfRange, "thread priority {priority}");
        }
        self.levels[priority as usize].put(thread);
    }

    fn get(&mut self) -> Option<NonNull<Thread>> {
        self.levels.iter_mut().find_map(|level| level.get())
    }

    fn remove(&mut self, thread: NonNull<Thread>) -> bool {
        // Start at the level the priority says, but fall back to a full
        // scan: the priority may have been changed while the thread sat
        // queued.
        let priority = unsafe { thread.as_ref().priority() };
        if self.levels[priority as usize].remove(thread) {
            return true;
        }
        self.levels.iter_mut().any(|level| level.remove(thread))
    }
}

lazy_static! {
    static ref READY_QUEUE: IrqMutex<ReadyQueue> = IrqMutex::new(ReadyQueue::new());
}

/// Insert a READY thread, FIFO within its priority.
pub fn enqueue(thread: NonNull<Thread>) {
    READY_QUEUE.lock().put(thread);
}

/// Remove and return the highest-priority ready thread.
pub fn dequeue() -> Option<NonNull<Thread>> {
    READY_QUEUE.lock().get()
}

/// Take a specific thread off the ready queue (kill path).
pub fn unlink(thread: NonNull<Thread>) -> bool {
    READY_QUEUE.lock().remove(thread)
}
