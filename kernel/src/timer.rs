//! One-shot timer service
//!
//! The core consumes a single operation from the platform timer: schedule a
//! one-shot callback with cancel. Tickets are never reused; the waitable
//! wake paths compare ticket identity to defeat the race between a timeout
//! firing and a notify cancelling it. The interrupt path calls
//! [`tick`] with elapsed microseconds; callbacks run with interrupts
//! masked and must not block.

use alloc::collections::BTreeMap;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::process::thread::Thread;
use crate::sync::IrqMutex;

/// Fired when a one-shot deadline passes: `(ticket, thread)`.
pub type Callback = fn(u64, NonNull<Thread>);

struct Entry {
    ticket: u64,
    deadline: u64,
    callback: Callback,
    thread: NonNull<Thread>,
}

// Entries reference threads owned by their processes; the queue only
// touches them inside the masked callback window.
unsafe impl Send for Entry {}

struct TimerQueue {
    /// ticket -> pending one-shot
    pending: BTreeMap<u64, Entry>,
    /// (deadline, ticket) ordering for expiry scans
    order: BTreeMap<(u64, u64), u64>,
}

static QUEUE: IrqMutex<Option<TimerQueue>> = IrqMutex::new(None);
static NOW_US: AtomicU64 = AtomicU64::new(0);
static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

fn with_queue<R>(f: impl FnOnce(&mut TimerQueue) -> R) -> R {
    let mut guard = QUEUE.lock();
    let queue = guard.get_or_insert_with(|| TimerQueue {
        pending: BTreeMap::new(),
        order: BTreeMap::new(),
    });
    f(queue)
}

/// Microseconds since boot.
pub fn running_time() -> u64 {
    NOW_US.load(Ordering::Acquire)
}

/// Schedule `callback(ticket, thread)` to fire once, `us` microseconds from
/// now. Returns the ticket; zero is never a valid ticket.
pub fn put(us: u64, callback: Callback, thread: NonNull<Thread>) -> u64 {
    debug_assert!(us > 0);
    let ticket = NEXT_TICKET.fetch_add(1, Ordering::Relaxed);
    let deadline = running_time() + us;
    with_queue(|queue| {
        queue.order.insert((deadline, ticket), ticket);
        queue.pending.insert(
            ticket,
            Entry {
                ticket,
                deadline,
                callback,
                thread,
            },
        );
    });
    ticket
}

/// Cancel a pending one-shot. Returns false if it already fired or never
/// existed; the caller's ticket-identity check makes that benign.
pub fn cancel(ticket: u64) -> bool {
    with_queue(|queue| match queue.pending.remove(&ticket) {
        Some(entry) => {
            queue.order.remove(&(entry.deadline, ticket));
            true
        }
        None => false,
    })
}

/// Advance time and fire everything that came due. Called from the timer
/// interrupt with interrupts masked; callbacks run outside the queue lock
/// so they may reschedule.
pub fn tick(elapsed_us: u64) {
    debug_assert!(!crate::arch::interrupts_enabled());
    let now = NOW_US.fetch_add(elapsed_us, Ordering::AcqRel) + elapsed_us;
    loop {
        let due = with_queue(|queue| {
            let (&(deadline, ticket), _) = queue.order.iter().next()?;
            if deadline > now {
                return None;
            }
            queue.order.remove(&(deadline, ticket));
            queue.pending.remove(&ticket)
        });
        let Some(entry) = due else { break };
        (entry.callback)(entry.ticket, entry.thread);
    }
}

/// Pending one-shot count. Test observability.
pub fn pending() -> usize {
    with_queue(|queue| queue.pending.len())
}

/// Drop every pending one-shot without firing it. Test-harness support on
/// hosted targets.
#[cfg(not(target_os = "none"))]
pub fn clear_all() {
    with_queue(|queue| {
        queue.pending.clear();
        queue.order.clear();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::testing;
    use crate::sync::InterruptGuard;

    use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    static FIRED: AtomicUsize = AtomicUsize::new(0);
    static LAST_TICKET: AtomicU64 = AtomicU64::new(0);

    fn record(ticket: u64, _thread: NonNull<Thread>) {
        FIRED.fetch_add(1, Ordering::SeqCst);
        LAST_TICKET.store(ticket, Ordering::SeqCst);
    }

    fn victim() -> NonNull<Thread> {
        let harness = testing::init();
        // SAFETY: the kernel process lives forever.
        unsafe { harness.kernel_process.as_ref() }
            .spawn_parked(30)
            .expect("timer thread")
    }

    #[test]
    fn one_shots_fire_in_deadline_order() {
        let _order = testing::serialize();
        testing::reset_current();
        FIRED.store(0, Ordering::SeqCst);
        let thread = victim();
        let late = put(5_000, record, thread);
        let early = put(1_000, record, thread);
        assert_ne!(late, early);
        assert_eq!(pending(), 2);

        let _ig = InterruptGuard::new();
        tick(999);
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
        tick(1);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        assert_eq!(LAST_TICKET.load(Ordering::SeqCst), early);
        tick(4_000);
        assert_eq!(FIRED.load(Ordering::SeqCst), 2);
        assert_eq!(LAST_TICKET.load(Ordering::SeqCst), late);
        assert_eq!(pending(), 0);
    }

    #[test]
    fn cancel_defeats_a_pending_shot() {
        let _order = testing::serialize();
        testing::reset_current();
        FIRED.store(0, Ordering::SeqCst);
        let thread = victim();
        let ticket = put(2_000, record, thread);
        assert!(cancel(ticket));
        assert!(!cancel(ticket));
        let _ig = InterruptGuard::new();
        tick(10_000);
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tickets_are_never_reused() {
        let _order = testing::serialize();
        testing::reset_current();
        let thread = victim();
        let a = put(1_000, record, thread);
        let b = put(1_000, record, thread);
        assert!(a != 0 && b != 0 && a != b);
        cancel(a);
        cancel(b);
    }
}
