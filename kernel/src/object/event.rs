//! Event object
//!
//! A manual-reset boolean waitable: `signal_all` latches the state and
//! wakes everyone, `signal_one` hands the signal to a single waiter (or
//! latches if nobody waits), `reset` clears the latch.

use alloc::boxed::Box;
use alloc::string::String;

use core::sync::atomic::{AtomicBool, Ordering};

use crate::sync::InterruptGuard;

use super::registry;
use super::waitable::{destroy, imp_notify, KernelObject, ObjectKind, WaitReason, Waitable};

pub struct Event {
    waitable: Waitable,
    /// Mutated only under the wait-queue lock (or pre-publication).
    state: AtomicBool,
    name: Option<String>,
}

impl Event {
    /// Allocate an anonymous event; the returned reference is counted.
    pub fn create(initial: bool) -> &'static Event {
        Box::leak(Box::new(Event {
            waitable: Waitable::new(),
            state: AtomicBool::new(initial),
            name: None,
        }))
    }

    /// Allocate and publish a named event; fails if the name is taken.
    pub fn create_named(initial: bool, name: &str) -> Option<&'static Event> {
        let event: &'static Event = Box::leak(Box::new(Event {
            waitable: Waitable::new(),
            state: AtomicBool::new(initial),
            name: Some(String::from(name)),
        }));
        if registry::publish(name, event) {
            Some(event)
        } else {
            // SAFETY: never published, ours alone.
            unsafe { destroy(event) };
            None
        }
    }

    /// Latch the signal and wake every waiter.
    pub fn signal_all(&self) -> usize {
        {
            let _ig = InterruptGuard::new();
            self.waitable
                .locked(|| self.state.store(true, Ordering::Relaxed));
        }
        self.waitable.notify(WaitReason::Notify)
    }

    /// Wake exactly one waiter; latch if the queue is empty. Repeats on a
    /// pop that wakes nobody.
    pub fn signal_one(&self) -> bool {
        loop {
            let _ig = InterruptGuard::new();
            let popped = self
                .waitable
                .pop_or(|| self.state.store(true, Ordering::Relaxed));
            match popped {
                None => return false,
                Some(thread) => {
                    if imp_notify(Some(thread), WaitReason::Notify) != 0 {
                        return true;
                    }
                }
            }
        }
    }

    /// Clear the latch.
    pub fn reset(&self) {
        self.state.store(false, Ordering::Relaxed);
    }
}

impl KernelObject for Event {
    fn waitable(&self) -> &Waitable {
        &self.waitable
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Event
    }

    fn check(&self) -> bool {
        self.state.load(Ordering::Relaxed)
    }

    fn signal(&self, mode: u64) -> bool {
        if mode == 0 {
            self.signal_one()
        } else {
            self.signal_all() != 0 || self.check()
        }
    }

    fn relax(&self) -> bool {
        let _ig = InterruptGuard::new();
        if self.waitable.release_ref() > 0 {
            return true;
        }
        if let Some(name) = self.name.as_deref() {
            registry::erase(name);
        }
        // SAFETY: last reference just dropped.
        unsafe { destroy(self) };
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::testing;
    use crate::object::waitable::{KernelObject, WaitReason};

    #[test]
    fn latch_and_fast_path() {
        testing::init();
        let event = Event::create(false);
        assert!(!event.check());
        // No waiter: signal_one latches instead of waking.
        assert!(!event.signal_one());
        assert!(event.check());
        // The fast path consumes nothing on a manual-reset event.
        assert_eq!(event.wait(0), WaitReason::Passed);
        assert_eq!(event.wait(0), WaitReason::Passed);
        event.reset();
        assert!(!event.check());
        assert!(!event.relax());
    }

    #[test]
    fn signal_mode_dispatch() {
        testing::init();
        let event = Event::create(false);
        assert!(event.signal(1)); // all: latches
        assert!(event.check());
        event.reset();
        assert!(!event.signal(0) || event.check()); // one: latches when empty
        assert!(!event.relax());
    }

    #[test]
    fn named_events_resolve_until_last_relax() {
        testing::init();
        let event = Event::create_named(true, "boot.ready").unwrap();
        // Creator ref + registry's managed ref.
        assert_eq!(event.waitable().ref_count(), 2);
        assert!(Event::create_named(false, "boot.ready").is_none());

        let opened = crate::object::registry::open("boot.ready").unwrap();
        // SAFETY: open() acquired it.
        unsafe {
            assert!(opened.as_ref().check());
            assert!(opened.as_ref().relax());
        }
        // Dropping the creator still leaves the registry's reference.
        assert!(event.relax());
        assert!(crate::object::registry::open("boot.ready").is_some());
    }
}
