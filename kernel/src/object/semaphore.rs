//! Counting semaphore
//!
//! `{total, count}`: a wait succeeds immediately while `count > 0`,
//! decrementing it; a signal hands the unit to one waiter or, with nobody
//! waiting, returns it to the count (never past `total`).

use alloc::boxed::Box;
use alloc::string::String;

use core::sync::atomic::{AtomicU32, Ordering};

use crate::sync::InterruptGuard;

use super::registry;
use super::waitable::{destroy, imp_notify, KernelObject, ObjectKind, WaitReason, Waitable};

pub struct Semaphore {
    waitable: Waitable,
    total: u32,
    /// Units currently available; mutated only under the wait-queue lock.
    count: AtomicU32,
    name: Option<String>,
}

impl Semaphore {
    pub fn create(initial: u32) -> &'static Semaphore {
        Box::leak(Box::new(Semaphore {
            waitable: Waitable::new(),
            total: initial,
            count: AtomicU32::new(initial),
            name: None,
        }))
    }

    pub fn create_named(initial: u32, name: &str) -> Option<&'static Semaphore> {
        let semaphore: &'static Semaphore = Box::leak(Box::new(Semaphore {
            waitable: Waitable::new(),
            total: initial,
            count: AtomicU32::new(initial),
            name: Some(String::from(name)),
        }));
        if registry::publish(name, semaphore) {
            Some(semaphore)
        } else {
            // SAFETY: never published, ours alone.
            unsafe { destroy(semaphore) };
            None
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Release one unit: wake a waiter if any, else bank the unit. False
    /// when the count is already full.
    pub fn release_one(&self) -> bool {
        loop {
            let _ig = InterruptGuard::new();
            let mut banked = false;
            let popped = self.waitable.pop_or(|| {
                let count = self.count.load(Ordering::Relaxed);
                if count < self.total {
                    self.count.store(count + 1, Ordering::Relaxed);
                    banked = true;
                }
            });
            match popped {
                None => return banked,
                Some(thread) => {
                    if imp_notify(Some(thread), WaitReason::Notify) != 0 {
                        return true;
                    }
                }
            }
        }
    }
}

impl KernelObject for Semaphore {
    fn waitable(&self) -> &Waitable {
        &self.waitable
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Semaphore
    }

    fn check(&self) -> bool {
        self.count.load(Ordering::Relaxed) > 0
    }

    fn try_consume(&self) -> bool {
        let count = self.count.load(Ordering::Relaxed);
        if count > 0 {
            self.count.store(count - 1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn signal(&self, _mode: u64) -> bool {
        self.release_one()
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
    fn counts_bound_the_fast_path() {
        testing::init();
        let semaphore = Semaphore::create(2);
        assert_eq!(semaphore.wait(0), WaitReason::Passed);
        assert_eq!(semaphore.wait(0), WaitReason::Passed);
        assert_eq!(semaphore.count(), 0);
        assert!(!semaphore.check());
        // Nobody waiting: the unit goes back to the count.
        assert!(semaphore.release_one());
        assert_eq!(semaphore.count(), 1);
        assert!(semaphore.release_one());
        // Full: further releases refuse.
        assert!(!semaphore.release_one());
        assert_eq!(semaphore.count(), semaphore.total());
        assert!(!semaphore.relax());
    }

    #[test]
    fn release_hands_off_to_a_waiter() {
        let _order = testing::serialize();
        testing::reset_current();
        let harness = testing::init();
        let semaphore = Semaphore::create(0);
        // SAFETY: the kernel process lives forever.
        let thread = unsafe { harness.kernel_process.as_ref() }
            .spawn_parked(30)
            .unwrap();
        {
            let _ig = crate::sync::InterruptGuard::new();
            // SAFETY: harness thread, never dispatched.
            unsafe {
                thread.as_ref().set_running();
                thread
                    .as_ref()
                    .set_waiting(0, Some(core::ptr::NonNull::from(semaphore.waitable())));
            }
            semaphore.waitable().test_park(thread);
        }
        // The unit goes to the waiter, not the count.
        assert!(semaphore.release_one());
        assert_eq!(semaphore.count(), 0);
        // SAFETY: harness thread.
        unsafe {
            assert_eq!(thread.as_ref().last_reason(), WaitReason::Notify);
        }
        assert!(!semaphore.relax());
        testing::reset_current();
    }
}
