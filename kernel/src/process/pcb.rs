//! Process object
//!
//! A process owns its virtual space, its threads, and a sparse handle
//! table. Its waitable side is terminal: notified once when the last
//! active thread stops.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::bugcheck::Reason;
use crate::mm::vspace::{kernel_space, UserSpace};
use crate::object::waitable::{KernelObject, ObjPtr, ObjectKind, WaitReason, Waitable};
use crate::sched;
use crate::sync::{InterruptGuard, IrqRwLock};
use crate::timer;

use super::table::process_manager;
use super::thread::{Thread, ThreadId};
use super::DEFAULT_STACK_PAGES;

pub type ProcessId = u32;

/// Privilege rings the executive understands; numerically lower is more
/// privileged.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Privilege {
    Kernel = 0,
    System = 1,
    User = 2,
}

impl Privilege {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Kernel),
            1 => Some(Self::System),
            2 => Some(Self::User),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running = 0,
    Stopped = 1,
}

/// Spawn-time description handed over by the creator. Stream references
/// are counted and donated to the new process.
pub struct StartupInfo {
    pub privilege: Privilege,
    pub std_streams: [Option<ObjPtr>; 3],
}

/// Arguments the loader thread starts with.
pub struct LoaderArgs {
    pub env: String,
    pub image_base: u64,
    pub image_size: u64,
    pub header_size: u64,
}

/// Either the shared kernel space or an owned user space.
pub enum SpaceRef {
    Kernel,
    User(UserSpace),
}

impl SpaceRef {
    /// The paging root a thread of this process needs, `None` when any
    /// root will do (kernel threads).
    pub fn cr3(&self) -> Option<u64> {
        match self {
            SpaceRef::Kernel => None,
            SpaceRef::User(space) => Some(space.cr3()),
        }
    }

    pub fn user(&self) -> Option<&UserSpace> {
        match self {
            SpaceRef::Kernel => None,
            SpaceRef::User(space) => Some(space),
        }
    }
}

struct ProcInner {
    threads: BTreeMap<ThreadId, Box<Thread>>,
    state: ProcessState,
    result: u32,
    /// Threads created and not yet exited.
    active: u32,
    /// Terminal teardown already ran.
    done: bool,
}

pub struct Process {
    id: ProcessId,
    waitable: Waitable,
    vspace: SpaceRef,
    inner: IrqRwLock<ProcInner>,
    handles: super::HandleTable,
    privilege: Privilege,
    command: String,
    /// User exception handler entry, settable from user mode.
    handler: AtomicU64,
    start_time: u64,
}

impl Process {
    /// The kernel process (id 0): shared kernel space, the boot thread as
    /// its initial member.
    pub(super) fn new_kernel(id: ProcessId) -> Box<Process> {
        debug_assert_eq!(id, 0);
        let process = Box::new(Process {
            id,
            waitable: Waitable::new(),
            vspace: SpaceRef::Kernel,
            inner: IrqRwLock::new(ProcInner {
                threads: BTreeMap::new(),
                state: ProcessState::Running,
                result: 0,
                active: 1,
                done: false,
            }),
            handles: super::HandleTable::new(),
            privilege: Privilege::Kernel,
            command: String::from("kernel"),
            handler: AtomicU64::new(0),
            start_time: 0,
        });
        let owner = NonNull::from(process.as_ref());
        let initial = Thread::new_initial(owner);
        initial.manage();
        let id = initial.id();
        process.inner.write().threads.insert(id, initial);
        process
    }

    /// A user process around a fresh user space. The image file reference
    /// becomes handle 0, the std streams handles 1..3; a loader thread is
    /// spawned with the image geometry.
    pub(super) fn new_user(
        id: ProcessId,
        command: String,
        image: ObjPtr,
        info: StartupInfo,
        args: LoaderArgs,
    ) -> Option<Box<Process>> {
        let Some(space) = UserSpace::new(
            kernel_space().pool(),
            crate::boot::user_space_base(),
            Some(kernel_space().shared_pdpt()),
        ) else {
            // SAFETY: donated references returned on the failure path.
            unsafe { image.as_ref().relax() };
            super::table::drop_streams(info.std_streams);
            return None;
        };
        let process = Box::new(Process {
            id,
            waitable: Waitable::new(),
            vspace: SpaceRef::User(space),
            inner: IrqRwLock::new(ProcInner {
                threads: BTreeMap::new(),
                state: ProcessState::Running,
                result: 0,
                active: 0,
                done: false,
            }),
            handles: super::HandleTable::new(),
            privilege: info.privilege,
            command,
            handler: AtomicU64::new(0),
            start_time: timer::running_time(),
        });
        // Image file as handle 0, not reachable from user allocation.
        if !process.handles.assign(0, image) {
            // SAFETY: assign refused, so the reference is still ours.
            unsafe { image.as_ref().relax() };
            super::table::drop_streams(info.std_streams);
            return None;
        }
        for (slot, stream) in info.std_streams.into_iter().enumerate() {
            if let Some(stream) = stream {
                if !process.handles.assign(slot as u32 + 1, stream) {
                    // SAFETY: refused, reference still ours.
                    unsafe { stream.as_ref().relax() };
                }
            }
        }
        log::debug!("spawned process {} ({})", process.id, process.command);
        let arg = Box::into_raw(Box::new(args)) as u64;
        let loader_rip = super::table::loader_entry as usize as u64;
        let Some(loader) = process.spawn(loader_rip, arg, 0) else {
            // SAFETY: the loader thread never took ownership.
            unsafe { drop(Box::from_raw(arg as *mut LoaderArgs)) };
            process.handles.clear();
            return None;
        };
        // The creator's thread reference is not kept.
        // SAFETY: just spawned, reference counted.
        unsafe { loader.as_ref().relax() };
        Some(process)
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn state(&self) -> ProcessState {
        self.inner.read().state
    }

    pub fn result(&self) -> u32 {
        self.inner.read().result
    }

    pub fn handler(&self) -> u64 {
        self.handler.load(Ordering::Acquire)
    }

    pub fn set_handler(&self, entry: u64) {
        self.handler.store(entry, Ordering::Release);
    }

    pub fn vspace(&self) -> &SpaceRef {
        &self.vspace
    }

    pub fn handles(&self) -> &super::HandleTable {
        &self.handles
    }

    /// Record the exit code before the last thread stops.
    pub fn set_result(&self, result: u32) {
        self.inner.write().result = result;
    }

    /// Create a thread in this process. The new thread's reference is
    /// returned acquired for the caller.
    pub fn spawn(&self, entry: u64, arg: u64, stack_pages: usize) -> Option<NonNull<Thread>> {
        let pages = if stack_pages == 0 {
            DEFAULT_STACK_PAGES
        } else {
            stack_pages
        };
        if self.state() == ProcessState::Stopped {
            return None;
        }
        let owner = NonNull::from(self);
        let thread = Thread::new(owner, entry, arg, pages, super::thread::DEFAULT_PRIORITY)?;
        let ptr = NonNull::from(thread.as_ref());
        {
            let mut inner = self.inner.write();
            if inner.state == ProcessState::Stopped {
                // Lost the race against kill; unwind the half-made thread.
                drop(inner);
                let _ig = InterruptGuard::new();
                // SAFETY: never published, never enqueued.
                unsafe { thread.set_stopped() };
                if thread.kstack_pages() > 0 {
                    kernel_space().release(thread.kstack_base(), thread.kstack_pages());
                }
                return None;
            }
            thread.manage();
            inner.threads.insert(thread.id(), thread);
            inner.active += 1;
        }
        {
            let _ig = InterruptGuard::new();
            sched::preempt_or_enqueue(ptr);
        }
        Some(ptr)
    }

    /// Stop every thread; if the caller is one of them it is killed last so
    /// the current stack stays valid through the loop.
    pub fn kill(&self, result: u32) {
        log::debug!("killing process {}", self.id);
        let core = sched::this_core();
        let current = core.current_thread();
        let mut kill_self = false;
        let mut reaped = alloc::vec::Vec::new();
        {
            let mut inner = self.inner.write();
            inner.state = ProcessState::Stopped;
            inner.result = result;
            for thread in inner.threads.values() {
                let ptr = NonNull::from(thread.as_ref());
                if ptr == current {
                    kill_self = true;
                    continue;
                }
                if !thread.is_stopped() {
                    // SAFETY: process lock held, interrupts masked by it.
                    unsafe { Thread::kill(ptr) };
                    reaped.push(ptr);
                }
            }
            debug_assert!(inner.active >= reaped.len() as u32 + u32::from(kill_self));
            inner.active -= reaped.len() as u32;
        }
        // Drop the table's reference on each thread that will never reach
        // its own exit path. Outside the lock: the last drop re-enters the
        // thread map.
        for ptr in reaped {
            // SAFETY: STOPPED and off-CPU; the map still pins the object.
            unsafe { ptr.as_ref().relax() };
        }
        if kill_self {
            Thread::exit();
        } else {
            self.finish_if_idle();
        }
    }

    /// Create this core's idle thread inside the kernel process. Idle
    /// threads never exit, so they do not join the active count.
    pub fn spawn_idle(&self) -> Option<NonNull<Thread>> {
        let owner = NonNull::from(self);
        let thread = Thread::new_idle(owner, crate::boot::idle_entry)?;
        let ptr = NonNull::from(thread.as_ref());
        let mut inner = self.inner.write();
        thread.manage();
        inner.threads.insert(thread.id(), thread);
        Some(ptr)
    }

    /// Host-harness support: a thread that exists only as a scheduling
    /// object, never dispatched for real.
    #[cfg(not(target_os = "none"))]
    pub fn spawn_parked(&self, priority: u16) -> Option<NonNull<Thread>> {
        let owner = NonNull::from(self);
        let entry = crate::boot::idle_entry as usize as u64;
        let thread = Thread::new(owner, entry, 0, 1, priority)?;
        let ptr = NonNull::from(thread.as_ref());
        let mut inner = self.inner.write();
        thread.manage();
        inner.threads.insert(thread.id(), thread);
        inner.active += 1;
        Some(ptr)
    }

    /// Forcibly stop a single thread. Refuses the caller itself, which
    /// must go through the exit path instead.
    pub fn kill_one(&self, thread: NonNull<Thread>) -> bool {
        let current = sched::this_core().current_thread();
        if thread == current {
            return false;
        }
        {
            let mut inner = self.inner.write();
            // SAFETY: thread pointers handed out by this process are
            // pinned by the map.
            if unsafe { thread.as_ref().is_stopped() } {
                return false;
            }
            // SAFETY: process lock held, interrupts masked by it.
            unsafe { Thread::kill(thread) };
            debug_assert!(inner.active > 0);
            inner.active -= 1;
        }
        // The table's reference: the thread never reaches its exit path.
        // SAFETY: STOPPED and off-CPU; the map still pins the object.
        unsafe { thread.as_ref().relax() };
        self.finish_if_idle();
        true
    }

    /// Exit hook for every dying thread: the last one out stops the
    /// process, wakes its waiters and clears the handle table.
    pub(crate) fn on_thread_exit(&self, _thread: NonNull<Thread>) {
        let finished = {
            let mut inner = self.inner.write();
            debug_assert!(inner.active > 0);
            inner.active -= 1;
            if inner.active == 0 && !inner.done {
                inner.state = ProcessState::Stopped;
                inner.done = true;
                true
            } else {
                false
            }
        };
        if finished {
            self.on_last_exit();
        }
    }

    fn finish_if_idle(&self) {
        let finished = {
            let mut inner = self.inner.write();
            if inner.active == 0 && !inner.done {
                inner.done = true;
                true
            } else {
                false
            }
        };
        if finished {
            self.on_last_exit();
        }
    }

    fn on_last_exit(&self) {
        log::debug!("process {} exited with {:#x}", self.id, self.result());
        {
            let _ig = InterruptGuard::new();
            self.waitable.notify_queued(WaitReason::Notify);
        }
        self.handles.clear();
    }

    /// Drop a finished thread once its last reference is gone; the empty
    /// map releases the process's own table reference.
    pub(crate) fn erase_thread(&self, id: ThreadId) {
        let empty = {
            let mut inner = self.inner.write();
            if inner.threads.remove(&id).is_none() {
                bugcheck!(Reason::Corrupted, "thread {id} missing from process {}", self.id);
            }
            inner.threads.is_empty()
        };
        if empty {
            debug_assert_eq!(self.inner.read().active, 0);
            self.relax();
        }
    }

    /// Look up a thread by id, optionally taking a reference.
    pub fn find_thread(&self, id: ThreadId, acquire: bool) -> Option<NonNull<Thread>> {
        let inner = self.inner.read();
        let thread = inner.threads.get(&id)?;
        if acquire && !thread.acquire() {
            return None;
        }
        Some(NonNull::from(thread.as_ref()))
    }

    pub fn thread_count(&self) -> usize {
        self.inner.read().threads.len()
    }
}

impl KernelObject for Process {
    fn waitable(&self) -> &Waitable {
        &self.waitable
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Process
    }

    /// Terminal: satisfied exactly when STOPPED.
    fn check(&self) -> bool {
        self.state() == ProcessState::Stopped
    }

    fn relax(&self) -> bool {
        let _ig = InterruptGuard::new();
        if self.waitable.release_ref() > 0 {
            return true;
        }
        process_manager().erase(self.id);
        false
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        let inner = self.inner.read();
        if !inner.threads.is_empty() || inner.active != 0 {
            bugcheck!(
                Reason::Corrupted,
                "dropping process {} with {} threads ({} active)",
                self.id,
                inner.threads.len(),
                inner.active
            );
        }
        log::debug!("deleted process {}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::testing;
    use crate::process::thread::ThreadState;
    use crate::sched::queue;
    use crate::sync::InterruptGuard;

    #[test]
    fn kill_one_stops_a_queued_thread() {
        let _order = testing::serialize();
        testing::reset_current();
        let harness = testing::init();
        // SAFETY: the kernel process lives forever.
        let process = unsafe { harness.kernel_process.as_ref() };
        let thread = process.spawn_parked(25).unwrap();
        {
            let _ig = InterruptGuard::new();
            queue::enqueue(thread);
        }
        assert!(process.kill_one(thread));
        // SAFETY: harness thread, still pinned by outstanding references.
        unsafe {
            assert_eq!(thread.as_ref().state(), ThreadState::Stopped);
        }
        assert!(!process.kill_one(thread));
        // The kernel process itself never stops.
        assert_eq!(process.state(), ProcessState::Running);
        testing::reset_current();
    }

    #[test]
    fn kernel_process_is_not_satisfied() {
        let harness = testing::init();
        // SAFETY: the kernel process lives forever.
        let process = unsafe { harness.kernel_process.as_ref() };
        assert!(!process.check());
        assert_eq!(process.id(), 0);
        assert_eq!(process.privilege(), Privilege::Kernel);
    }

    #[test]
    fn handler_entry_roundtrip() {
        let harness = testing::init();
        // SAFETY: the kernel process lives forever.
        let process = unsafe { harness.kernel_process.as_ref() };
        process.set_handler(0x7000_1000);
        assert_eq!(process.handler(), 0x7000_1000);
        process.set_handler(0);
    }
}
