//! Service facade
//!
//! The single kernel entry surface presented to user mode. Each call takes
//! register-sized arguments; user buffers are referenced by virtual
//! address and length and validated against the caller's own space (with
//! the space pinned so a concurrent release cannot pull the pages away).
//! Register-level dispatch (interrupt gates, MSRs) lives outside the core.

use alloc::string::String;
use alloc::vec;

use core::ptr::NonNull;

use crate::error::Status;
use crate::mm::vspace::UserSpace;
use crate::mm::PageAttr;
use crate::object::waitable::{KernelObject, ObjPtr, ObjectKind};
use crate::object::{registry, Event, Semaphore};
use crate::process::{
    process_manager, Privilege, Process, ProcessState, StartupInfo, Thread,
};
use crate::sched::this_core;
use crate::timer;

/// Process-local object name, as user mode sees it.
pub type Handle = u32;

/// Longest name accepted by `open_handle`/`create_object`.
const NAME_LIMIT: usize = 64;

/// Kinds accepted by `create_object`.
const OBJECT_EVENT: u64 = ObjectKind::Event as u64;
const OBJECT_SEMAPHORE: u64 = ObjectKind::Semaphore as u64;

/// A resolved handle: the reference drops when the lock does.
struct HandleLock {
    obj: ObjPtr,
}

impl HandleLock {
    fn resolve(process: &Process, handle: Handle) -> Option<HandleLock> {
        let obj = process.handles().get(handle)?;
        Some(HandleLock { obj })
    }

    fn get(&self) -> &dyn KernelObject {
        // SAFETY: the acquired reference keeps the object live.
        unsafe { self.obj.as_ref() }
    }
}

impl Drop for HandleLock {
    fn drop(&mut self) {
        // SAFETY: dropping the reference `resolve` acquired.
        unsafe { self.obj.as_ref().relax() };
    }
}

/// Display output surface, installed by whoever owns the framebuffer.
pub trait DisplaySurface: Send + Sync {
    fn fill(&self, color: u32, left_top: u64, right_bottom: u64) -> bool;
    fn draw(&self, data: &[u8], left_top: u64, right_bottom: u64) -> bool;
}

static DISPLAY: crate::sync::IrqMutex<Option<&'static dyn DisplaySurface>> =
    crate::sync::IrqMutex::new(None);

pub fn set_display(surface: &'static dyn DisplaySurface) {
    *DISPLAY.lock() = Some(surface);
}

/// Fixed-layout prefix of the `create_process` user buffer; the command
/// line and environment strings follow it back to back.
#[repr(C)]
#[derive(Clone, Copy)]
struct CreateProcessHeader {
    privilege: u8,
    _reserved: [u8; 3],
    std_streams: [Handle; 3],
    command_len: u32,
    environment_len: u32,
}

/// Per-entry state of one service call: the calling thread, its process
/// and (for user callers) its space.
pub struct ServiceProvider {
    thread: NonNull<Thread>,
    process: NonNull<Process>,
}

impl ServiceProvider {
    /// Snapshot the caller. Constructed at every kernel entry.
    pub fn new() -> ServiceProvider {
        let thread = this_core().current_thread();
        // SAFETY: the current thread and its owner are live.
        let process = unsafe { thread.as_ref().owner_ptr() };
        ServiceProvider { thread, process }
    }

    fn this_thread(&self) -> &Thread {
        // SAFETY: current thread, live for the call.
        unsafe { self.thread.as_ref() }
    }

    fn this_process(&self) -> &Process {
        // SAFETY: owner of the current thread, live for the call.
        unsafe { self.process.as_ref() }
    }

    fn user_space(&self) -> Option<&UserSpace> {
        self.this_process().vspace().user()
    }

    /// Copy `len` bytes out of a validated user buffer.
    fn read_user(&self, va: u64, len: usize) -> Option<alloc::vec::Vec<u8>> {
        let space = self.user_space()?;
        let _pin = space.validate(va, len, false)?;
        let mut buf = vec![0u8; len];
        // SAFETY: validated committed+user range, pinned by `_pin`.
        unsafe { core::ptr::copy_nonoverlapping(va as *const u8, buf.as_mut_ptr(), len) };
        Some(buf)
    }

    /// Copy into a validated, writable user buffer. Returns bytes written.
    fn write_user(&self, va: u64, data: &[u8]) -> Option<usize> {
        let space = self.user_space()?;
        let _pin = space.validate(va, data.len(), true)?;
        // SAFETY: validated writable range, pinned by `_pin`.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), va as *mut u8, data.len()) };
        Some(data.len())
    }

    fn read_name(&self, va: u64, len: usize) -> Option<String> {
        if len == 0 || len > NAME_LIMIT {
            return None;
        }
        let bytes = self.read_user(va, len)?;
        String::from_utf8(bytes).ok()
    }

    // --- process calls -----------------------------------------------

    /// Basic system description: `{uptime_us, process_count, free_frames}`
    /// written to the caller's buffer. Returns bytes written.
    pub fn os_info(&self, buffer: u64, limit: u32) -> u64 {
        let mut info = [0u8; 24];
        info[0..8].copy_from_slice(&timer::running_time().to_le_bytes());
        let mut count = 0u64;
        let mut id = 0;
        while let Some(next) = process_manager().enumerate(id) {
            if next == 0 {
                break;
            }
            count += 1;
            id = next;
        }
        info[8..16].copy_from_slice(&count.to_le_bytes());
        let free = crate::mm::vspace::kernel_space().pool().available() as u64;
        info[16..24].copy_from_slice(&free.to_le_bytes());
        let len = info.len().min(limit as usize);
        match self.write_user(buffer, &info[..len]) {
            Some(written) => written as u64,
            None => 0,
        }
    }

    pub fn get_time(&self) -> u64 {
        timer::running_time()
    }

    /// Id-ordered enumeration; 0 starts over, 0 returned at the end.
    pub fn enum_process(&self, id: u32) -> u64 {
        process_manager().enumerate(id).unwrap_or(0) as u64
    }

    /// Handle to the calling process.
    pub fn get_process(&self) -> Handle {
        let process = self.this_process();
        if !process.acquire() {
            return 0;
        }
        let obj: &dyn KernelObject = process;
        let handle = process.handles().put(ObjPtr::from(obj));
        if handle == 0 {
            process.relax();
        }
        handle
    }

    pub fn process_id(&self, handle: Handle) -> u64 {
        let Some(lock) = HandleLock::resolve(self.this_process(), handle) else {
            return 0;
        };
        match lock.get().kind() {
            ObjectKind::Process => {
                // SAFETY: kind-checked; Process is the only object with
                // that kind.
                let process = unsafe { &*(lock.obj.as_ptr() as *const Process) };
                process.id() as u64
            }
            _ => 0,
        }
    }

    /// `{id, privilege, state, result, start_time, threads}` packed into
    /// the caller's buffer. Returns bytes written.
    pub fn process_info(&self, handle: Handle, buffer: u64, limit: u32) -> u64 {
        let Some(lock) = HandleLock::resolve(self.this_process(), handle) else {
            return 0;
        };
        if lock.get().kind() != ObjectKind::Process {
            return 0;
        }
        // SAFETY: kind-checked.
        let process = unsafe { &*(lock.obj.as_ptr() as *const Process) };
        let mut info = [0u8; 32];
        info[0..4].copy_from_slice(&process.id().to_le_bytes());
        info[4] = process.privilege() as u8;
        info[5] = process.state() as u8;
        info[8..12].copy_from_slice(&process.result().to_le_bytes());
        info[16..24].copy_from_slice(&process.start_time().to_le_bytes());
        info[24..28].copy_from_slice(&(process.thread_count() as u32).to_le_bytes());
        let len = info.len().min(limit as usize);
        self.write_user(buffer, &info[..len]).unwrap_or(0) as u64
    }

    /// Copy the process command line; returns the full length (callers
    /// retry with a bigger buffer when it exceeds `limit`).
    pub fn get_command(&self, handle: Handle, buffer: u64, limit: u32) -> u64 {
        let Some(lock) = HandleLock::resolve(self.this_process(), handle) else {
            return 0;
        };
        if lock.get().kind() != ObjectKind::Process {
            return 0;
        }
        // SAFETY: kind-checked.
        let process = unsafe { &*(lock.obj.as_ptr() as *const Process) };
        let command = process.command().as_bytes();
        let len = command.len().min(limit as usize);
        if len > 0 && self.write_user(buffer, &command[..len]).is_none() {
            return 0;
        }
        command.len() as u64
    }

    /// Terminate the calling process with `result`. Does not return on
    /// bare metal.
    pub fn exit_process(&self, result: u32) {
        self.this_process().kill(result);
    }

    pub fn kill_process(&self, handle: Handle, result: u32) -> Status {
        let Some(lock) = HandleLock::resolve(self.this_process(), handle) else {
            return Status::BadHandle;
        };
        if lock.get().kind() != ObjectKind::Process {
            return Status::BadHandle;
        }
        // SAFETY: kind-checked.
        let process = unsafe { &*(lock.obj.as_ptr() as *const Process) };
        if process.privilege() < self.this_process().privilege() {
            return Status::Denied;
        }
        process.kill(result);
        Status::Success
    }

    /// Spawn a process described by a [`CreateProcessHeader`] buffer.
    /// Returns a handle to the new process, 0 on rejection.
    pub fn create_process(&self, info: u64, length: u32) -> Handle {
        const HEADER: usize = core::mem::size_of::<CreateProcessHeader>();
        if (length as usize) < HEADER {
            return 0;
        }
        let Some(bytes) = self.read_user(info, length as usize) else {
            return 0;
        };
        // SAFETY: the buffer holds at least a full header.
        let header = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const CreateProcessHeader) };
        let Some(privilege) = Privilege::from_raw(header.privilege) else {
            return 0;
        };
        let command_len = header.command_len as usize;
        let environment_len = header.environment_len as usize;
        if HEADER + command_len + environment_len > bytes.len() || command_len == 0 {
            return 0;
        }
        let Ok(command) = core::str::from_utf8(&bytes[HEADER..HEADER + command_len]) else {
            return 0;
        };
        let environment =
            core::str::from_utf8(&bytes[HEADER + command_len..HEADER + command_len + environment_len])
                .unwrap_or("");

        // Donate one reference per std stream to the child.
        let mut streams: [Option<ObjPtr>; 3] = [None; 3];
        for (slot, &handle) in header.std_streams.iter().enumerate() {
            if handle != 0 {
                streams[slot] = self.this_process().handles().get(handle);
            }
        }
        let started = process_manager().spawn(
            String::from(command),
            String::from(environment),
            StartupInfo {
                privilege,
                std_streams: streams,
            },
        );
        let Some(child) = started else {
            return 0;
        };
        // SAFETY: spawn returned a managed process; take the creator's
        // reference for the handle.
        let child_ref = unsafe { child.as_ref() };
        let obj: &dyn KernelObject = child_ref;
        let handle = self.this_process().handles().put(ObjPtr::from(obj));
        if handle == 0 {
            child_ref.relax();
        }
        handle
    }

    /// Exit code of a stopped process; 0 while it still runs.
    pub fn process_result(&self, handle: Handle) -> u64 {
        let Some(lock) = HandleLock::resolve(self.this_process(), handle) else {
            return 0;
        };
        if lock.get().kind() != ObjectKind::Process {
            return 0;
        }
        // SAFETY: kind-checked.
        let process = unsafe { &*(lock.obj.as_ptr() as *const Process) };
        if process.state() != ProcessState::Stopped {
            return 0;
        }
        process.result() as u64
    }

    pub fn open_process(&self, id: u32) -> Handle {
        let Some(process) = process_manager().find(id, true) else {
            return 0;
        };
        // SAFETY: found with an acquired reference.
        let process_ref = unsafe { process.as_ref() };
        let obj: &dyn KernelObject = process_ref;
        let handle = self.this_process().handles().put(ObjPtr::from(obj));
        if handle == 0 {
            process_ref.relax();
        }
        handle
    }

    // --- thread calls ------------------------------------------------

    /// Handle to the calling thread.
    pub fn get_thread(&self) -> Handle {
        let thread = self.this_thread();
        if !thread.acquire() {
            return 0;
        }
        let obj: &dyn KernelObject = thread;
        let handle = self.this_process().handles().put(ObjPtr::from(obj));
        if handle == 0 {
            thread.relax();
        }
        handle
    }

    pub fn thread_id(&self, handle: Handle) -> u64 {
        let Some(lock) = HandleLock::resolve(self.this_process(), handle) else {
            return 0;
        };
        match lock.get().kind() {
            ObjectKind::Thread => {
                // SAFETY: kind-checked.
                let thread = unsafe { &*(lock.obj.as_ptr() as *const Thread) };
                thread.id() as u64
            }
            _ => 0,
        }
    }

    pub fn get_priority(&self, handle: Handle) -> u64 {
        let Some(lock) = HandleLock::resolve(self.this_process(), handle) else {
            return u64::MAX;
        };
        if lock.get().kind() != ObjectKind::Thread {
            return u64::MAX;
        }
        // SAFETY: kind-checked.
        let thread = unsafe { &*(lock.obj.as_ptr() as *const Thread) };
        thread.priority() as u64
    }

    pub fn set_priority(&self, handle: Handle, value: u16) -> Status {
        let Some(lock) = HandleLock::resolve(self.this_process(), handle) else {
            return Status::BadHandle;
        };
        if lock.get().kind() != ObjectKind::Thread {
            return Status::BadHandle;
        }
        // SAFETY: kind-checked.
        let thread = unsafe { &*(lock.obj.as_ptr() as *const Thread) };
        if thread.set_priority(value) {
            Status::Success
        } else {
            Status::OutOfRange
        }
    }

    pub fn get_handler(&self) -> u64 {
        self.this_process().handler()
    }

    pub fn set_handler(&self, entry: u64) -> Status {
        self.this_process().set_handler(entry);
        Status::Success
    }

    /// Create a thread at `entry` with `arg` in its argument register.
    /// Returns a handle to it, 0 on rejection.
    pub fn create_thread(&self, entry: u64, arg: u64, stack_size: u32) -> Handle {
        let stack_pages = (stack_size as usize).div_ceil(crate::mm::PAGE_SIZE);
        let Some(thread) = self.this_process().spawn(entry, arg, stack_pages) else {
            return 0;
        };
        // SAFETY: spawn returns the creator's acquired reference.
        let thread_ref = unsafe { thread.as_ref() };
        let obj: &dyn KernelObject = thread_ref;
        let handle = self.this_process().handles().put(ObjPtr::from(obj));
        if handle == 0 {
            thread_ref.relax();
        }
        handle
    }

    /// Terminate the calling thread. Does not return on bare metal.
    pub fn exit_thread(&self) {
        Thread::exit();
    }

    pub fn kill_thread(&self, handle: Handle) -> Status {
        let Some(lock) = HandleLock::resolve(self.this_process(), handle) else {
            return Status::BadHandle;
        };
        if lock.get().kind() != ObjectKind::Thread {
            return Status::BadHandle;
        }
        // SAFETY: kind-checked.
        let thread_ptr =
            unsafe { NonNull::new_unchecked(lock.obj.as_ptr() as *mut Thread) };
        let owner = unsafe { thread_ptr.as_ref().owner() };
        if thread_ptr == self.thread {
            drop(lock);
            Thread::exit();
            return Status::Success;
        }
        if owner.kill_one(thread_ptr) {
            Status::Success
        } else {
            Status::Failed
        }
    }

    pub fn sleep(&self, us: u64) {
        Thread::sleep(us);
    }

    // --- wait calls --------------------------------------------------

    /// Non-blocking satisfaction probe.
    pub fn check(&self, handle: Handle) -> u64 {
        match HandleLock::resolve(self.this_process(), handle) {
            Some(lock) => lock.get().check() as u64,
            None => u64::MAX,
        }
    }

    /// Block on the object; returns the wake reason discriminator.
    pub fn wait_for(&self, handle: Handle, timeout_us: u64) -> u64 {
        match HandleLock::resolve(self.this_process(), handle) {
            Some(lock) => lock.get().wait(timeout_us) as u64,
            None => u64::MAX,
        }
    }

    /// Signal the object in its own sense (`mode` selects one/all for
    /// events).
    pub fn signal(&self, handle: Handle, mode: u64) -> Status {
        match HandleLock::resolve(self.this_process(), handle) {
            Some(lock) => {
                if lock.get().signal(mode) {
                    Status::Success
                } else {
                    Status::Failed
                }
            }
            None => Status::BadHandle,
        }
    }

    // --- handle calls ------------------------------------------------

    /// Resolve a published name to a handle.
    pub fn open_handle(&self, name: u64, length: u32) -> Handle {
        let Some(name) = self.read_name(name, length as usize) else {
            return 0;
        };
        let Some(obj) = registry::open(&name) else {
            return 0;
        };
        let handle = self.this_process().handles().put(obj);
        if handle == 0 {
            // SAFETY: the reference open() acquired.
            unsafe { obj.as_ref().relax() };
        }
        handle
    }

    pub fn close_handle(&self, handle: Handle) -> Status {
        if self.this_process().handles().close(handle) {
            Status::Success
        } else {
            Status::BadHandle
        }
    }

    pub fn handle_type(&self, handle: Handle) -> u64 {
        match HandleLock::resolve(self.this_process(), handle) {
            Some(lock) => lock.get().kind() as u64,
            None => 0,
        }
    }

    /// Create an event (`kind` 1, `arg` = initially signalled) or a
    /// semaphore (`kind` 2, `arg` = initial count); `name_va != 0`
    /// publishes it under a name read from the caller.
    pub fn create_object(&self, kind: u64, arg: u64, name_va: u64, name_len: u32) -> Handle {
        let name = if name_va != 0 {
            match self.read_name(name_va, name_len as usize) {
                Some(name) => Some(name),
                None => return 0,
            }
        } else {
            None
        };
        let obj: Option<&'static dyn KernelObject> = match (kind, name) {
            (OBJECT_EVENT, None) => Some(Event::create(arg != 0)),
            (OBJECT_EVENT, Some(name)) => {
                Event::create_named(arg != 0, &name).map(|event| event as _)
            }
            (OBJECT_SEMAPHORE, None) => Some(Semaphore::create(arg as u32)),
            (OBJECT_SEMAPHORE, Some(name)) => {
                Semaphore::create_named(arg as u32, &name).map(|semaphore| semaphore as _)
            }
            _ => None,
        };
        let Some(obj) = obj else {
            return 0;
        };
        let handle = self.this_process().handles().put(ObjPtr::from(obj));
        if handle == 0 {
            obj.relax();
        }
        handle
    }

    // --- vm calls ----------------------------------------------------

    /// Leaf PTE of a user address, the zero PTE when unmapped.
    pub fn vm_peek(&self, va: u64) -> u64 {
        match self.user_space() {
            Some(space) => space.peek(va).0,
            None => 0,
        }
    }

    pub fn vm_protect(&self, va: u64, count: u32, attributes: u64) -> Status {
        let Some(attr) = PageAttr::from_bits(attributes) else {
            return Status::OutOfRange;
        };
        let Some(space) = self.user_space() else {
            return Status::Denied;
        };
        if space.protect(va, count as usize, attr) {
            Status::Success
        } else {
            Status::Failed
        }
    }

    pub fn vm_reserve(&self, va: u64, count: u32) -> u64 {
        match self.user_space() {
            Some(space) => space.reserve(va, count as usize),
            None => 0,
        }
    }

    pub fn vm_commit(&self, va: u64, count: u32) -> Status {
        let Some(space) = self.user_space() else {
            return Status::Denied;
        };
        if space.commit(va, count as usize) {
            Status::Success
        } else {
            Status::Failed
        }
    }

    pub fn vm_release(&self, va: u64, count: u32) -> Status {
        let Some(space) = self.user_space() else {
            return Status::Denied;
        };
        if space.release(va, count as usize) {
            Status::Success
        } else {
            Status::Failed
        }
    }

    // --- io calls ----------------------------------------------------

    /// Read from a file/stream handle into the caller's buffer. Returns
    /// bytes transferred.
    pub fn read(&self, handle: Handle, buffer: u64, limit: u32) -> u64 {
        let Some(lock) = HandleLock::resolve(self.this_process(), handle) else {
            return 0;
        };
        let Some(file) = lock.get().as_file() else {
            return 0;
        };
        // Bound the kernel-side staging buffer.
        if limit as usize > crate::mm::PAGE_SIZE * 16 {
            return 0;
        }
        let mut staged = vec![0u8; limit as usize];
        file.read(&mut staged);
        file.wait(0);
        let transferred = file.result().min(staged.len());
        match self.write_user(buffer, &staged[..transferred]) {
            Some(written) => written as u64,
            None => 0,
        }
    }

    /// Write the caller's buffer to a file/stream handle.
    pub fn write(&self, handle: Handle, buffer: u64, length: u32) -> u64 {
        let Some(lock) = HandleLock::resolve(self.this_process(), handle) else {
            return 0;
        };
        let Some(file) = lock.get().as_file() else {
            return 0;
        };
        let Some(staged) = self.read_user(buffer, length as usize) else {
            return 0;
        };
        file.write(&staged) as u64
    }

    pub fn iostate(&self, handle: Handle) -> u64 {
        match HandleLock::resolve(self.this_process(), handle) {
            Some(lock) => match lock.get().as_file() {
                Some(file) => file.io_state() as u64,
                None => u64::MAX,
            },
            None => u64::MAX,
        }
    }

    pub fn display_fill(&self, color: u32, left_top: u64, right_bottom: u64) -> Status {
        match *DISPLAY.lock() {
            Some(surface) => {
                if surface.fill(color, left_top, right_bottom) {
                    Status::Success
                } else {
                    Status::OutOfRange
                }
            }
            None => Status::NotSupported,
        }
    }

    pub fn display_draw(&self, buffer: u64, length: u32, left_top: u64, right_bottom: u64) -> Status {
        let Some(data) = self.read_user(buffer, length as usize) else {
            return Status::BadBuffer;
        };
        match *DISPLAY.lock() {
            Some(surface) => {
                if surface.draw(&data, left_top, right_bottom) {
                    Status::Success
                } else {
                    Status::OutOfRange
                }
            }
            None => Status::NotSupported,
        }
    }
}

impl Default for ServiceProvider {
    fn default() -> Self {
        Self::new()
    }
}
