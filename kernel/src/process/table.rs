//! Process manager
//!
//! The global id-ordered process table. Spawning validates the caller's
//! privilege and the image's PE header before any resource is committed;
//! enumeration skips the kernel process.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use lazy_static::lazy_static;

use crate::bugcheck::Reason;
use crate::io;
use crate::object::waitable::{KernelObject, ObjPtr};
use crate::pe::PeHeader;
use crate::sync::IrqMutex;

use super::pcb::{LoaderArgs, Privilege, Process, ProcessId, StartupInfo};
use super::thread::Thread;

pub struct ProcessManager {
    table: IrqMutex<BTreeMap<ProcessId, Box<Process>>>,
    next_id: AtomicU32,
}

lazy_static! {
    static ref MANAGER: ProcessManager = ProcessManager {
        table: IrqMutex::new(BTreeMap::new()),
        next_id: AtomicU32::new(0),
    };
}

pub fn process_manager() -> &'static ProcessManager {
    &MANAGER
}

impl ProcessManager {
    /// Create the kernel process (id 0) around the boot thread. Returns
    /// the process and its initial thread for the core to install.
    pub fn init_kernel_process(&self) -> (NonNull<Process>, NonNull<Thread>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            bugcheck!(Reason::Corrupted, "kernel process must be first");
        }
        let process = Process::new_kernel(id);
        process.manage();
        let process_ptr = NonNull::from(process.as_ref());
        let thread = process
            .find_thread(0, false)
            .unwrap_or_else(|| bugcheck!(Reason::Corrupted, "kernel process has no boot thread"));
        self.table.lock().insert(id, process);
        (process_ptr, thread)
    }

    /// Spawn a process from `command` ("path arguments..."). Opens the
    /// image, validates its PE header, then builds the process with the
    /// caller-supplied std streams. On any failure every donated stream
    /// reference is dropped and `None` returned.
    pub fn spawn(
        &self,
        command: String,
        env: String,
        info: StartupInfo,
    ) -> Option<NonNull<Process>> {
        let caller = crate::sched::this_core().current_thread();
        // SAFETY: the current thread and its process are live.
        let caller_privilege = unsafe { caller.as_ref().owner().privilege() };
        if info.privilege < caller_privilege {
            drop_streams(info.std_streams);
            return None;
        }

        let path = command.split(' ').next().unwrap_or("");
        let Some(file) = io::open_image(path) else {
            drop_streams(info.std_streams);
            return None;
        };

        // Read and validate the image's PE header: executable, not a
        // system image or DLL, sane alignment, canonical low-half base.
        let header = {
            // SAFETY: just opened, reference held.
            let file_ref = unsafe { file.as_ref() };
            let mut buf = vec![0u8; 0x200];
            file_ref.read(&mut buf);
            file_ref.wait(0);
            if file_ref.io_state() != 0 || file_ref.result() != 0x200 {
                None
            } else {
                PeHeader::parse(&buf).filter(PeHeader::suitable_user_image)
            }
        };
        let Some(header) = header else {
            // SAFETY: our reference, never donated.
            unsafe { file.as_ref().relax() };
            drop_streams(info.std_streams);
            return None;
        };

        let args = LoaderArgs {
            env,
            image_base: header.image_base,
            image_size: header.image_size as u64,
            header_size: header.header_size as u64,
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // SAFETY: reference held; handle 0 takes it inside new_user.
        let obj: &dyn KernelObject = unsafe { file.as_ref() };
        // new_user consumes the image and stream references on every path.
        let process = Process::new_user(id, command, ObjPtr::from(obj), info, args)?;
        process.manage();
        let ptr = NonNull::from(process.as_ref());
        self.table.lock().insert(id, process);
        Some(ptr)
    }

    /// Remove a dead process. Called from its last `relax`.
    pub(crate) fn erase(&self, id: ProcessId) {
        if self.table.lock().remove(&id).is_none() {
            bugcheck!(Reason::Corrupted, "process {id} missing from table");
        }
    }

    /// Look up a process, optionally taking a reference.
    pub fn find(&self, id: ProcessId, acquire: bool) -> Option<NonNull<Process>> {
        let table = self.table.lock();
        let process = table.get(&id)?;
        if acquire && !process.acquire() {
            return None;
        }
        Some(NonNull::from(process.as_ref()))
    }

    /// Id-ordered enumeration, skipping the kernel process: `id == 0`
    /// starts over; returns the next id, 0 at the end, `None` for an id
    /// that no longer exists.
    pub fn enumerate(&self, id: ProcessId) -> Option<ProcessId> {
        let table = self.table.lock();
        if id != 0 && !table.contains_key(&id) {
            return None;
        }
        let next = table
            .range(id + 1..)
            .map(|(&next_id, _)| next_id)
            .next()
            .unwrap_or(0);
        Some(next)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.table.lock().len()
    }
}

/// Drop donated stream references that never reached a handle table.
pub(super) fn drop_streams(streams: [Option<ObjPtr>; 3]) {
    for stream in streams.into_iter().flatten() {
        // SAFETY: counted references returned to sender.
        unsafe { stream.as_ref().relax() };
    }
}

/// Entry point of the loader thread a fresh user process starts with.
/// Takes ownership of the boxed [`LoaderArgs`], maps the image and stack
/// regions in the owning user space, and exits. (Transition to user mode
/// is the dispatcher's concern, outside the core.)
pub(super) extern "C" fn loader_entry(arg: u64) -> ! {
    // SAFETY: spawn passed a Box::into_raw pointer and this thread is its
    // sole consumer.
    let args = unsafe { Box::from_raw(arg as *mut LoaderArgs) };
    let core = crate::sched::this_core();
    let thread = core.current_thread();
    // SAFETY: current thread and owner are live.
    let process = unsafe { thread.as_ref().owner() };
    if let Some(space) = process.vspace().user() {
        let header_pages = (args.header_size as usize).div_ceil(crate::mm::PAGE_SIZE);
        let image_pages = (args.image_size as usize).div_ceil(crate::mm::PAGE_SIZE);
        let base = space.reserve(args.image_base, image_pages.max(1));
        if base == 0 || !space.commit(base, header_pages.max(1)) {
            log::warn!("image mapping failed for process {}", process.id());
            process.kill(u32::MAX);
        }
    }
    drop(args);
    Thread::exit();
    unreachable!("exited loader thread resumed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::testing;
    use crate::io::{FileObject, MemoryFile, NullStream};
    use crate::object::waitable::KernelObject;
    use crate::pe;
    use crate::process::pcb::ProcessState;
    use crate::process::Privilege;

    fn image_opener(path: &str) -> Option<NonNull<dyn FileObject>> {
        let characteristics = match path {
            "good.exe" => 0x0002,
            "library.dll" => 0x0002 | 0x2000,
            _ => return None,
        };
        let file = MemoryFile::create(pe::build_test_image(0x40_0000, characteristics));
        let file_ref: &dyn FileObject = file;
        Some(NonNull::from(file_ref))
    }

    fn startup(stream: Option<crate::object::ObjPtr>) -> StartupInfo {
        StartupInfo {
            privilege: Privilege::User,
            std_streams: [stream, None, None],
        }
    }

    #[test]
    fn spawn_builds_and_kill_unwinds_a_process() {
        let _order = testing::serialize();
        testing::reset_current();
        testing::init();
        crate::io::set_image_opener(image_opener);

        let stream = NullStream::create();
        let stream_obj: &dyn KernelObject = stream;
        let processes_before = process_manager().len();
        let child = process_manager()
            .spawn(
                String::from("good.exe -v"),
                String::from("PATH=/"),
                startup(Some(NonNull::from(stream_obj))),
            )
            .expect("spawn");
        // SAFETY: spawn returned an owned reference.
        let child_ref = unsafe { child.as_ref() };
        assert_ne!(child_ref.id(), 0);
        assert_eq!(child_ref.command(), "good.exe -v");
        assert_eq!(child_ref.state(), ProcessState::Running);
        // Image at handle 0 plus one std stream.
        assert_eq!(child_ref.handles().count(), 2);
        assert_eq!(child_ref.thread_count(), 1);
        assert_eq!(process_manager().len(), processes_before + 1);
        assert_eq!(process_manager().enumerate(0), Some(child_ref.id()));

        // The loader preempted the boot thread; killing the process takes
        // the calling thread down last and unwinds everything.
        let id = child_ref.id();
        child_ref.kill(7);
        assert_eq!(child_ref.state(), ProcessState::Stopped);
        assert_eq!(child_ref.result(), 7);
        assert_eq!(child_ref.handles().count(), 0);
        assert_eq!(child_ref.check(), true);
        child_ref.relax();
        assert!(process_manager().find(id, false).is_none());
        assert_eq!(process_manager().len(), processes_before);
        testing::reset_current();
    }

    #[test]
    fn spawn_rejects_unsuitable_images() {
        let _order = testing::serialize();
        testing::reset_current();
        testing::init();
        crate::io::set_image_opener(image_opener);

        let stream = NullStream::create();
        assert!(stream.acquire()); // observe the refund
        let stream_obj: &dyn KernelObject = stream;
        let refused = process_manager().spawn(
            String::from("library.dll"),
            String::new(),
            startup(Some(NonNull::from(stream_obj))),
        );
        assert!(refused.is_none());
        // The donated stream reference came back.
        assert_eq!(stream.waitable().ref_count(), 1);

        assert!(process_manager()
            .spawn(String::from("missing.exe"), String::new(), startup(None))
            .is_none());
        assert!(!stream.relax());
        testing::reset_current();
    }
}
