//! File and stream objects
//!
//! The process core consumes files through a deliberately narrow surface:
//! start a read, wait on the object, then inspect `io_state`/`result`.
//! Where images come from is an executive concern; it installs an opener
//! hook. `MemoryFile` (boot ramdisk images, tests) and `NullStream`
//! complete the reads synchronously.

use alloc::boxed::Box;
use alloc::vec::Vec;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::object::waitable::{KernelObject, ObjectKind, Waitable};
use crate::sync::IrqMutex;

/// An opaque byte source/sink a process can hold a handle to.
pub trait FileObject: KernelObject {
    /// Start a read at the current position. Completion is observed by
    /// waiting on the object; synchronous implementations complete before
    /// returning.
    fn read(&self, buf: &mut [u8]);

    /// Write from `buf`; returns bytes accepted.
    fn write(&self, buf: &[u8]) -> usize {
        let _ = buf;
        0
    }

    /// 0 when the last operation succeeded.
    fn io_state(&self) -> u32;

    /// Bytes transferred by the last completed operation.
    fn result(&self) -> usize;
}

type Opener = fn(&str) -> Option<NonNull<dyn FileObject>>;

static OPENER: IrqMutex<Option<Opener>> = IrqMutex::new(None);

/// Install the image-opening hook (boot staging / test harness).
pub fn set_image_opener(opener: Opener) {
    *OPENER.lock() = Some(opener);
}

/// Resolve a path to an acquired file reference through the hook.
pub fn open_image(path: &str) -> Option<NonNull<dyn FileObject>> {
    let opener = (*OPENER.lock())?;
    opener(path)
}

/// An in-memory file: reads complete immediately, the object is always
/// signalled.
pub struct MemoryFile {
    waitable: Waitable,
    data: Vec<u8>,
    position: AtomicUsize,
    last_result: AtomicUsize,
}

impl MemoryFile {
    pub fn create(data: Vec<u8>) -> &'static MemoryFile {
        Box::leak(Box::new(MemoryFile {
            waitable: Waitable::new(),
            data,
            position: AtomicUsize::new(0),
            last_result: AtomicUsize::new(0),
        }))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl KernelObject for MemoryFile {
    fn waitable(&self) -> &Waitable {
        &self.waitable
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::File
    }

    /// Synchronous: every started operation has already completed.
    fn check(&self) -> bool {
        true
    }

    fn as_file(&self) -> Option<&dyn FileObject> {
        Some(self)
    }

    fn relax(&self) -> bool {
        let _ig = crate::sync::InterruptGuard::new();
        if self.waitable.release_ref() > 0 {
            return true;
        }
        // SAFETY: last reference just dropped.
        unsafe { crate::object::waitable::destroy(self) };
        false
    }
}

impl FileObject for MemoryFile {
    fn read(&self, buf: &mut [u8]) {
        let position = self.position.load(Ordering::Relaxed);
        let available = self.data.len().saturating_sub(position);
        let take = available.min(buf.len());
        buf[..take].copy_from_slice(&self.data[position..position + take]);
        self.position.store(position + take, Ordering::Relaxed);
        self.last_result.store(take, Ordering::Relaxed);
    }

    fn io_state(&self) -> u32 {
        0
    }

    fn result(&self) -> usize {
        self.last_result.load(Ordering::Relaxed)
    }
}

/// A stream that swallows writes and returns empty reads; the default std
/// stream when a spawner provides none.
pub struct NullStream {
    waitable: Waitable,
}

impl NullStream {
    pub fn create() -> &'static NullStream {
        Box::leak(Box::new(NullStream {
            waitable: Waitable::new(),
        }))
    }
}

impl KernelObject for NullStream {
    fn waitable(&self) -> &Waitable {
        &self.waitable
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Stream
    }

    fn check(&self) -> bool {
        true
    }

    fn as_file(&self) -> Option<&dyn FileObject> {
        Some(self)
    }

    fn relax(&self) -> bool {
        let _ig = crate::sync::InterruptGuard::new();
        if self.waitable.release_ref() > 0 {
            return true;
        }
        // SAFETY: last reference just dropped.
        unsafe { crate::object::waitable::destroy(self) };
        false
    }
}

impl FileObject for NullStream {
    fn read(&self, _buf: &mut [u8]) {}

    fn write(&self, buf: &[u8]) -> usize {
        buf.len()
    }

    fn io_state(&self) -> u32 {
        0
    }

    fn result(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_file_reads_sequentially() {
        let file = MemoryFile::create((0u8..64).collect());
        let mut buf = [0u8; 16];
        file.read(&mut buf);
        assert_eq!(file.result(), 16);
        assert_eq!(buf[0], 0);
        file.read(&mut buf);
        assert_eq!(buf[0], 16);
        assert_eq!(file.io_state(), 0);
        assert!(!file.relax());
    }

    #[test]
    fn memory_file_short_read_at_end() {
        let file = MemoryFile::create((0u8..10).collect());
        let mut buf = [0u8; 16];
        file.read(&mut buf);
        assert_eq!(file.result(), 10);
        file.read(&mut buf);
        assert_eq!(file.result(), 0);
        assert!(!file.relax());
    }
}
