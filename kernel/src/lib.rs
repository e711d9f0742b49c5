//! Lumen kernel core library
//!
//! The core of a small x86-64 kernel: the virtual-memory manager (four-level
//! page tables, reserve/commit/protect/release/assign over page ranges, a
//! lock-free transient mapping window) and the process/thread subsystem built
//! on top of it (waitables, a preemptive priority scheduler, handle tables).
//!
//! The crate builds for `x86_64-unknown-none` and for the host target; on the
//! host the architecture facade is replaced by a software implementation so
//! the test suite runs under the standard cargo harness.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

#[macro_use]
pub mod bugcheck;

// On bare metal the kernel heap lives behind linked_list_allocator. On the
// host (unit/integration tests, coverage) delegate to the system allocator so
// test code using Vec/String/BTreeMap compiles and runs.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Get a reference to the kernel heap allocator (bare metal only).
#[cfg(target_os = "none")]
pub fn allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    bugcheck!(
        crate::bugcheck::Reason::BadAlloc,
        "kernel heap exhausted ({} bytes)",
        layout.size()
    );
}

pub mod acpi;
pub mod arch;
pub mod boot;
pub mod error;
pub mod io;
pub mod logger;
pub mod mm;
pub mod object;
pub mod pe;
pub mod process;
pub mod sched;
pub mod service;
pub mod sync;
pub mod sysinfo;
pub mod timer;

// Re-exports used throughout the crate and by the integration tests.
pub use error::{KernelError, Status};
pub use mm::{PhysicalAddress, VirtualAddress, PAGE_SIZE};
pub use object::waitable::WaitReason;
