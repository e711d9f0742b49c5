//! Boot staging
//!
//! Global state is constructed once, in a fixed order: frame pool, then
//! the kernel virtual space and transient window, then ACPI, then the
//! scheduler and process manager. Each stage is a function so the
//! bring-up path (and the host test harness) can drive them explicitly.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::acpi::Acpi;
use crate::error::KernelResult;
#[cfg(target_os = "none")]
use crate::mm::frame::FramePool;
use crate::mm::vspace::{init_kernel_space, KernelSpace};
use crate::mm::{PhysicalAddress, VirtualAddress};
use crate::process::{process_manager, Process, Thread};
use crate::sched::this_core;
#[cfg(target_os = "none")]
use crate::sysinfo::SysInfo;

static USER_BASE: AtomicU64 = AtomicU64::new(0);

/// Base virtual address handed to fresh user spaces (0 on bare metal; the
/// host harness points it at an arena).
pub fn user_space_base() -> VirtualAddress {
    VirtualAddress::new(USER_BASE.load(Ordering::Acquire))
}

pub fn set_user_space_base(base: VirtualAddress) {
    USER_BASE.store(base.as_u64(), Ordering::Release);
}

/// Stage 1: the physical frame pool over the loader's PMM description.
#[cfg(target_os = "none")]
pub fn stage_pm(info: &SysInfo) -> &'static FramePool {
    let pool = FramePool::from_region(info.pmm_base, info.pmm_frames as usize);
    // Frames the loader already handed out are recorded in its bitmap:
    // one set bit per used frame.
    let bitmap = crate::mm::phys_to_virt(info.pmm_bitmap);
    for frame in 0..info.pmm_frames as usize {
        // SAFETY: the loader guarantees the bitmap covers pmm_frames bits.
        let byte = unsafe { *bitmap.add(frame / 8) };
        if byte & (1 << (frame % 8)) != 0 {
            pool.mark_used(
                PhysicalAddress::new(info.pmm_base.as_u64() + (frame * crate::mm::PAGE_SIZE) as u64),
                1,
            );
        }
    }
    static POOL: spin::Once<FramePool> = spin::Once::new();
    POOL.call_once(|| pool)
}

/// Stage 2: the kernel virtual space, with the boot regions sealed away
/// from the allocator.
#[cfg(target_os = "none")]
pub fn stage_vm(pool: &'static FramePool, info: &SysInfo) -> &'static KernelSpace {
    use crate::mm::{KERNEL_BASE, PAGE_SIZE, PT_SPAN};
    let kernel = init_kernel_space(pool, VirtualAddress::new(KERNEL_BASE));
    // The transient window owns one whole PDE's worth of address space.
    const WINDOW_BASE: u64 = 0xFFFF_8000_4000_0000;
    kernel.seal_directory(WINDOW_BASE);
    crate::mm::window::init((WINDOW_BASE + PT_SPAN - PAGE_SIZE as u64) as *mut u64,
        VirtualAddress::new(WINDOW_BASE));
    // Loader-owned regions stay untouchable: the PMM bitmap and the
    // kernel image (located through its PE header).
    let bitmap_pages = info.pmm_bitmap_pages as usize;
    if bitmap_pages > 0 {
        kernel.seal(
            KERNEL_BASE + info.pmm_bitmap.as_u64(),
            bitmap_pages,
        );
    }
    kernel
}

/// Stage 3: firmware tables.
pub fn stage_acpi(rsdp: PhysicalAddress) -> KernelResult<Acpi> {
    let acpi = Acpi::parse(rsdp)?;
    if let Some(madt) = &acpi.madt {
        log::info!(
            "{} processors, I/O APIC at {:#x}, {} overrides",
            madt.processors.len(),
            madt.io_apic_base,
            madt.redirects.len()
        );
    }
    Ok(acpi)
}

/// Stage 4: the kernel process, its boot thread, and this core's idle
/// thread.
pub fn stage_scheduler() -> (NonNull<Process>, NonNull<Thread>) {
    let (process, initial) = process_manager().init_kernel_process();
    // SAFETY: the kernel process is live for the life of the system.
    let idle = unsafe {
        process
            .as_ref()
            .spawn_idle()
            .unwrap_or_else(|| bugcheck!(crate::bugcheck::Reason::BadAlloc, "no idle thread"))
    };
    this_core().install(initial, idle);
    (process, initial)
}

/// Idle loop; runs when the ready queue is empty.
pub extern "C" fn idle_entry(_arg: u64) -> ! {
    loop {
        crate::arch::pause();
    }
}

/// Host test harness: arenas instead of loader handoff, the same staged
/// construction order otherwise. Compiled for hosted targets only.
#[cfg(not(target_os = "none"))]
pub mod testing {
    extern crate std;

    use super::*;
    use crate::mm::frame::FramePool;
    use crate::mm::window;
    use crate::mm::PAGE_SIZE;

    /// Everything the tests need a handle on.
    pub struct Harness {
        pub pool: &'static FramePool,
        pub kernel: &'static KernelSpace,
        pub kernel_process: NonNull<Process>,
        pub initial_thread: NonNull<Thread>,
        pub user_base: VirtualAddress,
    }

    // Pointers are into leaked, never-freed allocations.
    unsafe impl Send for Harness {}
    unsafe impl Sync for Harness {}

    static HARNESS: spin::Once<Harness> = spin::Once::new();
    static TEST_ORDER: std::sync::Mutex<()> = std::sync::Mutex::new(());

    /// Arena pages backing kernel-space virtual addresses on the host.
    const KERNEL_ARENA_PAGES: usize = 4096;
    /// Frames in the host frame pool.
    const POOL_FRAMES: usize = 8192;

    fn leak_arena(pages: usize) -> VirtualAddress {
        let layout =
            core::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: non-zero size; leaked for 'static lifetime.
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());
        VirtualAddress::new(base as u64)
    }

    /// Bring the kernel up once per test process: logger, window, frame
    /// pool, kernel space, process manager, core 0.
    pub fn init() -> &'static Harness {
        HARNESS.call_once(|| {
            crate::logger::init(log::LevelFilter::Debug);
            crate::logger::set_sink(|record| {
                std::eprintln!("[{}] {}", record.level(), record.args());
            });
            window::init_host();
            let pool = FramePool::host_arena(POOL_FRAMES);
            let kernel = init_kernel_space(pool, leak_arena(KERNEL_ARENA_PAGES));
            set_user_space_base(leak_arena(KERNEL_ARENA_PAGES));
            let (kernel_process, initial_thread) = stage_scheduler();
            Harness {
                pool,
                kernel,
                kernel_process,
                initial_thread,
                user_base: user_space_base(),
            }
        })
    }

    /// Serialize tests that touch the scheduler/core state.
    pub fn serialize() -> std::sync::MutexGuard<'static, ()> {
        TEST_ORDER
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Drain the ready queue and put the boot thread back as the running
    /// thread on core 0. Scheduler tests start from this state.
    pub fn reset_current() {
        let harness = init();
        let _ig = crate::sync::InterruptGuard::new();
        crate::timer::clear_all();
        while crate::sched::queue::dequeue().is_some() {}
        // SAFETY: the boot thread is never destroyed.
        unsafe {
            harness.initial_thread.as_ref().force_running();
        }
        this_core().install(
            harness.initial_thread,
            this_core().idle_thread(),
        );
    }
}
