//! Architecture facade
//!
//! The narrow CPU interface the core consumes: current-core identity, the
//! interrupt mask, local TLB invalidation, the paging root, and the context
//! switch. Bare metal gets the real x86-64 implementation; the host build
//! gets a software stand-in so everything above this module is testable
//! under the standard cargo harness.

pub mod context;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use self::x86_64 as imp;

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub mod host;
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
use self::host as imp;

pub use context::CpuContext;

/// Identity of the executing core. Indexes the per-core state table.
#[inline]
pub fn core_id() -> usize {
    imp::core_id()
}

/// Whether local interrupts are currently enabled.
#[inline]
pub fn interrupts_enabled() -> bool {
    imp::interrupts_enabled()
}

/// Disable local interrupts, returning the previous state.
#[inline]
pub fn interrupts_save_off() -> bool {
    imp::interrupts_save_off()
}

/// Restore the interrupt state saved by [`interrupts_save_off`].
#[inline]
pub fn interrupts_restore(enabled: bool) {
    imp::interrupts_restore(enabled)
}

/// Invalidate the local TLB entry covering `va`.
#[inline]
pub fn invlpg(va: u64) {
    imp::invlpg(va)
}

/// Read the current paging root.
#[inline]
pub fn read_cr3() -> u64 {
    imp::read_cr3()
}

/// Load a new paging root. Flushes all non-global TLB entries.
///
/// # Safety
///
/// `root` must be the physical address of a valid top-level page table whose
/// kernel half maps the currently executing code.
#[inline]
pub unsafe fn write_cr3(root: u64) {
    unsafe { imp::write_cr3(root) }
}

/// Spin-wait hint.
#[inline]
pub fn pause() {
    imp::pause()
}

/// Save the executing context into `save` and resume `load`.
///
/// Returns (into the saved context) when some other thread switches back.
///
/// # Safety
///
/// Both pointers must reference valid, exclusively-owned context areas and
/// local interrupts must be disabled. `load` must have been seeded by thread
/// creation or a previous save.
#[inline]
pub unsafe fn context_switch(save: *mut CpuContext, load: *const CpuContext) {
    unsafe { imp::context_switch(save, load) }
}
