//! Host stand-in for the architecture facade.
//!
//! Used when the crate is compiled for a hosted target (unit and integration
//! tests). The interrupt flag becomes a per-thread software bit, TLB and CR3
//! operations become bookkeeping, and the context switch records the handoff
//! without touching registers -- callers above the facade run unchanged.

use core::sync::atomic::{AtomicU64, Ordering};

use super::context::CpuContext;

extern crate std;

std::thread_local! {
    static IF_FLAG: core::cell::Cell<bool> = const { core::cell::Cell::new(true) };
}

static CR3: AtomicU64 = AtomicU64::new(0);
static INVLPG_COUNT: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn core_id() -> usize {
    0
}

#[inline]
pub fn interrupts_enabled() -> bool {
    IF_FLAG.with(|f| f.get())
}

#[inline]
pub fn interrupts_save_off() -> bool {
    IF_FLAG.with(|f| f.replace(false))
}

#[inline]
pub fn interrupts_restore(enabled: bool) {
    if enabled {
        IF_FLAG.with(|f| f.set(true));
    }
}

#[inline]
pub fn invlpg(_va: u64) {
    INVLPG_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Number of local TLB invalidations issued. Test observability only.
pub fn invlpg_count() -> u64 {
    INVLPG_COUNT.load(Ordering::Relaxed)
}

#[inline]
pub fn read_cr3() -> u64 {
    CR3.load(Ordering::Relaxed)
}

#[inline]
pub unsafe fn write_cr3(root: u64) {
    CR3.store(root, Ordering::Relaxed);
}

#[inline]
pub fn pause() {
    core::hint::spin_loop();
}

/// Bookkeeping-only context switch: control returns to the caller
/// immediately. Scheduler tests observe the handoff through the per-core
/// current-thread pointer, not through register state.
pub unsafe fn context_switch(_save: *mut CpuContext, _load: *const CpuContext) {}
