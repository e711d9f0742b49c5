//! Transient mapping window
//!
//! A fixed virtual window of 512 single-page slots used wherever the kernel
//! must dereference a physical frame without owning a permanent mapping.
//! Each slot's PTE is its own synchronization word: claiming a slot is a
//! single compare-exchange against a non-present entry, so the window is
//! safe across cores without any lock.

use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crate::arch;
use crate::bugcheck::Reason;

use super::pte::{PageTable, GLOBAL, PRESENT, WRITE, XD};
use super::{PhysicalAddress, VirtualAddress, ENTRY_COUNT, PAGE_SIZE};

/// Slots in the window; provisioned for the core's peak demand (one slot
/// per active page-table walk per core).
pub const WINDOW_SLOTS: usize = ENTRY_COUNT;

const SLOT_FLAGS: u64 = PRESENT | WRITE | GLOBAL | XD;

static SLOT_TABLE: AtomicPtr<AtomicU64> = AtomicPtr::new(core::ptr::null_mut());
static WINDOW_BASE: AtomicU64 = AtomicU64::new(0);
static SCAN_HINT: AtomicUsize = AtomicUsize::new(0);

/// Install the window: `table` is the dedicated PT whose entries back the
/// slots, `base` the first slot's virtual address. Boot calls this once,
/// before the first virtual-space operation.
pub fn init(table: *mut u64, base: VirtualAddress) {
    SLOT_TABLE.store(table.cast(), Ordering::Release);
    WINDOW_BASE.store(base.as_u64(), Ordering::Release);
}

/// Host builds: back the slot table with a leaked heap page. Slot
/// accounting and the CAS protocol run for real; the returned pointers are
/// direct-map translations instead of window addresses.
#[cfg(not(target_os = "none"))]
pub fn init_host() {
    let table = alloc::boxed::Box::leak(alloc::boxed::Box::new(PageTable {
        entries: [0; ENTRY_COUNT],
    }));
    init(table.entries.as_mut_ptr(), VirtualAddress::new(0));
}

fn slots() -> &'static [AtomicU64] {
    let ptr = SLOT_TABLE.load(Ordering::Acquire);
    if ptr.is_null() {
        bugcheck!(Reason::Corrupted, "transient window used before init");
    }
    // SAFETY: init handed us a pointer to a live PT (512 u64 entries) that
    // is never torn down; AtomicU64 is layout-compatible with u64 and every
    // accessor goes through atomic operations.
    unsafe { core::slice::from_raw_parts(ptr, WINDOW_SLOTS) }
}

/// An exclusively-owned view of one physical frame.
///
/// Holds a window slot from construction to drop; the slot reverts to free
/// with a local TLB invalidation on release.
pub struct MapView {
    index: usize,
    pa: PhysicalAddress,
}

impl MapView {
    /// Map `pa` (page-aligned) into a free slot. Window exhaustion is
    /// fatal: the slot count is provisioned so it cannot happen under the
    /// core's peak demand.
    pub fn new(pa: PhysicalAddress) -> Self {
        debug_assert!(pa.is_page_aligned());
        let table = slots();
        let start = SCAN_HINT.load(Ordering::Relaxed) % WINDOW_SLOTS;
        for step in 0..WINDOW_SLOTS {
            let index = (start + step) % WINDOW_SLOTS;
            let slot = &table[index];
            let current = slot.load(Ordering::Relaxed);
            if current & PRESENT != 0 {
                continue;
            }
            let fresh = pa.as_u64() | SLOT_FLAGS;
            // First successful exchange wins the slot; losing is silent and
            // the scan continues.
            if slot
                .compare_exchange(current, fresh, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                SCAN_HINT.store(index + 1, Ordering::Relaxed);
                return Self { index, pa };
            }
        }
        bugcheck!(Reason::BadAlloc, "transient window exhausted");
    }

    /// Point the held slot at a different frame, reusing the claim. Cheaper
    /// than release-and-reacquire in table-walk loops.
    pub fn remap(&mut self, pa: PhysicalAddress) {
        debug_assert!(pa.is_page_aligned());
        let table = slots();
        table[self.index].store(pa.as_u64() | SLOT_FLAGS, Ordering::Release);
        arch::invlpg(self.va().as_u64());
        self.pa = pa;
    }

    /// The slot's virtual address.
    pub fn va(&self) -> VirtualAddress {
        VirtualAddress::new(
            WINDOW_BASE.load(Ordering::Acquire) + (self.index * PAGE_SIZE) as u64,
        )
    }

    /// CPU-addressable pointer to the mapped frame.
    pub fn as_mut_ptr<T>(&self) -> *mut T {
        #[cfg(target_os = "none")]
        {
            self.va().as_u64() as *mut T
        }
        #[cfg(not(target_os = "none"))]
        {
            super::phys_to_virt(self.pa).cast()
        }
    }

    /// View the frame as a page table.
    #[allow(clippy::mut_from_ref)]
    pub fn table(&self) -> &mut PageTable {
        // SAFETY: the slot claim gives this view exclusive ownership of the
        // mapping for its lifetime, and callers only create one table view
        // per frame under the owning space's lock.
        unsafe { &mut *self.as_mut_ptr::<PageTable>() }
    }

    /// Zero-fill the mapped frame.
    pub fn zero(&self) {
        // SAFETY: the view maps exactly one writable page.
        unsafe { core::ptr::write_bytes(self.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
    }

    pub fn pa(&self) -> PhysicalAddress {
        self.pa
    }
}

impl Drop for MapView {
    fn drop(&mut self) {
        let table = slots();
        let expected = self.pa.as_u64() | SLOT_FLAGS;
        if table[self.index]
            .compare_exchange(expected, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            bugcheck!(Reason::Corrupted, "window slot {} changed under owner", self.index);
        }
        arch::invlpg(self.va().as_u64());
    }
}

#[cfg(test)]
pub(crate) fn test_init() {
    #[cfg(not(target_os = "none"))]
    {
        static ONCE: spin::Once<()> = spin::Once::new();
        ONCE.call_once(init_host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u64) -> PhysicalAddress {
        PhysicalAddress::new(n * PAGE_SIZE as u64)
    }

    #[test]
    fn slots_are_exclusive_until_release() {
        test_init();
        let a = MapView::new(frame(1));
        let b = MapView::new(frame(2));
        assert_ne!(a.index, b.index);

        // While held, each slot carries its owner's frame and stays
        // present.
        let table = slots();
        let held = table[a.index].load(Ordering::Relaxed);
        assert_eq!(held & super::super::pte::FRAME_MASK, frame(1).as_u64());
        assert_ne!(held & PRESENT, 0);
        // Release is the inverse exchange; a mismatch would bugcheck here.
        drop(a);
        drop(b);
    }

    #[test]
    fn remap_keeps_the_claim() {
        test_init();
        let mut view = MapView::new(frame(3));
        let index = view.index;
        view.remap(frame(4));
        assert_eq!(view.index, index);
        assert_eq!(view.pa(), frame(4));
        let table = slots();
        assert_eq!(
            table[index].load(Ordering::Relaxed) & super::super::pte::FRAME_MASK,
            frame(4).as_u64()
        );
    }

    #[test]
    fn host_view_resolves_through_direct_map() {
        test_init();
        let mut page = alloc::boxed::Box::new([0u8; PAGE_SIZE]);
        let pa = PhysicalAddress::new(page.as_mut_ptr() as u64);
        // The heap page is 4K-sized but not necessarily aligned; align down
        // is fine for an addressing smoke test on the host.
        let pa = PhysicalAddress::new(pa.as_u64() & !super::super::PAGE_MASK);
        let view = MapView::new(pa);
        assert_eq!(view.as_mut_ptr::<u8>() as u64, pa.as_u64());
    }
}
