//! Virtual-space manager
//!
//! One engine drives both halves of the address space: every space owns a
//! 512 GiB window rooted at one PDPT (one top-level entry's worth) and
//! offers reserve/commit/protect/release over page ranges, with `assign`
//! reserved to the kernel space and `peek` to user spaces. Paging
//! structures are reached through the transient window, never through
//! permanent mappings, and not-yet-reserved ranges inside each PT carry the
//! intrusive free-list described in [`super::freelist`].
//!
//! Locking: one interrupt-masking rwlock per space; all mutators take it
//! exclusively, `peek` shared.

use spin::Once;

use crate::bugcheck::Reason;
use crate::sync::IrqRwLock;

use super::frame::{AllocFlags, FramePool};
use super::freelist::FreeList;
use super::pte::{Pde, Pdpte, Pml4e, Pte, BYPASS, PRESERVE};
use super::window::MapView;
use super::{PhysicalAddress, VirtualAddress, ENTRY_COUNT, PAGE_SIZE, WINDOW_SPAN};

/// Largest non-fixed reservation: 1 GiB. Fixed reservations may span the
/// whole window.
const MAX_ANY_PAGES: usize = 0x40000;

/// Remap-or-create a table view without giving up the window slot.
fn load_view(slot: &mut Option<MapView>, pa: PhysicalAddress) -> &mut MapView {
    match slot {
        Some(view) => {
            if view.pa() != pa {
                view.remap(pa);
            }
            view
        }
        None => slot.insert(MapView::new(pa)),
    }
}

/// A 512 GiB virtual-address window over one four-level subtree.
pub struct AddressSpace {
    pdpt: PhysicalAddress,
    base: VirtualAddress,
    user: bool,
    pool: &'static FramePool,
}

impl AddressSpace {
    /// Wrap an existing, zeroed PDPT frame.
    pub fn from_parts(
        pdpt: PhysicalAddress,
        base: VirtualAddress,
        user: bool,
        pool: &'static FramePool,
    ) -> Self {
        debug_assert!(base.is_page_aligned());
        Self {
            pdpt,
            base,
            user,
            pool,
        }
    }

    pub fn pdpt(&self) -> PhysicalAddress {
        self.pdpt
    }

    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    pub fn pool(&self) -> &'static FramePool {
        self.pool
    }

    /// Whether `[addr, addr + count pages)` lies inside this window.
    pub fn contains(&self, addr: u64, count: usize) -> bool {
        let base = self.base.as_u64();
        addr >= base
            && addr - base < WINDOW_SPAN
            && (count as u64)
                .checked_mul(PAGE_SIZE as u64)
                .map(|len| addr - base + len <= WINDOW_SPAN)
                .unwrap_or(false)
    }

    fn common_check(&self, addr: u64, count: usize) -> bool {
        addr != 0 && count != 0 && addr & (PAGE_SIZE as u64 - 1) == 0 && self.contains(addr, count)
    }

    fn indices(&self, addr: u64) -> (usize, usize, usize) {
        let rel = addr - self.base.as_u64();
        (
            (rel >> 30) as usize & 0x1FF,
            (rel >> 21) as usize & 0x1FF,
            (rel >> 12) as usize & 0x1FF,
        )
    }

    fn va_at(&self, pdpt_idx: usize, pdt_idx: usize, pt_off: usize) -> u64 {
        self.base.as_u64()
            + ((pdpt_idx as u64) << 30)
            + ((pdt_idx as u64) << 21)
            + ((pt_off as u64) << 12)
    }

    /// Allocate and zero a frame for a new PDT, leaving the view mapped
    /// on it. A dry pool fails the reservation rather than bugchecking.
    fn new_pdt(&self, slot: &mut Option<MapView>) -> Option<PhysicalAddress> {
        let pa = self.pool.allocate(AllocFlags::empty())?;
        load_view(slot, pa).zero();
        Some(pa)
    }

    /// Present PDT behind a top-window slot, created lazily. `None` when
    /// the slot is bypassed or the pool is dry.
    fn ensure_pdt(
        &self,
        root: &MapView,
        pdpt_idx: usize,
        slot: &mut Option<MapView>,
    ) -> Option<PhysicalAddress> {
        let pdpte = root.table().pdpte(pdpt_idx);
        if pdpte.bypass() {
            return None;
        }
        if pdpte.present() {
            return Some(pdpte.frame());
        }
        let pa = self.new_pdt(slot)?;
        root.table().set_pdpte(pdpt_idx, Pdpte::table(pa, self.user));
        Some(pa)
    }

    /// Allocate a fresh PT covered by one maximal free block; returns the
    /// frame and the PDE to install.
    fn new_pt(&self, slot: &mut Option<MapView>) -> Option<(PhysicalAddress, Pde)> {
        let pa = self.pool.allocate(AllocFlags::empty())?;
        let view = load_view(slot, pa);
        view.zero();
        let mut pde = Pde::table(pa, self.user);
        FreeList::attach(view.table(), &mut pde).init_full();
        Some((pa, pde))
    }

    /// Reserve `count` contiguous pages. `hint == 0` means any base;
    /// otherwise exactly that range is attempted. Returns 0 on failure.
    pub fn reserve(&mut self, hint: u64, count: usize) -> u64 {
        if count == 0 {
            return 0;
        }
        if hint != 0 {
            if !self.common_check(hint, count) {
                return 0;
            }
            if self.reserve_fixed(hint, count) {
                hint
            } else {
                0
            }
        } else {
            if count > MAX_ANY_PAGES {
                return 0;
            }
            if count < ENTRY_COUNT {
                self.reserve_any(count)
            } else {
                self.reserve_big(count)
            }
        }
    }

    /// Small-range path: first PT with a block large enough, first fit.
    fn reserve_any(&mut self, count: usize) -> u64 {
        debug_assert!(count < ENTRY_COUNT);
        let root = MapView::new(self.pdpt);
        let mut pdt_view = None;
        let mut pt_view = None;
        for pdpt_idx in 0..ENTRY_COUNT {
            let Some(pdt_pa) = self.ensure_pdt(&root, pdpt_idx, &mut pdt_view) else {
                continue;
            };
            let pdt = load_view(&mut pdt_view, pdt_pa);
            for pdt_idx in 0..ENTRY_COUNT {
                let pde = pdt.table().pde(pdt_idx);
                if pde.bypass() {
                    continue;
                }
                let mut pde = if pde.present() {
                    if pde.max_free() == 0 {
                        // Exact: code 0 means nothing free in this PT.
                        continue;
                    }
                    pde
                } else {
                    let Some((_, fresh)) = self.new_pt(&mut pt_view) else {
                        return 0;
                    };
                    fresh
                };
                let pt = load_view(&mut pt_view, pde.frame());
                let carved = FreeList::attach(pt.table(), &mut pde).carve_any(count as u16);
                pdt.table().set_pde(pdt_idx, pde);
                if let Some(off) = carved {
                    for i in off as usize..off as usize + count {
                        pt.table().set_pte(i, Pte::reserved());
                    }
                    return self.va_at(pdpt_idx, pdt_idx, off as usize);
                }
            }
        }
        0
    }

    /// Big-range path: a run of whole PTs that are absent or fully free,
    /// none bypassed. The trailing PT may be carved partially.
    fn reserve_big(&mut self, count: usize) -> u64 {
        let aligned_count = count.div_ceil(ENTRY_COUNT);
        let root = MapView::new(self.pdpt);
        let mut pdt_view = None;
        let mut pt_view = None;
        for pdpt_idx in 0..ENTRY_COUNT {
            let Some(pdt_pa) = self.ensure_pdt(&root, pdpt_idx, &mut pdt_view) else {
                continue;
            };
            let pdt = load_view(&mut pdt_view, pdt_pa);

            let mut run_base = 0usize;
            let mut run_len = 0usize;
            for pdt_idx in 0..ENTRY_COUNT {
                let pde = pdt.table().pde(pdt_idx);
                if pde.bypass() || (pde.present() && pde.max_free() as usize != ENTRY_COUNT) {
                    run_base = pdt_idx + 1;
                    run_len = 0;
                } else {
                    run_len += 1;
                    if run_len == aligned_count {
                        break;
                    }
                }
            }
            if run_len < aligned_count {
                continue;
            }

            let mut remaining = count;
            for step in 0..aligned_count {
                let pdt_idx = run_base + step;
                let mut pde = {
                    let pde = pdt.table().pde(pdt_idx);
                    if pde.present() {
                        pde
                    } else {
                        let Some((_, fresh)) = self.new_pt(&mut pt_view) else {
                            // Roll back the PTs already carved in this run.
                            let done = count - remaining;
                            if done > 0 {
                                self.locked_release(self.va_at(pdpt_idx, run_base, 0), done);
                            }
                            return 0;
                        };
                        fresh
                    }
                };
                let chunk = remaining.min(ENTRY_COUNT);
                let pt = load_view(&mut pt_view, pde.frame());
                if !FreeList::attach(pt.table(), &mut pde).carve_exact(0, chunk as u16) {
                    // The hint promised a fully-free PT.
                    bugcheck!(Reason::Corrupted, "stale max-free hint at pdt index {pdt_idx}");
                }
                for i in 0..chunk {
                    pt.table().set_pte(i, Pte::reserved());
                }
                pdt.table().set_pde(pdt_idx, pde);
                remaining -= chunk;
            }
            return self.va_at(pdpt_idx, run_base, 0);
        }
        0
    }

    /// Fixed-address path: walk straight to the target and carve the exact
    /// span out of each covered PT; roll the whole call back if any PT
    /// cannot satisfy its share.
    fn reserve_fixed(&mut self, addr: u64, count: usize) -> bool {
        let root = MapView::new(self.pdpt);
        let mut pdt_view = None;
        let mut pt_view = None;
        let (mut pdpt_idx, mut pdt_idx, mut pt_off) = self.indices(addr);
        let mut done = 0usize;
        while done < count {
            let Some(pdt_pa) = self.ensure_pdt(&root, pdpt_idx, &mut pdt_view) else {
                break;
            };
            let pdt = load_view(&mut pdt_view, pdt_pa);
            let mut wrapped = false;
            while done < count {
                let pde = pdt.table().pde(pdt_idx);
                if pde.bypass() {
                    break;
                }
                let mut pde = if pde.present() {
                    pde
                } else {
                    match self.new_pt(&mut pt_view) {
                        Some((_, fresh)) => fresh,
                        None => break,
                    }
                };
                let chunk = (count - done).min(ENTRY_COUNT - pt_off);
                let pt = load_view(&mut pt_view, pde.frame());
                let ok = FreeList::attach(pt.table(), &mut pde).carve_exact(pt_off as u16, chunk as u16);
                pdt.table().set_pde(pdt_idx, pde);
                if !ok {
                    break;
                }
                for i in pt_off..pt_off + chunk {
                    pt.table().set_pte(i, Pte::reserved());
                }
                done += chunk;
                pt_off = 0;
                pdt_idx += 1;
                if pdt_idx == ENTRY_COUNT {
                    pdt_idx = 0;
                    wrapped = true;
                    break;
                }
            }
            if done < count && !wrapped {
                break;
            }
            pdpt_idx += 1;
            if pdpt_idx == ENTRY_COUNT {
                break;
            }
        }
        if done == count {
            return true;
        }
        if done > 0 {
            self.locked_release(addr, done);
        }
        false
    }

    /// Apply `f` to each leaf PTE of the range in order, stopping at the
    /// first `false` or missing table; returns how many pages accepted.
    fn iterate<F>(&self, addr: u64, count: usize, mut f: F) -> usize
    where
        F: FnMut(&mut Pte, u64) -> bool,
    {
        let root = MapView::new(self.pdpt);
        let mut pdt_view = None;
        let mut pt_view = None;
        let (mut pdpt_idx, mut pdt_idx, mut pt_off) = self.indices(addr);
        let mut va = addr;
        let mut done = 0usize;
        'walk: while done < count {
            let pdpte = root.table().pdpte(pdpt_idx);
            if !pdpte.present() {
                break;
            }
            let pdt = load_view(&mut pdt_view, pdpte.frame());
            loop {
                let pde = pdt.table().pde(pdt_idx);
                if !pde.present() {
                    break 'walk;
                }
                let pt = load_view(&mut pt_view, pde.frame());
                let limit = ENTRY_COUNT.min(pt_off + (count - done));
                while pt_off < limit {
                    let mut pte = pt.table().pte(pt_off);
                    if !f(&mut pte, va) {
                        break 'walk;
                    }
                    pt.table().set_pte(pt_off, pte);
                    va += PAGE_SIZE as u64;
                    done += 1;
                    pt_off += 1;
                }
                if done == count {
                    break 'walk;
                }
                pt_off = 0;
                pdt_idx += 1;
                if pdt_idx == ENTRY_COUNT {
                    pdt_idx = 0;
                    break;
                }
            }
            pdpt_idx += 1;
            if pdpt_idx == ENTRY_COUNT {
                break;
            }
        }
        done
    }

    /// Free the range unconditionally: frames of present pages go back to
    /// the pool, PTEs are cleared, each covered PT's free list absorbs the
    /// range. Preconditions were verified by the caller.
    fn locked_release(&mut self, addr: u64, count: usize) {
        let root = MapView::new(self.pdpt);
        let mut pdt_view = None;
        let mut pt_view = None;
        let (mut pdpt_idx, mut pdt_idx, mut pt_off) = self.indices(addr);
        let mut va = addr;
        let mut done = 0usize;
        while done < count {
            let pdpte = root.table().pdpte(pdpt_idx);
            if !pdpte.present() {
                bugcheck!(Reason::Corrupted, "release walked into absent PDPT at {va:#x}");
            }
            let pdt = load_view(&mut pdt_view, pdpte.frame());
            loop {
                let mut pde = pdt.table().pde(pdt_idx);
                if !pde.present() || pde.bypass() {
                    bugcheck!(Reason::Corrupted, "release walked into absent PT at {va:#x}");
                }
                let chunk = (count - done).min(ENTRY_COUNT - pt_off);
                let pt = load_view(&mut pt_view, pde.frame());
                for i in pt_off..pt_off + chunk {
                    let pte = pt.table().pte(i);
                    if pte.bypass() {
                        bugcheck!(Reason::Corrupted, "release of bypassed page at {va:#x}");
                    }
                    if pte.present() {
                        self.pool.release(pte.frame());
                    } else {
                        debug_assert!(pte.preserve());
                    }
                    pt.table().set_pte(i, Pte::zero());
                    if pte.present() {
                        crate::arch::invlpg(va);
                    }
                    va += PAGE_SIZE as u64;
                }
                FreeList::attach(pt.table(), &mut pde).free(pt_off as u16, chunk as u16);
                pdt.table().set_pde(pdt_idx, pde);
                done += chunk;
                pt_off = 0;
                pdt_idx += 1;
                if done == count || pdt_idx == ENTRY_COUNT {
                    pdt_idx %= ENTRY_COUNT;
                    break;
                }
            }
            if done == count {
                break;
            }
            pdpt_idx += 1;
            if pdpt_idx == ENTRY_COUNT {
                bugcheck!(Reason::Corrupted, "release ran past the window");
            }
        }
    }

    /// Release a range previously reserved or committed by this space.
    pub fn release(&mut self, addr: u64, count: usize) -> bool {
        if !self.common_check(addr, count) {
            return false;
        }
        let user = self.user;
        let checked = self.iterate(addr, count, |pte, _| {
            if pte.bypass() {
                return false;
            }
            if pte.present() {
                pte.frame().as_u64() != 0 && pte.user() == user
            } else {
                pte.preserve()
            }
        });
        if checked != count {
            return false;
        }
        self.locked_release(addr, count);
        true
    }

    /// Back a fully-reserved range with fresh frames. All-or-nothing: the
    /// frame pool is asked to set the whole batch aside before the first
    /// PTE changes.
    pub fn commit(&mut self, addr: u64, count: usize) -> bool {
        if !self.common_check(addr, count) {
            return false;
        }
        let checked = self.iterate(addr, count, |pte, _| {
            pte.preserve() && !pte.bypass() && !pte.present()
        });
        if checked != count {
            return false;
        }
        if !self.pool.reserve(count) {
            return false;
        }
        let user = self.user;
        let pool = self.pool;
        let written = self.iterate(addr, count, |pte, _| {
            debug_assert!(pte.preserve() && !pte.present());
            let frame = match pool.allocate(AllocFlags::TAKE | AllocFlags::MUST_SUCCEED) {
                Some(frame) => frame,
                None => unreachable!(),
            };
            *pte = Pte::committed(frame, user);
            true
        });
        if written != count {
            bugcheck!(Reason::Corrupted, "commit mutate pass stopped at {written}/{count}");
        }
        true
    }

    /// Change attributes of a fully-committed range.
    pub fn protect(&mut self, addr: u64, count: usize, attr: super::PageAttr) -> bool {
        if !self.common_check(addr, count) {
            return false;
        }
        let user = self.user;
        let checked = self.iterate(addr, count, |pte, _| {
            pte.present() && !pte.bypass() && pte.user() == user && pte.frame().as_u64() != 0
        });
        if checked != count {
            return false;
        }
        let mask = super::PageAttr::all().bits();
        let written = self.iterate(addr, count, |pte, va| {
            pte.0 = (pte.0 & !mask) | attr.bits();
            crate::arch::invlpg(va);
            true
        });
        if written != count {
            bugcheck!(Reason::Corrupted, "protect mutate pass stopped at {written}/{count}");
        }
        true
    }

    /// Map a reserved range onto a fixed physical range (MMIO). Kernel
    /// spaces only; `pa` must sit below `addr` so the mapping is the
    /// constant delta and walk-back needs no extra table.
    pub fn assign(&mut self, addr: u64, pa: PhysicalAddress, count: usize) -> bool {
        debug_assert!(!self.user);
        if !self.common_check(addr, count) || pa.as_u64() == 0 || !pa.is_page_aligned() {
            return false;
        }
        let checked = self.iterate(addr, count, |pte, _| {
            pte.preserve() && !pte.present() && !pte.bypass()
        });
        if checked != count {
            return false;
        }
        if addr < pa.as_u64() {
            bugcheck!(Reason::NotImplemented, "assign with pa above base");
        }
        let delta = addr - pa.as_u64();
        let written = self.iterate(addr, count, |pte, va| {
            debug_assert!(pte.preserve() && !pte.present());
            *pte = Pte::assigned(PhysicalAddress::new(va - delta));
            true
        });
        if written != count {
            bugcheck!(Reason::Corrupted, "assign mutate pass stopped at {written}/{count}");
        }
        true
    }

    /// Inspect the leaf PTE for `va`. The zero PTE for anything out of
    /// range or unmapped.
    pub fn peek(&self, va: u64) -> Pte {
        if !self.contains(va, 1) {
            return Pte::zero();
        }
        let (pdpt_idx, pdt_idx, pt_idx) = self.indices(va);
        let root = MapView::new(self.pdpt);
        let pdpte = root.table().pdpte(pdpt_idx);
        if !pdpte.present() {
            return Pte::zero();
        }
        let pdt = MapView::new(pdpte.frame());
        let pde = pdt.table().pde(pdt_idx);
        if !pde.present() {
            return Pte::zero();
        }
        let pt = MapView::new(pde.frame());
        pt.table().pte(pt_idx)
    }

    /// Seal a range against the allocator: reserved and bypassed, never
    /// committed or released. Boot staging only.
    pub fn seal(&mut self, addr: u64, count: usize) -> bool {
        if !self.common_check(addr, count) {
            return false;
        }
        if !self.reserve_fixed(addr, count) {
            return false;
        }
        let sealed = self.iterate(addr, count, |pte, _| {
            *pte = Pte(PRESERVE | BYPASS);
            true
        });
        sealed == count
    }

    /// Mark the PDE covering `addr` as externally owned without allocating
    /// a PT (the transient window's 2 MiB).
    pub fn seal_directory(&mut self, addr: u64) -> bool {
        if !self.contains(addr, 1) {
            return false;
        }
        let (pdpt_idx, pdt_idx, _) = self.indices(addr);
        let root = MapView::new(self.pdpt);
        let mut pdt_view = None;
        let Some(pdt_pa) = self.ensure_pdt(&root, pdpt_idx, &mut pdt_view) else {
            return false;
        };
        let pdt = load_view(&mut pdt_view, pdt_pa);
        let mut pde = pdt.table().pde(pdt_idx);
        if pde.present() {
            return false;
        }
        pde.set_bypass();
        pdt.table().set_pde(pdt_idx, pde);
        true
    }
}

/// The kernel half: a process-wide singleton whose top-level entries are
/// shared by every address space.
pub struct KernelSpace {
    space: IrqRwLock<AddressSpace>,
}

static KERNEL_SPACE: Once<KernelSpace> = Once::new();

impl KernelSpace {
    /// Reserve n contiguous kernel pages; see [`AddressSpace::reserve`].
    pub fn reserve(&self, hint: u64, count: usize) -> u64 {
        self.space.write().reserve(hint, count)
    }

    pub fn release(&self, addr: u64, count: usize) -> bool {
        self.space.write().release(addr, count)
    }

    pub fn commit(&self, addr: u64, count: usize) -> bool {
        self.space.write().commit(addr, count)
    }

    pub fn protect(&self, addr: u64, count: usize, attr: super::PageAttr) -> bool {
        self.space.write().protect(addr, count, attr)
    }

    pub fn assign(&self, addr: u64, pa: PhysicalAddress, count: usize) -> bool {
        self.space.write().assign(addr, pa, count)
    }

    pub fn seal(&self, addr: u64, count: usize) -> bool {
        self.space.write().seal(addr, count)
    }

    pub fn seal_directory(&self, addr: u64) -> bool {
        self.space.write().seal_directory(addr)
    }

    /// The shared PDPT aliased into every user top-level table.
    pub fn shared_pdpt(&self) -> PhysicalAddress {
        self.space.read().pdpt()
    }

    pub fn pool(&self) -> &'static FramePool {
        self.space.read().pool()
    }
}

/// Build the kernel space over a zeroed PDPT frame from `pool`. First call
/// wins; later calls return the existing singleton.
pub fn init_kernel_space(pool: &'static FramePool, base: VirtualAddress) -> &'static KernelSpace {
    KERNEL_SPACE.call_once(|| {
        let pdpt = match pool.allocate(AllocFlags::MUST_SUCCEED) {
            Some(pa) => pa,
            None => unreachable!(),
        };
        MapView::new(pdpt).zero();
        KernelSpace {
            space: IrqRwLock::new(AddressSpace::from_parts(pdpt, base, false, pool)),
        }
    })
}

/// The kernel-space singleton. Boot must have staged it first.
pub fn kernel_space() -> &'static KernelSpace {
    match KERNEL_SPACE.get() {
        Some(space) => space,
        None => bugcheck!(Reason::Corrupted, "kernel space used before init"),
    }
}

/// A user half: owns its top-level table, with one slot aliased to the
/// kernel's shared PDPT so kernel code stays addressable.
pub struct UserSpace {
    pml4: PhysicalAddress,
    space: IrqRwLock<AddressSpace>,
}

/// PML4 slot covering the kernel half.
const KERNEL_PML4_SLOT: usize = 256;

impl UserSpace {
    /// Construct an empty user space. The lowest 2 MiB are sealed so the
    /// null-page region is never handed out.
    pub fn new(
        pool: &'static FramePool,
        base: VirtualAddress,
        kernel_pdpt: Option<PhysicalAddress>,
    ) -> Option<UserSpace> {
        let pml4 = pool.allocate(AllocFlags::empty())?;
        let pdpt = match pool.allocate(AllocFlags::empty()) {
            Some(pa) => pa,
            None => {
                pool.release(pml4);
                return None;
            }
        };
        {
            let view = MapView::new(pml4);
            view.zero();
            view.table().entries[0] = Pml4e::table(pdpt, true).0;
            if let Some(shared) = kernel_pdpt {
                view.table().entries[KERNEL_PML4_SLOT] = Pml4e::table(shared, false).0;
            }
        }
        MapView::new(pdpt).zero();
        let mut space = AddressSpace::from_parts(pdpt, base, true, pool);
        // Seal PDE 0 (no PT behind it) before anything can reserve there.
        if !space.seal_directory(base.as_u64()) {
            pool.release(pdpt);
            pool.release(pml4);
            return None;
        }
        Some(UserSpace {
            pml4,
            space: IrqRwLock::new(space),
        })
    }

    /// Paging root to load when a thread of the owning process runs.
    pub fn cr3(&self) -> u64 {
        self.pml4.as_u64()
    }

    pub fn base(&self) -> VirtualAddress {
        self.space.read().base()
    }

    pub fn reserve(&self, hint: u64, count: usize) -> u64 {
        self.space.write().reserve(hint, count)
    }

    pub fn release(&self, addr: u64, count: usize) -> bool {
        self.space.write().release(addr, count)
    }

    pub fn commit(&self, addr: u64, count: usize) -> bool {
        self.space.write().commit(addr, count)
    }

    pub fn protect(&self, addr: u64, count: usize, attr: super::PageAttr) -> bool {
        self.space.write().protect(addr, count, attr)
    }

    /// Leaf PTE for a user address; shared lock, zero PTE out of range.
    pub fn peek(&self, va: u64) -> Pte {
        self.space.read().peek(va)
    }

    /// Validate a user byte buffer and pin the space against concurrent
    /// release: every touched page must be committed, user-accessible and
    /// (for `write`) user-writable.
    pub fn validate(&self, addr: u64, len: usize, write: bool) -> Option<SpaceGuard<'_>> {
        if len == 0 {
            return None;
        }
        let space = self.space.read();
        let first = addr & !(PAGE_SIZE as u64 - 1);
        let last = addr.checked_add(len as u64 - 1)? & !(PAGE_SIZE as u64 - 1);
        let count = ((last - first) / PAGE_SIZE as u64) as usize + 1;
        if !space.contains(first, count) {
            return None;
        }
        for page in 0..count {
            let pte = space.peek(first + (page * PAGE_SIZE) as u64);
            if !pte.present() || !pte.user() || (write && !pte.write()) {
                return None;
            }
        }
        Some(SpaceGuard { _guard: space })
    }

}

/// Holds the space's shared lock so a validated buffer cannot be released
/// underneath the service operation using it.
pub struct SpaceGuard<'a> {
    _guard: crate::sync::IrqRwReadGuard<'a, AddressSpace>,
}

impl Drop for UserSpace {
    fn drop(&mut self) {
        let space = self.space.write();
        let pool = space.pool();
        let pdpt_view = MapView::new(space.pdpt());
        let mut pdt_view: Option<MapView> = None;
        let mut pt_view: Option<MapView> = None;
        for pdpt_idx in 0..ENTRY_COUNT {
            let pdpte = pdpt_view.table().pdpte(pdpt_idx);
            if !pdpte.present() {
                continue;
            }
            let pdt = load_view(&mut pdt_view, pdpte.frame());
            for pdt_idx in 0..ENTRY_COUNT {
                let pde = pdt.table().pde(pdt_idx);
                // Bypassed directories alias tables this space does not own.
                if !pde.present() || pde.bypass() {
                    continue;
                }
                let pt = load_view(&mut pt_view, pde.frame());
                for pt_idx in 0..ENTRY_COUNT {
                    let pte = pt.table().pte(pt_idx);
                    if pte.present() && !pte.bypass() {
                        debug_assert!(pte.user());
                        pool.release(pte.frame());
                    }
                }
                pool.release(pde.frame());
            }
            pool.release(pdpte.frame());
        }
        drop(pt_view);
        drop(pdt_view);
        drop(pdpt_view);
        pool.release(space.pdpt());
        pool.release(self.pml4);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::mm::pte::PRESENT;
    use crate::mm::{PageAttr, PAGE_SIZE, PT_SPAN};

    /// A hermetic space over its own frame pool; nothing global.
    fn fresh_space(frames: usize, user: bool) -> AddressSpace {
        crate::mm::window::test_init();
        let pool = FramePool::host_arena(frames);
        let pdpt = pool.allocate(AllocFlags::empty()).unwrap();
        MapView::new(pdpt).zero();
        AddressSpace::from_parts(pdpt, VirtualAddress::new(0x10_0000_0000), user, pool)
    }

    #[test]
    fn reserve_commit_release_roundtrip() {
        let mut space = fresh_space(64, false);
        let va = space.reserve(0, 1);
        assert_ne!(va, 0);
        assert_eq!(va % PAGE_SIZE as u64, 0);
        // Paging structures stay with the space; the frame ledger is
        // balanced from here on.
        let baseline = space.pool().available();
        assert!(space.peek(va).preserve());
        assert!(!space.peek(va).present());

        assert!(space.commit(va, 1));
        let pte = space.peek(va);
        assert!(pte.present() && pte.write() && pte.xd());
        assert_ne!(pte.frame().as_u64(), 0);

        assert!(space.release(va, 1));
        assert_eq!(space.peek(va).0, 0);
        assert_eq!(space.pool().available(), baseline);
    }

    #[test]
    fn big_reservation_is_pt_aligned() {
        let mut space = fresh_space(64, false);
        let va = space.reserve(0, 1024);
        assert_ne!(va, 0);
        // 1024 pages = two whole PTs; the base sits on a 2 MiB boundary.
        assert_eq!((va - space.base().as_u64()) % PT_SPAN, 0);
        for probe in [0u64, 511, 512, 1023] {
            assert!(space.peek(va + probe * PAGE_SIZE as u64).preserve());
        }
        assert_eq!(space.peek(va + 1024 * PAGE_SIZE as u64).0, 0);
        assert!(space.release(va, 1024));
    }

    #[test]
    fn big_reservation_skips_occupied_tables() {
        let mut space = fresh_space(64, false);
        // Dirty the first PT so it is no longer fully free.
        let small = space.reserve(0, 1);
        assert_ne!(small, 0);
        let big = space.reserve(0, 512);
        assert_ne!(big, 0);
        // The run must start past the dirtied PT.
        assert!(big >= space.base().as_u64() + PT_SPAN);
        assert_eq!((big - space.base().as_u64()) % PT_SPAN, 0);
    }

    #[test]
    fn fixed_reserve_rejects_overlap() {
        let mut space = fresh_space(64, false);
        let va = space.reserve(0, 1);
        assert_ne!(va, 0);
        assert_eq!(space.reserve(va, 1), 0);
        // State unchanged: the page is still reserved and releasable.
        assert!(space.peek(va).preserve());
        assert!(space.release(va, 1));
        // And reservable again afterwards.
        assert_eq!(space.reserve(va, 1), va);
        assert!(space.release(va, 1));
    }

    #[test]
    fn fixed_reserve_spans_table_boundary() {
        let mut space = fresh_space(64, false);
        let va = space.base().as_u64() + PT_SPAN - PAGE_SIZE as u64;
        assert_eq!(space.reserve(va, 3), va);
        assert!(space.peek(va).preserve());
        assert!(space.peek(va + PAGE_SIZE as u64).preserve());
        assert!(space.release(va, 3));
    }

    #[test]
    fn fixed_reserve_rolls_back_on_partial_failure() {
        let mut space = fresh_space(64, false);
        // Occupy one page in the second PT.
        let blocker = space.base().as_u64() + PT_SPAN + PAGE_SIZE as u64;
        assert_eq!(space.reserve(blocker, 1), blocker);
        // A span crossing into the blocker must fail wholesale.
        let start = space.base().as_u64() + PT_SPAN - (2 * PAGE_SIZE) as u64;
        assert_eq!(space.reserve(start, 4), 0);
        // The prefix carved into the first PT was rolled back.
        assert_eq!(space.peek(start).0, 0);
        assert_eq!(space.reserve(start, 2), start);
        assert!(space.release(start, 2));
        assert!(space.release(blocker, 1));
    }

    #[test]
    fn commit_requires_full_reservation() {
        let mut space = fresh_space(64, false);
        let va = space.reserve(0, 2);
        assert_ne!(va, 0);
        let baseline = space.pool().available();
        // Three pages overlap one unreserved page: atomic rejection.
        assert!(!space.commit(va, 3));
        assert_eq!(space.pool().available(), baseline);
        assert!(!space.peek(va).present());
        assert!(space.commit(va, 2));
        assert!(space.release(va, 2));
        assert_eq!(space.pool().available(), baseline);
    }

    #[test]
    fn commit_fails_cleanly_when_pool_is_short() {
        let mut space = fresh_space(8, false);
        // Leave fewer free frames than the commit needs.
        let hog = space.pool();
        let kept: std::vec::Vec<_> = (0..4)
            .map(|_| hog.allocate(AllocFlags::empty()).unwrap())
            .collect();
        let va = space.reserve(0, 16);
        assert_ne!(va, 0);
        let before = space.pool().available();
        assert!(!space.commit(va, 16));
        assert_eq!(space.pool().available(), before);
        for frame in kept {
            hog.release(frame);
        }
    }

    #[test]
    fn protect_applies_only_to_committed_ranges() {
        let mut space = fresh_space(64, false);
        let va = space.reserve(0, 2);
        assert!(!space.protect(va, 2, PageAttr::WRITE | PageAttr::XD));
        assert!(space.commit(va, 2));
        assert!(space.protect(va, 2, PageAttr::XD));
        let pte = space.peek(va);
        assert!(pte.xd() && !pte.write());
        assert!(space.protect(va, 2, PageAttr::WRITE | PageAttr::GLOBAL));
        let pte = space.peek(va);
        assert!(pte.write() && pte.global() && !pte.xd());
        assert!(space.release(va, 2));
    }

    #[test]
    fn assign_maps_by_delta_and_resists_release() {
        let mut space = fresh_space(64, false);
        let va = space.reserve(0, 4);
        assert_ne!(va, 0);
        let pa = PhysicalAddress::new(0xFEC0_0000); // below the space base
        assert!(space.assign(va, pa, 4));
        let pte = space.peek(va + 2 * PAGE_SIZE as u64);
        assert!(pte.present() && pte.bypass());
        assert_eq!(pte.frame().as_u64(), pa.as_u64() + 2 * PAGE_SIZE as u64);
        // Assigned ranges are permanent: release rejects them.
        assert!(!space.release(va, 4));
    }

    #[test]
    fn sealed_ranges_refuse_reservation() {
        let mut space = fresh_space(64, false);
        let target = space.base().as_u64() + 4 * PAGE_SIZE as u64;
        assert!(space.seal(target, 4));
        assert_eq!(space.reserve(target, 1), 0);
        assert!(!space.commit(target, 1));
        assert!(!space.release(target, 1));
        // Anonymous reservation routes around the sealed block.
        let va = space.reserve(0, 8);
        assert_ne!(va, 0);
        assert!(va >= target + 4 * PAGE_SIZE as u64 || va + 8 * PAGE_SIZE as u64 <= target);
    }

    #[test]
    fn peek_out_of_range_is_zero() {
        let space = fresh_space(16, true);
        assert_eq!(space.peek(0).0, 0);
        assert_eq!(space.peek(space.base().as_u64() + WINDOW_SPAN).0, 0);
        assert_eq!(space.peek(space.base().as_u64() + 0x1000).0, 0);
    }

    #[test]
    fn oversized_and_zero_requests_reject() {
        let mut space = fresh_space(16, false);
        assert_eq!(space.reserve(0, 0), 0);
        assert_eq!(space.reserve(0, MAX_ANY_PAGES + 1), 0);
        let outside = space.base().as_u64() + WINDOW_SPAN - PAGE_SIZE as u64;
        assert_eq!(space.reserve(outside, 2), 0);
        assert!(!space.release(space.base().as_u64() + 0x3000, 0));
    }

    #[test]
    fn user_space_lifecycle_leaks_no_frames() {
        crate::mm::window::test_init();
        let pool = FramePool::host_arena(128);
        let baseline = pool.available();
        {
            let space = UserSpace::new(pool, VirtualAddress::new(0x20_0000_0000), None).unwrap();
            assert_ne!(space.cr3(), 0);
            let va = space.reserve(0, 4);
            assert_ne!(va, 0);
            // The null-page directory is sealed: nothing lands below 2 MiB.
            assert!(va >= space.base().as_u64() + PT_SPAN);
            assert!(space.commit(va, 4));
            let pte = space.peek(va);
            assert!(pte.present() && pte.user() && pte.write());
            assert!(space.protect(va, 1, PageAttr::WRITE | PageAttr::XD));
        }
        assert_eq!(pool.available(), baseline);
    }

    #[test]
    fn user_low_2m_is_sealed() {
        crate::mm::window::test_init();
        let pool = FramePool::host_arena(64);
        let space = UserSpace::new(pool, VirtualAddress::new(0x20_0000_0000), None).unwrap();
        let low = space.base().as_u64() + 0x1000;
        assert_eq!(space.reserve(low, 1), 0);
    }

    #[test]
    fn user_buffer_validation_pins_state() {
        crate::mm::window::test_init();
        let pool = FramePool::host_arena(64);
        let space = UserSpace::new(pool, VirtualAddress::new(0x20_0000_0000), None).unwrap();
        let va = space.reserve(0, 2);
        assert!(space.validate(va, 16, false).is_none()); // not committed
        assert!(space.commit(va, 2));
        assert!(space.validate(va, 2 * PAGE_SIZE, false).is_some());
        assert!(space.validate(va + 100, PAGE_SIZE, true).is_some()); // straddles
        assert!(space.validate(va, 2 * PAGE_SIZE + 1, false).is_none()); // past end
        // Read-only pages refuse write validation.
        assert!(space.protect(va, 2, PageAttr::XD));
        assert!(space.validate(va, 16, true).is_none());
        assert!(space.validate(va, 16, false).is_some());
    }

    #[test]
    fn kernel_entries_carry_no_user_bit() {
        let mut space = fresh_space(32, false);
        let va = space.reserve(0, 1);
        assert!(space.commit(va, 1));
        assert!(!space.peek(va).user());
        assert!(space.release(va, 1));

        let mut user = fresh_space(32, true);
        let uva = user.reserve(0, 1);
        assert!(user.commit(uva, 1));
        let pte = user.peek(uva);
        assert!(pte.user() && pte.0 & PRESENT != 0);
    }
}
