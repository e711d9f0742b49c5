//! Memory management
//!
//! Address types and page constants, the physical frame pool, the transient
//! mapping window, and the virtual-space manager over four-level page
//! tables.

pub mod frame;
pub mod freelist;
pub mod pte;
pub mod vspace;
pub mod window;

use core::sync::atomic::{AtomicU64, Ordering};

/// Size of a page/frame in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Mask of the in-page offset bits.
pub const PAGE_MASK: u64 = 0xFFF;
/// Entries per paging structure at every level.
pub const ENTRY_COUNT: usize = 512;
/// Bytes covered by one PT (one PDE).
pub const PT_SPAN: u64 = (ENTRY_COUNT * PAGE_SIZE) as u64;
/// Bytes covered by one PDT (one PDPTE).
pub const PDT_SPAN: u64 = PT_SPAN * ENTRY_COUNT as u64;
/// Bytes covered by one PDPT (one top-level entry): the span of one
/// virtual-space window.
pub const WINDOW_SPAN: u64 = PDT_SPAN * ENTRY_COUNT as u64;

/// Base of the kernel half on bare metal.
pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    pub const fn add_pages(self, n: usize) -> Self {
        Self(self.0 + (n * PAGE_SIZE) as u64)
    }
}

impl core::fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Offset of the direct physical-memory map in the kernel half. Zero means
/// identity (the host build, where "physical" addresses are real pointers).
pub static PHYS_MEM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Translate a physical address into a dereferenceable kernel pointer via
/// the direct map.
#[inline]
pub fn phys_to_virt(pa: PhysicalAddress) -> *mut u8 {
    (PHYS_MEM_OFFSET.load(Ordering::Acquire) + pa.as_u64()) as *mut u8
}

bitflags::bitflags! {
    /// Attributes accepted by `protect`. Anything outside this set rejects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageAttr: u64 {
        const WRITE = 1 << 1;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const GLOBAL = 1 << 8;
        const XD = 1 << 63;
    }
}
