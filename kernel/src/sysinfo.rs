//! Boot handoff page
//!
//! The loader leaves a single SYSINFO page at a fixed high virtual address
//! describing where it put things: the kernel image's PE header, the ACPI
//! RSDP, the physical-memory bitmap, and the framebuffer geometry. Boot
//! staging consumes it once; nothing is persisted.

use crate::mm::PhysicalAddress;

/// Fixed virtual address of the SYSINFO page on bare metal.
pub const SYSINFO_VA: u64 = 0xFFFF_8000_003F_F000;

/// Bootloader-populated system description.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SysInfo {
    /// Physical address of the kernel image's PE header.
    pub pe_header: PhysicalAddress,
    /// Physical address of the ACPI RSDP structure.
    pub rsdp: PhysicalAddress,
    /// Physical base of the PMM bitmap prepared by the loader.
    pub pmm_bitmap: PhysicalAddress,
    /// Pages occupied by the PMM bitmap.
    pub pmm_bitmap_pages: u64,
    /// First frame the pool manages.
    pub pmm_base: PhysicalAddress,
    /// Number of managed frames.
    pub pmm_frames: u64,
    /// Framebuffer geometry.
    pub fb_base: PhysicalAddress,
    pub fb_width: u32,
    pub fb_height: u32,
    pub fb_stride: u32,
    _reserved: u32,
}

impl SysInfo {
    /// The page the loader filled in, at its fixed address.
    ///
    /// # Safety
    ///
    /// Only valid on bare metal after the loader ran; the fixed address must
    /// be mapped.
    #[cfg(target_os = "none")]
    pub unsafe fn fixed() -> &'static SysInfo {
        // SAFETY: per contract, the loader placed a SysInfo at SYSINFO_VA.
        unsafe { &*(SYSINFO_VA as *const SysInfo) }
    }
}
