//! Bare-metal x86-64 implementation of the architecture facade.

use core::arch::{asm, naked_asm};

use x86_64::instructions::{interrupts, tlb};
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr, VirtAddr};

use super::context::CpuContext;

#[inline]
pub fn core_id() -> usize {
    // Initial APIC id from CPUID leaf 1, EBX[31:24]. Stable for the life of
    // the core and dense enough to index the per-core table directly.
    let apic: u32;
    unsafe {
        asm!(
            "push rbx",
            "cpuid",
            "mov {apic:e}, ebx",
            "pop rbx",
            apic = out(reg) apic,
            inout("eax") 1u32 => _,
            out("ecx") _,
            out("edx") _,
        );
    }
    (apic >> 24) as usize
}

#[inline]
pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

#[inline]
pub fn interrupts_save_off() -> bool {
    let enabled = interrupts::are_enabled();
    interrupts::disable();
    enabled
}

#[inline]
pub fn interrupts_restore(enabled: bool) {
    if enabled {
        interrupts::enable();
    }
}

#[inline]
pub fn invlpg(va: u64) {
    tlb::flush(VirtAddr::new(va));
}

#[inline]
pub fn read_cr3() -> u64 {
    let (frame, _) = Cr3::read();
    frame.start_address().as_u64()
}

#[inline]
pub unsafe fn write_cr3(root: u64) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root));
    // SAFETY: contract delegated to the caller of arch::write_cr3.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

#[inline]
pub fn pause() {
    core::hint::spin_loop();
}

// Field offsets into CpuContext, kept in lockstep with its layout.
// 15 general-purpose registers precede rsp/rip/rflags.
//   rsp = 15*8 = 0x78, rip = 0x80, rflags = 0x88

/// Save the current register set into `save`, resume `load`.
///
/// rdi = save, rsi = load (SysV). The saved rip points at the final `ret`,
/// so a thread switched back in resumes as if this call returned.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(save: *mut CpuContext, load: *const CpuContext) {
    naked_asm!(
        // Save outgoing state.
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r11",
        "mov [rdi + 0x28], r10",
        "mov [rdi + 0x30], r9",
        "mov [rdi + 0x38], r8",
        "mov [rdi + 0x40], rdi",
        "mov [rdi + 0x48], rsi",
        "mov [rdi + 0x50], rbp",
        "mov [rdi + 0x58], rbx",
        "mov [rdi + 0x60], rdx",
        "mov [rdi + 0x68], rcx",
        "mov [rdi + 0x70], rax",
        "mov [rdi + 0x78], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x80], rax",
        "pushfq",
        "pop qword ptr [rdi + 0x88]",
        // Load incoming state: stack first, resume address and rflags
        // pushed onto it, then registers, rsi last since it addresses the
        // context. rflags is restored by the trailing popfq so the
        // interrupt flag only takes effect at the very end.
        "mov rsp, [rsi + 0x78]",
        "push qword ptr [rsi + 0x80]",
        "push qword ptr [rsi + 0x88]",
        "mov r15, [rsi + 0x00]",
        "mov r14, [rsi + 0x08]",
        "mov r13, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r11, [rsi + 0x20]",
        "mov r10, [rsi + 0x28]",
        "mov r9,  [rsi + 0x30]",
        "mov r8,  [rsi + 0x38]",
        "mov rdi, [rsi + 0x40]",
        "mov rbp, [rsi + 0x50]",
        "mov rbx, [rsi + 0x58]",
        "mov rdx, [rsi + 0x60]",
        "mov rcx, [rsi + 0x68]",
        "mov rax, [rsi + 0x70]",
        "mov rsi, [rsi + 0x48]",
        "popfq",
        "ret",
        "2:",
        "ret",
    );
}
