//! Register-save area
//!
//! One `CpuContext` per thread. Seeded at thread creation with the entry
//! point, argument register and kernel selectors; thereafter owned by the
//! context-switch path.

/// Kernel code segment selector
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data/stack segment selector
pub const KERNEL_SS: u16 = 0x10;

/// RFLAGS with the interrupt flag set and reserved bit 1 high.
pub const RFLAGS_IF: u64 = 0x202;

/// x86-64 register-save area.
///
/// Layout is ABI for the context-switch assembly; field order must not
/// change without updating the offsets there.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct CpuContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,

    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,

    pub cs: u16,
    pub ss: u16,
    _pad: u32,
}

impl CpuContext {
    pub const fn zeroed() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            rbx: 0,
            rdx: 0,
            rcx: 0,
            rax: 0,
            rsp: 0,
            rip: 0,
            rflags: 0,
            cs: 0,
            ss: 0,
            _pad: 0,
        }
    }

    /// Seed a fresh kernel-thread context: `entry` in rip, `arg` in rcx,
    /// kernel selectors, interrupts enabled on first dispatch.
    pub fn kernel_entry(entry: u64, arg: u64, stack_top: u64) -> Self {
        let mut ctx = Self::zeroed();
        ctx.rip = entry;
        ctx.rcx = arg;
        ctx.rbp = stack_top;
        // Small scratch gap below the top, matching the frame the switch
        // path expects.
        ctx.rsp = stack_top - 0x20;
        ctx.rflags = RFLAGS_IF;
        ctx.cs = KERNEL_CS;
        ctx.ss = KERNEL_SS;
        ctx
    }
}

/// FPU/SSE state, saved lazily and only for threads that touched it.
#[repr(C, align(64))]
pub struct FpuState {
    pub fxsave: [u8; 512],
}

impl FpuState {
    pub const fn zeroed() -> Self {
        Self { fxsave: [0; 512] }
    }
}
