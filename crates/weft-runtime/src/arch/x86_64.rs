//! x86_64 context switching (System V)

use std::arch::naked_asm;

use super::EntryFn;

/// Callee-saved state of a suspended context
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Registers {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

/// Prepare `regs` so that switching to it calls `entry(arg)` on the stack
/// ending at `stack_top`
///
/// # Safety
///
/// `stack_top` must be the top of a writable stack that outlives the context.
pub unsafe fn init_context(regs: &mut Registers, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    // The trampoline is jumped to, not called: rsp is 16-byte aligned at its
    // first instruction so that `call r12` leaves the entry with the usual
    // rsp % 16 == 8
    let sp = (stack_top as usize) & !0xF;

    *regs = Registers {
        rsp: sp as u64,
        rip: entry_trampoline as usize as u64,
        r12: entry as usize as u64,
        r13: arg as u64,
        ..Registers::default()
    };
}

#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // entry never returns
        "ud2",
    );
}

/// Save the running context into `old` and resume `new`
///
/// Returns when something switches back to `old`.
///
/// # Safety
///
/// `new` must hold a context prepared by [`init_context`] or saved by a
/// previous switch, whose stack is still alive and not running elsewhere.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut Registers, _new: *const Registers) {
    naked_asm!(
        // Save into old (rdi)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from new (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resumed
        "1:",
        "ret",
    );
}
