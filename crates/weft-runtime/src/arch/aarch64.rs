//! aarch64 context switching (AAPCS64)

use std::arch::naked_asm;

use super::EntryFn;

/// Callee-saved state of a suspended context
///
/// `lr` doubles as the resume address.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Registers {
    pub sp: u64,       // 0x00
    pub lr: u64,       // 0x08
    pub x: [u64; 10],  // 0x10  x19..x28
    pub fp: u64,       // 0x60  x29
    pub d: [u64; 8],   // 0x68  d8..d15
}

/// Prepare `regs` so that switching to it calls `entry(arg)` on the stack
/// ending at `stack_top`
///
/// # Safety
///
/// `stack_top` must be the top of a writable stack that outlives the context.
pub unsafe fn init_context(regs: &mut Registers, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let mut x = [0u64; 10];
    x[0] = entry as usize as u64; // x19
    x[1] = arg as u64; // x20

    *regs = Registers {
        sp: ((stack_top as usize) & !0xF) as u64,
        lr: entry_trampoline as usize as u64,
        x,
        ..Registers::default()
    };
}

#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        // entry never returns
        "brk #0",
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
        // Save into old (x0)
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "str x30, [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "str x29, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Load from new (x1)
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldr x30, [x1, #0x08]",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldr x29, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ret",
    );
}
