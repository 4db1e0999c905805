//! aarch64 (AAPCS64) context switching

use std::arch::naked_asm;

use super::EntryFn;

/// Callee-saved register state of a suspended coroutine:
/// x19-x28, frame pointer, link register, the low halves of v8-v15 and
/// the floating-point control register.
///
/// Field order is fixed: [`context_switch`] addresses fields by offset.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Stack pointer
    sp: u64,
    /// Link register (resume address)
    lr: u64,
    /// Frame pointer
    fp: u64,
    x19: u64,
    x20: u64,
    x21: u64,
    x22: u64,
    x23: u64,
    x24: u64,
    x25: u64,
    x26: u64,
    x27: u64,
    x28: u64,
    d8: u64,
    d9: u64,
    d10: u64,
    d11: u64,
    d12: u64,
    d13: u64,
    d14: u64,
    d15: u64,
    /// Rounding mode and floating-point trap enables
    fpcr: u64,
}

impl Context {
    /// Build a context that starts `entry` on the stack whose highest
    /// (16-byte aligned) address is `stack_top`.
    pub fn new(stack_top: usize, entry: EntryFn) -> Self {
        // `ret` jumps to lr; nothing needs to be pushed.
        Context {
            sp: stack_top as u64,
            lr: entry as usize as u64,
            ..Default::default()
        }
    }

    /// Saved stack pointer. Everything between it and the stack top is live.
    pub fn stack_pointer(&self) -> usize {
        self.sp as usize
    }
}

/// Save the current callee-saved registers into `save` and resume `load`.
///
/// Returns when some other context switches back to `save`.
///
/// # Safety
/// `save` must be writable and `load` must hold either a context written by
/// a previous switch or one built by [`Context::new`] whose stack is alive.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_save: *mut Context, _load: *const Context) {
    // x0 = save, x1 = load
    naked_asm!(
        "mov x9, sp",
        "str x9,  [x0, #0x00]",
        "str lr,  [x0, #0x08]",
        "str fp,  [x0, #0x10]",
        "str x19, [x0, #0x18]",
        "str x20, [x0, #0x20]",
        "str x21, [x0, #0x28]",
        "str x22, [x0, #0x30]",
        "str x23, [x0, #0x38]",
        "str x24, [x0, #0x40]",
        "str x25, [x0, #0x48]",
        "str x26, [x0, #0x50]",
        "str x27, [x0, #0x58]",
        "str x28, [x0, #0x60]",
        "str d8,  [x0, #0x68]",
        "str d9,  [x0, #0x70]",
        "str d10, [x0, #0x78]",
        "str d11, [x0, #0x80]",
        "str d12, [x0, #0x88]",
        "str d13, [x0, #0x90]",
        "str d14, [x0, #0x98]",
        "str d15, [x0, #0xa0]",
        "mrs x9, fpcr",
        "str x9,  [x0, #0xa8]",
        "ldr x9,  [x1, #0x00]",
        "mov sp, x9",
        "ldr lr,  [x1, #0x08]",
        "ldr fp,  [x1, #0x10]",
        "ldr x19, [x1, #0x18]",
        "ldr x20, [x1, #0x20]",
        "ldr x21, [x1, #0x28]",
        "ldr x22, [x1, #0x30]",
        "ldr x23, [x1, #0x38]",
        "ldr x24, [x1, #0x40]",
        "ldr x25, [x1, #0x48]",
        "ldr x26, [x1, #0x50]",
        "ldr x27, [x1, #0x58]",
        "ldr x28, [x1, #0x60]",
        "ldr d8,  [x1, #0x68]",
        "ldr d9,  [x1, #0x70]",
        "ldr d10, [x1, #0x78]",
        "ldr d11, [x1, #0x80]",
        "ldr d12, [x1, #0x88]",
        "ldr d13, [x1, #0x90]",
        "ldr d14, [x1, #0x98]",
        "ldr d15, [x1, #0xa0]",
        "ldr x9,  [x1, #0xa8]",
        "msr fpcr, x9",
        "ret",
    );
}
