//! x86_64 System V context switching

use std::arch::naked_asm;

use super::EntryFn;

/// Callee-saved register state of a suspended coroutine.
///
/// Field order is fixed: [`context_switch`] addresses fields by offset.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Context {
    /// Stack pointer
    rsp: u64,
    /// Frame pointer
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    /// SSE control and status register
    mxcsr: u32,
    /// x87 control word
    fcw: u16,
}

/// MXCSR at process start: all exceptions masked, round to nearest.
const MXCSR_DEFAULT: u32 = 0x1F80;

/// x87 control word at process start: all exceptions masked, extended
/// precision, round to nearest.
const FCW_DEFAULT: u16 = 0x037F;

impl Default for Context {
    fn default() -> Self {
        Context {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            mxcsr: MXCSR_DEFAULT,
            fcw: FCW_DEFAULT,
        }
    }
}

impl Context {
    /// Build a context that starts `entry` on the stack whose highest
    /// (16-byte aligned) address is `stack_top`.
    pub fn new(stack_top: usize, entry: EntryFn) -> Self {
        // `ret` pops the entry address, leaving rsp at 16n+8 exactly as a
        // `call` would have.
        let initial_rsp = stack_top - 16;

        // SAFETY: the caller owns the stack and `stack_top - 16` lies inside it.
        unsafe {
            std::ptr::write(initial_rsp as *mut u64, entry as usize as u64);
        }

        Context {
            rsp: initial_rsp as u64,
            ..Default::default()
        }
    }

    /// Saved stack pointer. Everything between it and the stack top is live.
    pub fn stack_pointer(&self) -> usize {
        self.rsp as usize
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
    naked_asm!(
        // Save callee-saved registers to `save` (rdi)
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "stmxcsr dword ptr [rdi + 0x38]",
        "fnstcw word ptr [rdi + 0x3c]",
        // Load callee-saved registers from `load` (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ldmxcsr dword ptr [rsi + 0x38]",
        "fldcw word ptr [rsi + 0x3c]",
        // Fresh context: pops the entry address.
        // Suspended context: returns into its own context_switch call site.
        "ret",
    );
}
