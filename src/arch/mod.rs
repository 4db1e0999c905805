//! Saved execution contexts and the low-level context switch.
//!
//! The scheduler only ever sees two operations: build a fresh [`Context`]
//! that starts a never-returning function on a given stack, and
//! [`context_switch`] from one saved context to another.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::{context_switch, Context};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::{context_switch, Context};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("spindle only supports x86_64 and aarch64");

/// Entry point of a freshly built context. It must never return: there is
/// no caller frame to return into.
pub type EntryFn = extern "C" fn() -> !;

/// Stack alignment required by both supported ABIs at a call boundary.
pub const STACK_ALIGN: usize = 16;
