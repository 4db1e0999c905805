//! Shared test helpers for integration tests
//!
//! Every test runs on its own thread and therefore gets a fresh scheduler.

use std::cell::RefCell;
use std::rc::Rc;

use spindle::{ErrorCode, RuntimeConfig};

/// Shared log that coroutines append to.
pub type Log<T> = Rc<RefCell<Vec<T>>>;

pub fn log<T>() -> Log<T> {
    Rc::new(RefCell::new(Vec::new()))
}

/// Snapshot of a log's contents.
#[allow(dead_code)]
pub fn entries<T: Clone>(log: &Log<T>) -> Vec<T> {
    log.borrow().clone()
}

/// Default configuration with a custom coroutine table capacity.
#[allow(dead_code)]
pub fn config_with_coroutines(max_coroutines: usize) -> RuntimeConfig {
    RuntimeConfig {
        max_coroutines,
        ..RuntimeConfig::default()
    }
}

/// Error code of a failed call.
#[allow(dead_code)]
pub fn code<T: std::fmt::Debug>(result: spindle::Result<T>) -> ErrorCode {
    result.unwrap_err().code()
}

/// Word-aligned buffer that outlives the test, for `mbx_format`.
#[allow(dead_code)]
pub fn leaked_buffer(words: usize) -> &'static mut [u8] {
    let words: &'static mut [usize] = Vec::leak(vec![0usize; words]);
    let len = std::mem::size_of_val(words);
    // SAFETY: a `[usize]` is valid as bytes over its whole length and the
    // byte view replaces the only reference.
    unsafe { std::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), len) }
}
