//! Coroutine stacks
//!
//! Every stack is an anonymous private mapping whose lowest page is made
//! inaccessible, so an overflow faults instead of silently corrupting the
//! neighbouring allocation.
//!
//! Stackless coroutines all execute on one [`SharedStack`]. Its occupant's
//! frames are in place; every other suspended stackless coroutine keeps a
//! copy of its live frames (an *image*) that is copied back to the same
//! addresses before it resumes.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::STACK_ALIGN;
use crate::coroutines::CoroutineId;
use crate::error::{Error, Result};

/// Returns the page size of the platform, cached after the first call.
pub fn page_size() -> usize {
    static VALUE: AtomicUsize = AtomicUsize::new(0);
    match VALUE.load(Ordering::Relaxed) {
        0 => {
            // SAFETY: sysconf has no memory-safety preconditions.
            let value = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
                n if n > 0 => n as usize,
                _ => 4096,
            };
            VALUE.store(value, Ordering::Relaxed);
            value
        }
        value => value,
    }
}

/// A guarded, page-aligned stack mapping.
#[derive(Debug)]
pub struct Stack {
    /// Lowest address of the mapping (the guard page starts here).
    base: NonNull<u8>,
    /// Total mapping size, guard page included.
    size: usize,
}

impl Stack {
    /// Map a stack with at least `usable` bytes above its guard page.
    pub fn new(usable: usize) -> Result<Self> {
        let page = page_size();
        let size = usable
            .checked_next_multiple_of(page)
            .and_then(|s| s.checked_add(page))
            .ok_or_else(|| Error::out_of_memory(format!("stack of {} bytes", usable)))?;

        // SAFETY: anonymous private mapping, no file descriptor involved.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::out_of_memory(format!(
                "mmap of {} byte stack: {}",
                size,
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: `base` is the page-aligned start of a live `size`-byte mapping.
        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: same mapping as above, not yet shared with anyone.
            unsafe { libc::munmap(base, size) };
            return Err(Error::out_of_memory(format!("stack guard page: {}", err)));
        }

        Ok(Self {
            // SAFETY: mmap never returns null on success.
            base: unsafe { NonNull::new_unchecked(base.cast()) },
            size,
        })
    }

    /// Highest usable address, aligned for a call boundary.
    pub fn top(&self) -> usize {
        (self.base.as_ptr() as usize + self.size) & !(STACK_ALIGN - 1)
    }

    /// Lowest usable address (just above the guard page).
    pub fn bottom(&self) -> usize {
        self.base.as_ptr() as usize + page_size()
    }

    /// Usable bytes between the guard page and the top.
    #[cfg(test)]
    pub fn usable(&self) -> usize {
        self.top() - self.bottom()
    }

    /// Returns `true` if `addr` lies in the usable part of this stack.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom() && addr <= self.top()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: `base`/`size` describe the mapping created in `new`.
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.size) };
    }
}

/// The single execution stack shared by all stackless coroutines.
#[derive(Debug)]
pub struct SharedStack {
    stack: Stack,
    /// Coroutine whose frames are currently in place.
    pub occupant: Option<CoroutineId>,
}

impl SharedStack {
    pub fn new(usable: usize) -> Result<Self> {
        Ok(Self {
            stack: Stack::new(usable)?,
            occupant: None,
        })
    }

    pub fn top(&self) -> usize {
        self.stack.top()
    }

    /// Copy the live frames `[sp, top)` into `image`.
    ///
    /// # Safety
    /// The frames above `sp` must belong to a suspended coroutine, and the
    /// caller must not be executing on this stack.
    pub unsafe fn evict(&self, sp: usize, image: &mut Vec<u8>) {
        debug_assert!(self.stack.contains(sp), "sp {:#x} outside shared stack", sp);
        let len = self.top() - sp;
        image.clear();
        image.reserve(len);
        ptr::copy_nonoverlapping(sp as *const u8, image.as_mut_ptr(), len);
        image.set_len(len);
    }

    /// Copy `image` back to `[sp, top)` and empty it.
    ///
    /// # Safety
    /// `image` must have been produced by [`SharedStack::evict`] with the same
    /// `sp`, and the caller must not be executing on this stack.
    pub unsafe fn restore(&self, sp: usize, image: &mut Vec<u8>) {
        debug_assert_eq!(self.top() - sp, image.len());
        ptr::copy_nonoverlapping(image.as_ptr(), sp as *mut u8, image.len());
        image.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_geometry() {
        let stack = Stack::new(20 * 1024).unwrap();
        assert_eq!(stack.top() % STACK_ALIGN, 0);
        assert!(stack.usable() >= 20 * 1024);
        assert_eq!(stack.bottom() % page_size(), 0);
        assert!(stack.contains(stack.top() - 8));
        assert!(!stack.contains(stack.bottom() - 1));
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = Stack::new(8 * 1024).unwrap();
        let p = (stack.top() - 64) as *mut u64;
        unsafe {
            p.write(0xfeed_beef);
            assert_eq!(p.read(), 0xfeed_beef);
        }
    }

    #[test]
    fn test_evict_restore_round_trip() {
        let shared = SharedStack::new(16 * 1024).unwrap();
        let sp = shared.top() - 256;
        unsafe {
            for i in 0..256 {
                ((sp + i) as *mut u8).write(i as u8);
            }
            let mut image = Vec::new();
            shared.evict(sp, &mut image);
            assert_eq!(image.len(), 256);

            ptr::write_bytes(sp as *mut u8, 0, 256);
            shared.restore(sp, &mut image);
            assert!(image.is_empty());
            for i in 0..256 {
                assert_eq!(((sp + i) as *const u8).read(), i as u8);
            }
        }
    }

    #[test]
    fn test_absurd_size_is_out_of_memory() {
        let err = Stack::new(usize::MAX - 1).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::OutOfMemory);
    }
}
