//! Prelude module for convenient imports
//!
//! ```no_run
//! use spindle::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let sem = sem_new(0)?;
//!     let id = spawn("signaller", Attr::default(), move || {
//!         sem_v(sem).map_or(1, |_| 0)
//!     })?;
//!     sem_p(sem)?;
//!     join(id)?;
//!     Ok(())
//! }
//! ```

// Coroutines
pub use crate::coroutines::{
    cancel, exit, join, self_id, spawn, wait, yield_now, Attr, CoroutineId, CoroutineState,
    CoroutineType, Resumed, WaitOutcome, STATUS_CANCELLED,
};

// Synchronization
pub use crate::mailbox::{mbx_alloc, mbx_get, mbx_new, mbx_post, mbx_tryget, MbxId, Message};
pub use crate::semaphore::{sem_new, sem_p, sem_v, SemId};

// Error handling
pub use crate::error::{Error, ErrorCode, Result};
