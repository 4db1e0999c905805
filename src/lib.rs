//! Spindle: a single-threaded cooperative coroutine runtime
//!
//! Spindle schedules coroutines onto the calling OS thread. Each coroutine
//! runs until it yields or blocks; the next one is taken from a strict FIFO
//! run queue. Counting semaphores and mailboxes are built on the same
//! block/wake mechanism.
//!
//! # Features
//!
//! - **Standalone and stepper coroutines**: free-running tasks, or
//!   generators advanced one yield at a time with [`wait`]
//! - **Stackful and stackless coroutines**: private guarded stacks, or one
//!   shared stack for a small memory footprint
//! - **Join and cancel**: exit statuses reaped exactly once; asynchronous
//!   but safe cancellation
//! - **Semaphores and mailboxes**: broadcast wake with re-check on resume
//!
//! # Quick Start
//!
//! ```no_run
//! use spindle::{join, spawn, wait, Attr, WaitOutcome};
//!
//! fn main() -> spindle::Result<()> {
//!     let counter = spawn("counter", Attr::stepper(), || {
//!         for i in 0..3u32 {
//!             spindle::yield_now(Some(Box::new(i)));
//!         }
//!         0
//!     })?;
//!
//!     while let WaitOutcome::Yielded(Some(value)) = wait(counter)? {
//!         println!("got {:?}", value.downcast_ref::<u32>());
//!     }
//!     assert_eq!(join(counter)?, 0);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Scheduling** | [`coroutines`], [`arch`] |
//! | **Synchronization** | [`semaphore`], [`mailbox`] |
//! | **Building blocks** | [`list`], [`table`] |
//! | **Ambient** | [`config`], [`error`](Error) |

pub mod arch;
pub mod config;
pub mod coroutines;
pub mod error;
pub mod list;
pub mod mailbox;
pub mod prelude;
pub mod semaphore;
pub mod table;

pub use config::RuntimeConfig;
pub use coroutines::{
    cancel, exit, init, join, last_error, name, self_id, spawn, state, stats, wait, yield_now,
    Attr, CoroutineId, CoroutineState, CoroutineType, Payload, Resumed, SchedulerStats,
    WaitOutcome, DEFAULT_STACK_SIZE, MAIN_ID, MIN_STACK_SIZE, NAME_MAX, STATUS_CANCELLED,
    STATUS_PANICKED,
};
pub use error::{Error, ErrorCode, Result, TableKind};
pub use mailbox::{
    mbx_alloc, mbx_delete, mbx_format, mbx_free, mbx_get, mbx_len, mbx_new, mbx_post, mbx_tryget,
    MbxId, Message, MESSAGE_HEADER_SIZE,
};
pub use semaphore::{sem_count, sem_delete, sem_new, sem_p, sem_v, SemId};

/// Version of the Spindle runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
