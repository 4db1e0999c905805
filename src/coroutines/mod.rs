//! Cooperative coroutines
//!
//! Coroutines are scheduled onto the calling OS thread in strict FIFO order.
//! Exactly one coroutine runs at a time and control changes hands only
//! inside [`yield_now`] or an operation built on it ([`join`], [`wait`],
//! semaphore P, mailbox get).
//!
//! # Features
//!
//! - **Standalone coroutines**: re-enter the run queue on every yield
//! - **Stepper coroutines**: advanced one yield at a time by [`wait`]
//! - **Stackful coroutines**: private guarded stack of configurable size
//! - **Stackless coroutines**: share one stack; their frames are copied
//!   aside while another stackless coroutine runs
//! - **Cancellation**: [`cancel`] makes the target terminate with
//!   [`STATUS_CANCELLED`] the next time it is scheduled
//!
//! # Example
//! ```no_run
//! use spindle::{join, spawn, yield_now, Attr};
//!
//! let id = spawn("worker", Attr::default(), || {
//!     for _ in 0..3 {
//!         yield_now(None);
//!     }
//!     7
//! })
//! .unwrap();
//! assert_eq!(join(id).unwrap(), 7);
//! ```
//!
//! A coroutine that exits or is cancelled while suspended abandons its
//! frames: destructors of locals still alive on its stack do not run.

mod ccb;
pub(crate) mod scheduler;
mod stack;

use std::any::Any;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::error::{Error, ErrorCode, Result};
use scheduler::{perform, with, JoinPlan};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Id of the coroutine that owns the thread before any spawn.
pub const MAIN_ID: CoroutineId = CoroutineId(0);

/// Exit status of a cancelled coroutine.
pub const STATUS_CANCELLED: i32 = -125;

/// Exit status of a coroutine whose entry point panicked.
pub const STATUS_PANICKED: i32 = -131;

/// Smallest accepted stack size.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Stack size used when neither the attributes nor the configuration set one.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Longest stored coroutine name, in bytes.
pub const NAME_MAX: usize = 32;

/// Stack on which a cancelled stackless coroutine terminates.
pub(crate) const CANCEL_STACK_SIZE: usize = 32 * 1024;

/// Stack running the relocation between stackless coroutines.
pub(crate) const PIVOT_STACK_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// CoroutineId
// ---------------------------------------------------------------------------

/// Identifier of a live coroutine. Reused once the coroutine is joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoroutineId(pub usize);

impl std::fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Coroutine({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// CoroutineState
// ---------------------------------------------------------------------------

/// Lifecycle state of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoroutineState {
    /// Control block exists but is not schedulable yet.
    Allocated,
    /// Stepper waiting for someone to call [`wait`] on it.
    Ready,
    /// In the run queue.
    Runnable,
    /// Currently executing.
    Running,
    /// Blocked on a join, a wait, a semaphore or a mailbox.
    Waiting,
    /// Terminated; its status is kept for one [`join`].
    Zombie,
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

bitflags! {
    /// Execution mode of a coroutine. No flag means a standalone, stackful
    /// coroutine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CoroutineType: u32 {
        /// Advanced only by [`wait`].
        const STEPPER = 0x1;
        /// Runs on the stack shared by all stackless coroutines.
        const STACKLESS = 0x2;
    }
}

/// Spawn attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attr {
    kind: CoroutineType,
    stack_size: Option<usize>,
}

impl Attr {
    /// Standalone, stackful, default stack size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stepper, stackful.
    pub fn stepper() -> Self {
        Self {
            kind: CoroutineType::STEPPER,
            stack_size: None,
        }
    }

    /// Standalone, stackless.
    pub fn stackless() -> Self {
        Self {
            kind: CoroutineType::STACKLESS,
            stack_size: None,
        }
    }

    pub fn kind(&self) -> CoroutineType {
        self.kind
    }

    /// Explicit stack size, if any was set.
    pub fn stack_size(&self) -> Option<usize> {
        self.stack_size
    }

    pub fn is_stepper(&self) -> bool {
        self.kind.contains(CoroutineType::STEPPER)
    }

    pub fn is_stackless(&self) -> bool {
        self.kind.contains(CoroutineType::STACKLESS)
    }

    /// Add the flags of `kind`. Becoming stackless drops any stack size.
    pub fn set_type(&mut self, kind: CoroutineType) -> &mut Self {
        self.kind |= kind;
        if kind.contains(CoroutineType::STACKLESS) {
            self.stack_size = None;
        }
        self
    }

    /// [`Attr::set_type`] from raw bits; unknown bits are rejected.
    pub fn set_type_bits(&mut self, bits: u32) -> Result<&mut Self> {
        let kind = CoroutineType::from_bits(bits)
            .ok_or_else(|| Error::invalid(format!("unknown coroutine type bits {:#x}", bits)))?;
        Ok(self.set_type(kind))
    }

    /// Set the private stack size of a stackful coroutine.
    pub fn set_stack_size(&mut self, size: usize) -> Result<&mut Self> {
        if self.is_stackless() {
            return Err(Error::invalid("stackless coroutines have no private stack"));
        }
        if size < MIN_STACK_SIZE {
            return Err(Error::invalid(format!(
                "stack size {} below the minimum of {}",
                size, MIN_STACK_SIZE
            )));
        }
        self.stack_size = Some(size);
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Data handed from a yielding stepper to its waiter.
pub type Payload = Box<dyn Any>;

/// How [`yield_now`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumed {
    /// Another coroutine ran in between.
    Other,
    /// The caller was the only runnable coroutine; no switch happened.
    Itself,
}

/// Outcome of [`wait`].
#[derive(Debug)]
pub enum WaitOutcome {
    /// The stepper yielded, possibly with data.
    Yielded(Option<Payload>),
    /// The stepper terminated instead; [`join`] it.
    Dead,
}

impl WaitOutcome {
    pub fn is_dead(&self) -> bool {
        matches!(self, WaitOutcome::Dead)
    }

    /// The yielded data, downcast to `T`.
    pub fn downcast<T: 'static>(self) -> Option<T> {
        match self {
            WaitOutcome::Yielded(Some(data)) => data.downcast::<T>().ok().map(|b| *b),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// SchedulerStats
// ---------------------------------------------------------------------------

/// Runtime statistics of the calling thread's scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Coroutines spawned.
    pub spawned: u64,
    /// Coroutines reaped by join.
    pub joined: u64,
    /// Successful cancellations.
    pub cancelled: u64,
    /// Calls to yield.
    pub yields: u64,
    /// Context switches between distinct coroutines.
    pub context_switches: u64,
    /// Stackless frame relocations on the shared stack.
    pub relocations: u64,
    /// Live coroutines, main and zombies included.
    pub live: usize,
    /// Highest value `live` reached.
    pub peak_live: usize,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Store the code of a failed call as the caller's last error.
pub(crate) fn record<T>(result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        let code = e.code();
        with(|s| s.current_mut().last_error = Some(code));
    }
    result
}

/// Create the calling thread's scheduler with an explicit configuration.
///
/// Fails with [`Error::Busy`] once the thread has used the runtime, since
/// table sizes cannot change afterwards.
pub fn init(config: &RuntimeConfig) -> Result<()> {
    scheduler::install(config)
}

/// Spawn a coroutine running `entry`; its return value is the exit status.
///
/// Standalone coroutines are queued at the run queue tail; steppers stay
/// Ready until [`wait`] is called on them.
pub fn spawn<F>(name: &str, attr: Attr, entry: F) -> Result<CoroutineId>
where
    F: FnOnce() -> i32 + 'static,
{
    let entry: ccb::Entry = Box::new(entry);
    record(with(|s| s.spawn(name, attr, entry)))
}

/// Give up the processor.
///
/// A standalone caller goes to the run queue tail. A stepper hands `data`
/// to its waiter and goes back to Ready; it continues after its next
/// [`wait`]. A standalone caller's `data` is dropped.
pub fn yield_now(data: Option<Payload>) -> Resumed {
    let (switch, undelivered) = with(|s| s.prepare_yield(data));
    drop(undelivered);
    match switch {
        Some(switch) => {
            perform(switch);
            Resumed::Other
        }
        None => Resumed::Itself,
    }
}

/// Terminate the calling coroutine with `status`.
pub fn exit(status: i32) -> ! {
    scheduler::terminate(status)
}

/// Wait for `id` to terminate, release it and return its exit status.
///
/// Errors: [`Error::NotFound`] for an unknown id, [`Error::InvalidArgument`]
/// for the caller itself, [`Error::Busy`] if another coroutine already joins
/// it.
pub fn join(id: CoroutineId) -> Result<i32> {
    match record(with(|s| s.prepare_join(id)))? {
        JoinPlan::Reap => {}
        JoinPlan::Block(switch) => perform(switch),
    }
    let (status, reaped) = with(|s| s.finish_join());
    drop(reaped);
    Ok(status)
}

/// Run the Ready stepper `id` until its next yield or its termination.
///
/// Errors: [`Error::NotFound`] for an unknown id, [`Error::InvalidArgument`]
/// for the caller itself or a standalone target,
/// [`Error::PermissionDenied`] if the target is not Ready.
pub fn wait(id: CoroutineId) -> Result<WaitOutcome> {
    let switch = record(with(|s| s.prepare_wait(id)))?;
    perform(switch);
    Ok(with(|s| s.finish_wait()))
}

/// Make `id` terminate with [`STATUS_CANCELLED`] the next time it runs.
///
/// Errors: [`Error::NotFound`] for an unknown id, [`Error::InvalidArgument`]
/// for the caller itself or a terminated target,
/// [`Error::PermissionDenied`] for the main coroutine, [`Error::Busy`] if
/// already cancelled.
pub fn cancel(id: CoroutineId) -> Result<()> {
    let (entry, image) = record(with(|s| s.cancel(id)))?;
    drop(entry);
    drop(image);
    Ok(())
}

/// Id of the calling coroutine.
pub fn self_id() -> CoroutineId {
    with(|s| s.current_id())
}

/// Code of the calling coroutine's most recent failed call.
pub fn last_error() -> Option<ErrorCode> {
    with(|s| s.current_mut().last_error)
}

/// Current state of `id`.
pub fn state(id: CoroutineId) -> Result<CoroutineState> {
    record(with(|s| s.lookup(id).map(|ccb| ccb.state)))
}

/// Name given to `id` at spawn.
pub fn name(id: CoroutineId) -> Result<String> {
    record(with(|s| s.lookup(id).map(|ccb| ccb.name.clone())))
}

/// Statistics of the calling thread's scheduler.
pub fn stats() -> SchedulerStats {
    with(|s| s.stats())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_defaults() {
        let attr = Attr::default();
        assert!(!attr.is_stepper());
        assert!(!attr.is_stackless());
        assert_eq!(attr.stack_size(), None);
        assert_eq!(Attr::new(), attr);
    }

    #[test]
    fn test_attr_set_type_accumulates() {
        let mut attr = Attr::stepper();
        attr.set_type(CoroutineType::STACKLESS);
        assert!(attr.is_stepper());
        assert!(attr.is_stackless());
    }

    #[test]
    fn test_attr_type_bits() {
        let mut attr = Attr::new();
        attr.set_type_bits(0x3).unwrap();
        assert_eq!(attr.kind(), CoroutineType::STEPPER | CoroutineType::STACKLESS);
        let err = Attr::new().set_type_bits(0x4).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_attr_stack_size_rules() {
        let mut attr = Attr::new();
        assert!(attr.set_stack_size(MIN_STACK_SIZE - 1).is_err());
        attr.set_stack_size(256 * 1024).unwrap();
        assert_eq!(attr.stack_size(), Some(256 * 1024));

        attr.set_type(CoroutineType::STACKLESS);
        assert_eq!(attr.stack_size(), None);
        let err = attr.set_stack_size(256 * 1024).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_wait_outcome_downcast() {
        let outcome = WaitOutcome::Yielded(Some(Box::new(5u64)));
        assert!(!outcome.is_dead());
        assert_eq!(outcome.downcast::<u64>(), Some(5));
        assert_eq!(WaitOutcome::Yielded(Some(Box::new("x"))).downcast::<u64>(), None);
        assert!(WaitOutcome::Dead.is_dead());
    }

    #[test]
    fn test_main_coroutine_is_running() {
        assert_eq!(self_id(), MAIN_ID);
        assert_eq!(state(MAIN_ID).unwrap(), CoroutineState::Running);
        assert_eq!(name(MAIN_ID).unwrap(), "main");
        assert_eq!(yield_now(None), Resumed::Itself);
    }
}
