//! Coroutine control blocks

use bitflags::bitflags;

use super::stack::Stack;
use super::{Attr, CoroutineId, CoroutineState, Payload, NAME_MAX};
use crate::arch::Context;
use crate::error::ErrorCode;
use crate::list::NodeId;

/// Boxed entry point of a coroutine; its return value is the exit status.
pub(crate) type Entry = Box<dyn FnOnce() -> i32>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct CcbFlags: u8 {
        /// Set once by `cancel`, never cleared.
        const CANCELLED = 0x1;
        /// The saved context runs the termination path on the private
        /// cancellation stack.
        const ON_CANCEL_STACK = 0x2;
    }
}

/// Per-coroutine control block.
///
/// Always boxed inside the scheduler's table so that `ctx` keeps a stable
/// address while a switch is in flight.
pub(crate) struct Ccb {
    pub id: CoroutineId,
    pub name: String,
    pub state: CoroutineState,
    pub attr: Attr,
    pub entry: Option<Entry>,
    pub status: i32,
    pub ctx: Context,
    /// Private execution stack (stackful coroutines only).
    pub stack: Option<Stack>,
    /// Stack used by the termination path of a cancelled stackless coroutine.
    pub cancel_stack: Option<Stack>,
    /// Frames evicted from the shared stack while another stackless
    /// coroutine occupies it. Empty for a stackless coroutine that never ran.
    pub image: Vec<u8>,
    pub joining: Option<CoroutineId>,
    pub joining_on: Option<CoroutineId>,
    pub waiting: Option<CoroutineId>,
    pub waiting_on: Option<CoroutineId>,
    pub yielded_data: Option<Payload>,
    pub flags: CcbFlags,
    pub last_error: Option<ErrorCode>,
}

impl Ccb {
    /// Control block of the thread's initial coroutine. It runs on the
    /// thread's own stack.
    pub fn main(id: CoroutineId) -> Self {
        let mut ccb = Self::new(id, "main", Attr::default(), None);
        ccb.state = CoroutineState::Running;
        ccb
    }

    pub fn new(id: CoroutineId, name: &str, attr: Attr, entry: Option<Entry>) -> Self {
        Self {
            id,
            name: truncate_name(name),
            state: CoroutineState::Allocated,
            attr,
            entry,
            status: 0,
            ctx: Context::default(),
            stack: None,
            cancel_stack: None,
            image: Vec::new(),
            joining: None,
            joining_on: None,
            waiting: None,
            waiting_on: None,
            yielded_data: None,
            flags: CcbFlags::empty(),
            last_error: None,
        }
    }

    pub fn node(&self) -> NodeId {
        NodeId(self.id.0)
    }

    pub fn is_stepper(&self) -> bool {
        self.attr.is_stepper()
    }

    /// Returns `true` if resuming this coroutine requires its frames to be
    /// in place on the shared stack.
    pub fn uses_shared_stack(&self) -> bool {
        self.attr.is_stackless() && !self.flags.contains(CcbFlags::ON_CANCEL_STACK)
    }
}

impl std::fmt::Debug for Ccb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ccb")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("attr", &self.attr)
            .field("status", &self.status)
            .field("joining", &self.joining)
            .field("waiting", &self.waiting)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

fn truncate_name(name: &str) -> String {
    if name.len() <= NAME_MAX {
        return name.to_string();
    }
    let mut end = NAME_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
