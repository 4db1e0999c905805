//! The per-thread scheduler
//!
//! One [`Scheduler`] lives in a thread-local and owns every piece of
//! runtime state: the three control block tables, the link arena holding the
//! run queue and all wait queues, and the stacks.
//!
//! Operations are split in two halves. The first half runs inside [`with`],
//! mutates state and returns a [`Switch`] plan when the caller must give up
//! the processor. The plan is then executed by [`perform`] after the
//! scheduler borrow has been released, so no reference into the scheduler is
//! ever live across a context switch. Whatever runs after the switch (the
//! second half) borrows the scheduler afresh.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error, trace, warn};

use super::ccb::{Ccb, CcbFlags, Entry};
use super::stack::{SharedStack, Stack};
use super::{
    Attr, CoroutineId, CoroutineState, Payload, SchedulerStats, WaitOutcome, CANCEL_STACK_SIZE,
    MAIN_ID, PIVOT_STACK_SIZE, STATUS_CANCELLED, STATUS_PANICKED,
};
use crate::arch::{context_switch, Context};
use crate::config::RuntimeConfig;
use crate::error::{messages, Error, Result, TableKind};
use crate::list::{LinkArena, NodeId};
use crate::mailbox::Mailbox;
use crate::semaphore::Semaphore;
use crate::table::ControlBlockTable;

thread_local! {
    static SCHEDULER: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

/// Run `f` against this thread's scheduler, creating it from the
/// environment on first use.
///
/// `f` must not switch contexts and must not re-enter the runtime.
pub(crate) fn with<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    SCHEDULER.with(|cell| {
        let mut slot = cell.borrow_mut();
        let scheduler = slot.get_or_insert_with(Scheduler::from_env);
        f(scheduler)
    })
}

/// Create this thread's scheduler from an explicit configuration.
pub(crate) fn install(config: &RuntimeConfig) -> Result<()> {
    SCHEDULER.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_some() {
            return Err(Error::busy("scheduler already running on this thread"));
        }
        *slot = Some(Scheduler::new(config)?);
        Ok(())
    })
}

/// Report a broken scheduler invariant and abort the process.
pub(crate) fn fatal(what: &str) -> ! {
    error!(what, "scheduler invariant violated");
    std::process::abort()
}

/// A planned context switch: save the running context, load another.
#[must_use = "a planned switch does nothing until performed"]
pub(crate) struct Switch {
    save: *mut Context,
    load: *const Context,
}

/// Execute a planned switch. Returns when the saved context is resumed.
pub(crate) fn perform(switch: Switch) {
    // SAFETY: `save` points into the boxed control block of the running
    // coroutine and `load` into a suspended control block or the pivot.
    // Control blocks are only freed by join, which never targets a running
    // coroutine or one that is about to be resumed.
    unsafe { context_switch(switch.save, switch.load) }
}

/// Result of the first half of `join`.
pub(crate) enum JoinPlan {
    /// Target already terminated; reap it right away.
    Reap,
    /// Target still live; block until it terminates.
    Block(Switch),
}

/// Small stack on which relocation between stackless coroutines runs.
struct Pivot {
    stack: Stack,
    ctx: Context,
}

/// The cooperative scheduler of one OS thread.
pub(crate) struct Scheduler {
    pub(crate) coroutines: ControlBlockTable<Box<Ccb>>,
    pub(crate) semaphores: ControlBlockTable<Semaphore>,
    pub(crate) mailboxes: ControlBlockTable<Mailbox>,
    pub(crate) links: LinkArena,
    runq: NodeId,
    current: CoroutineId,
    stack_size: usize,
    shared: Option<SharedStack>,
    pivot: Option<Box<Pivot>>,
    /// Stackless coroutine the pivot is about to bring onto the shared stack.
    pending: Option<CoroutineId>,
    pub(crate) stats: SchedulerStats,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("coroutines", &self.coroutines.len())
            .field("semaphores", &self.semaphores.len())
            .field("mailboxes", &self.mailboxes.len())
            .field("current", &self.current)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Scheduler {
    pub(crate) fn new(config: &RuntimeConfig) -> Result<Self> {
        if config.max_coroutines == 0 {
            return Err(Error::invalid("max_coroutines must leave room for the main coroutine"));
        }
        let mut coroutines = ControlBlockTable::new(TableKind::Coroutine, config.max_coroutines)?;
        let semaphores = ControlBlockTable::new(TableKind::Semaphore, config.max_semaphores)?;
        let mailboxes = ControlBlockTable::new(TableKind::Mailbox, config.max_mailboxes)?;

        let nodes = [config.max_semaphores, config.max_mailboxes, 1]
            .into_iter()
            .try_fold(config.max_coroutines, usize::checked_add)
            .ok_or_else(|| Error::out_of_memory("link arena size overflows"))?;
        let mut links = LinkArena::new(nodes)?;
        let runq = NodeId(config.max_coroutines);

        let main = coroutines.insert_with(|id| Box::new(Ccb::main(CoroutineId(id))))?;
        debug_assert_eq!(main, MAIN_ID.0);
        links.add_tail(runq, NodeId(main));

        debug!(
            max_coroutines = config.max_coroutines,
            max_semaphores = config.max_semaphores,
            max_mailboxes = config.max_mailboxes,
            stack_size = config.stack_size,
            "scheduler created"
        );

        Ok(Self {
            coroutines,
            semaphores,
            mailboxes,
            links,
            runq,
            current: MAIN_ID,
            stack_size: config.stack_size.max(super::MIN_STACK_SIZE),
            shared: None,
            pivot: None,
            pending: None,
            stats: SchedulerStats {
                live: 1,
                peak_live: 1,
                ..Default::default()
            },
        })
    }

    fn from_env() -> Self {
        Self::new(&RuntimeConfig::from_env()).unwrap_or_else(|e| {
            error!(error = %e, "cannot size scheduler from the environment, using defaults");
            Self::new(&RuntimeConfig::default()).unwrap_or_else(|_| fatal("default scheduler"))
        })
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub(crate) fn current_id(&self) -> CoroutineId {
        self.current
    }

    pub(crate) fn ccb(&self, id: CoroutineId) -> &Ccb {
        self.coroutines
            .get(id.0)
            .unwrap_or_else(|| fatal("dangling coroutine id"))
    }

    pub(crate) fn ccb_mut(&mut self, id: CoroutineId) -> &mut Ccb {
        self.coroutines
            .get_mut(id.0)
            .unwrap_or_else(|| fatal("dangling coroutine id"))
    }

    pub(crate) fn current_mut(&mut self) -> &mut Ccb {
        let id = self.current;
        self.ccb_mut(id)
    }

    /// Look up a live coroutine other than the caller.
    fn peer(&self, id: CoroutineId) -> Result<&Ccb> {
        let ccb: &Ccb = self
            .coroutines
            .get(id.0)
            .ok_or_else(|| Error::not_found(format!("{}: {}", messages::NO_SUCH_COROUTINE, id)))?;
        if id == self.current {
            return Err(Error::invalid(messages::SELF_TARGET));
        }
        Ok(ccb)
    }

    pub(crate) fn lookup(&self, id: CoroutineId) -> Result<&Ccb> {
        self.coroutines
            .get(id.0)
            .map(|ccb| &**ccb)
            .ok_or_else(|| Error::not_found(format!("{}: {}", messages::NO_SUCH_COROUTINE, id)))
    }

    /// Wait queue head of semaphore slot `index`.
    pub(crate) fn sem_head(&self, index: usize) -> NodeId {
        NodeId(self.runq.0 + 1 + index)
    }

    /// Waiter queue head of mailbox slot `index`.
    pub(crate) fn mbx_head(&self, index: usize) -> NodeId {
        NodeId(self.runq.0 + 1 + self.semaphores.capacity() + index)
    }

    pub(crate) fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            live: self.coroutines.len(),
            ..self.stats.clone()
        }
    }

    // -----------------------------------------------------------------------
    // Queues and dispatch
    // -----------------------------------------------------------------------

    /// Append `id` to the run queue.
    pub(crate) fn make_runnable(&mut self, id: CoroutineId) {
        let ccb = self.ccb_mut(id);
        ccb.state = CoroutineState::Runnable;
        let node = ccb.node();
        self.links.unlink(node);
        self.links.add_tail(self.runq, node);
        trace!(coroutine = id.0, "runnable");
    }

    /// Wake every coroutine queued on `head`, in queue order.
    pub(crate) fn wake_all(&mut self, head: NodeId) -> usize {
        let mut woken = 0;
        while let Some(node) = self.links.pop_front(head) {
            self.make_runnable(CoroutineId(node.0));
            woken += 1;
        }
        woken
    }

    /// Block the running coroutine, optionally queueing it at the tail of
    /// `queue`, and plan the switch to the next runnable one.
    pub(crate) fn block(&mut self, queue: Option<NodeId>) -> Switch {
        let ccb = self.current_mut();
        ccb.state = CoroutineState::Waiting;
        let node = ccb.node();
        self.links.unlink(node);
        if let Some(head) = queue {
            self.links.add_tail(head, node);
        }
        self.dispatch()
            .unwrap_or_else(|| fatal("blocked coroutine rescheduled itself"))
    }

    /// Elect the front of the run queue. Returns `None` when it is the
    /// running coroutine itself.
    fn dispatch(&mut self) -> Option<Switch> {
        let next = match self.links.front(self.runq) {
            Some(node) => CoroutineId(node.0),
            None => fatal("run queue is empty"),
        };
        let prev = self.current;
        let incoming = self.ccb_mut(next);
        if incoming.state != CoroutineState::Runnable && next != prev {
            fatal("non-runnable coroutine in the run queue");
        }
        incoming.state = CoroutineState::Running;
        if next == prev {
            return None;
        }

        self.current = next;
        self.stats.context_switches += 1;
        trace!(from = prev.0, to = next.0, "context switch");

        let save: *mut Context = &mut self.ccb_mut(prev).ctx;
        let incoming = self.ccb(next);
        let occupant = self.shared.as_ref().and_then(|s| s.occupant);
        let load = if incoming.uses_shared_stack() && occupant != Some(next) {
            self.pending = Some(next);
            let pivot = self
                .pivot
                .as_mut()
                .unwrap_or_else(|| fatal("stackless coroutine without a pivot stack"));
            pivot.ctx = Context::new(pivot.stack.top(), relocate_main);
            &pivot.ctx as *const Context
        } else {
            &incoming.ctx as *const Context
        };
        Some(Switch { save, load })
    }

    /// Runs on the pivot stack: move the pending stackless coroutine's frames
    /// onto the shared stack and return the context to load.
    fn relocate(&mut self) -> *const Context {
        let next = self
            .pending
            .take()
            .unwrap_or_else(|| fatal("relocation without a target"));
        let shared = self
            .shared
            .as_mut()
            .unwrap_or_else(|| fatal("relocation without a shared stack"));

        if let Some(occupant) = shared.occupant.take() {
            let ccb = self
                .coroutines
                .get_mut(occupant.0)
                .unwrap_or_else(|| fatal("dangling shared stack occupant"));
            // SAFETY: the occupant is suspended and we run on the pivot stack.
            unsafe { shared.evict(ccb.ctx.stack_pointer(), &mut ccb.image) };
            trace!(coroutine = occupant.0, bytes = ccb.image.len(), "evicted");
        }

        let ccb = self
            .coroutines
            .get_mut(next.0)
            .unwrap_or_else(|| fatal("dangling relocation target"));
        if ccb.image.is_empty() {
            ccb.ctx = Context::new(shared.top(), coroutine_main);
        } else {
            // SAFETY: the image was evicted from this stack at this pointer.
            unsafe { shared.restore(ccb.ctx.stack_pointer(), &mut ccb.image) };
        }
        shared.occupant = Some(next);
        self.stats.relocations += 1;
        &ccb.ctx as *const Context
    }

    fn ensure_shared_stack(&mut self) -> Result<()> {
        if self.shared.is_none() {
            self.shared = Some(SharedStack::new(self.stack_size)?);
        }
        if self.pivot.is_none() {
            self.pivot = Some(Box::new(Pivot {
                stack: Stack::new(PIVOT_STACK_SIZE)?,
                ctx: Context::default(),
            }));
        }
        Ok(())
    }

    /// Forget `id` as the shared stack occupant; its frames become garbage.
    fn vacate(&mut self, id: CoroutineId) {
        if let Some(shared) = self.shared.as_mut() {
            if shared.occupant == Some(id) {
                shared.occupant = None;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Coroutine lifecycle
    // -----------------------------------------------------------------------

    pub(crate) fn spawn(&mut self, name: &str, attr: Attr, entry: Entry) -> Result<CoroutineId> {
        if self.coroutines.is_full() {
            return Err(Error::CapacityExceeded {
                table: TableKind::Coroutine,
                capacity: self.coroutines.capacity(),
            });
        }

        let (stack, cancel_stack) = if attr.is_stackless() {
            self.ensure_shared_stack()?;
            (None, Some(Stack::new(CANCEL_STACK_SIZE)?))
        } else {
            let size = attr.stack_size().unwrap_or(self.stack_size);
            (Some(Stack::new(size)?), None)
        };

        let index = self.coroutines.insert_with(|index| {
            let mut ccb = Ccb::new(CoroutineId(index), name, attr, Some(entry));
            if let Some(stack) = &stack {
                ccb.ctx = Context::new(stack.top(), coroutine_main);
            }
            ccb.stack = stack;
            ccb.cancel_stack = cancel_stack;
            Box::new(ccb)
        })?;
        let id = CoroutineId(index);

        if attr.is_stepper() {
            self.ccb_mut(id).state = CoroutineState::Ready;
        } else {
            self.make_runnable(id);
        }

        self.stats.spawned += 1;
        self.stats.peak_live = self.stats.peak_live.max(self.coroutines.len());
        debug!(coroutine = id.0, name, kind = ?attr.kind(), "spawned");
        Ok(id)
    }

    /// First half of `yield`. Also returns data that could not be handed
    /// over, for the caller to drop outside the scheduler borrow.
    pub(crate) fn prepare_yield(&mut self, data: Option<Payload>) -> (Option<Switch>, Option<Payload>) {
        let id = self.current;
        let ccb = self.ccb_mut(id);
        if ccb.state != CoroutineState::Running {
            fatal("yield from a coroutine that is not running");
        }
        self.stats.yields += 1;

        let ccb = self.ccb_mut(id);
        if ccb.is_stepper() {
            ccb.state = CoroutineState::Ready;
            let node = ccb.node();
            let undelivered = match ccb.waiting {
                Some(waiter) => {
                    ccb.yielded_data = data;
                    self.make_runnable(waiter);
                    None
                }
                None => {
                    warn!(coroutine = id.0, "stepper yielded with nobody waiting");
                    data
                }
            };
            self.links.unlink(node);
            (self.dispatch(), undelivered)
        } else {
            ccb.state = CoroutineState::Runnable;
            let node = ccb.node();
            if self.links.back(self.runq) != Some(node) {
                self.links.unlink(node);
                self.links.add_tail(self.runq, node);
            }
            (self.dispatch(), data)
        }
    }

    /// Turn the running coroutine into a zombie and plan the switch away.
    fn prepare_exit(&mut self, status: i32) -> Option<Switch> {
        let id = self.current;
        let ccb = self.ccb_mut(id);
        ccb.status = status;
        ccb.state = CoroutineState::Zombie;
        ccb.yielded_data = None;
        let (node, joiner, waiter) = (ccb.node(), ccb.joining, ccb.waiting);
        self.links.unlink(node);
        self.vacate(id);

        if let Some(joiner) = joiner {
            self.make_runnable(joiner);
        }
        if let Some(waiter) = waiter {
            self.make_runnable(waiter);
        }
        debug!(coroutine = id.0, status, "terminated");
        self.dispatch()
    }

    pub(crate) fn prepare_join(&mut self, target: CoroutineId) -> Result<JoinPlan> {
        let caller = self.current;
        let ccb = self.peer(target)?;
        if let Some(joiner) = ccb.joining {
            return Err(Error::busy(format!("{} is already joined by {}", target, joiner)));
        }
        let zombie = ccb.state == CoroutineState::Zombie;

        self.ccb_mut(target).joining = Some(caller);
        self.ccb_mut(caller).joining_on = Some(target);
        if zombie {
            return Ok(JoinPlan::Reap);
        }
        trace!(coroutine = caller.0, target = target.0, "joining");
        Ok(JoinPlan::Block(self.block(None)))
    }

    /// Second half of `join`: claim the status and release the target's
    /// slot. The control block is handed back so that its stack and closure
    /// are dropped outside the scheduler borrow.
    pub(crate) fn finish_join(&mut self) -> (i32, Box<Ccb>) {
        let target = self
            .current_mut()
            .joining_on
            .take()
            .unwrap_or_else(|| fatal("join resumed without a target"));
        let ccb = self
            .coroutines
            .remove(target.0)
            .unwrap_or_else(|| fatal("joined coroutine vanished"));
        if ccb.state != CoroutineState::Zombie {
            fatal("joiner resumed before its target terminated");
        }
        self.links.unlink(ccb.node());
        self.vacate(target);
        if let Some(waiter) = ccb.waiting {
            if let Some(peer) = self.coroutines.get_mut(waiter.0) {
                peer.waiting_on = None;
            }
        }
        self.stats.joined += 1;
        debug!(coroutine = target.0, status = ccb.status, "joined");
        (ccb.status, ccb)
    }

    pub(crate) fn prepare_wait(&mut self, target: CoroutineId) -> Result<Switch> {
        let caller = self.current;
        let ccb = self.peer(target)?;
        if !ccb.is_stepper() {
            return Err(Error::invalid(format!("{} is not a stepper", target)));
        }
        if ccb.state != CoroutineState::Ready {
            return Err(Error::permission(format!(
                "{} is {:?}, not Ready",
                target, ccb.state
            )));
        }

        self.ccb_mut(target).waiting = Some(caller);
        self.ccb_mut(caller).waiting_on = Some(target);
        self.make_runnable(target);
        Ok(self.block(None))
    }

    /// Second half of `wait`.
    pub(crate) fn finish_wait(&mut self) -> WaitOutcome {
        let Some(target) = self.current_mut().waiting_on.take() else {
            // Target was reaped by someone else before we ran again.
            return WaitOutcome::Dead;
        };
        let ccb = self.ccb_mut(target);
        ccb.waiting = None;
        let data = ccb.yielded_data.take();
        match ccb.state {
            CoroutineState::Ready => WaitOutcome::Yielded(data),
            _ => WaitOutcome::Dead,
        }
    }

    /// Cancel `target`. Returns the pieces of the target that must be
    /// dropped outside the scheduler borrow.
    pub(crate) fn cancel(&mut self, target: CoroutineId) -> Result<(Option<Entry>, Vec<u8>)> {
        let ccb = self.peer(target)?;
        if target == MAIN_ID {
            return Err(Error::permission("the main coroutine cannot be cancelled"));
        }
        if ccb.flags.contains(CcbFlags::CANCELLED) {
            return Err(Error::busy(format!("{} is already cancelled", target)));
        }
        let (state, waiting_on, joining_on) = (ccb.state, ccb.waiting_on, ccb.joining_on);

        match state {
            CoroutineState::Zombie => {
                return Err(Error::invalid(format!("{} has already terminated", target)));
            }
            CoroutineState::Waiting => {
                if let Some(peer) = waiting_on {
                    self.ccb_mut(peer).waiting = None;
                }
                if let Some(peer) = joining_on {
                    self.ccb_mut(peer).joining = None;
                }
                let ccb = self.ccb_mut(target);
                ccb.waiting_on = None;
                ccb.joining_on = None;
                let node = ccb.node();
                self.links.unlink(node);
                self.make_runnable(target);
            }
            CoroutineState::Ready => self.make_runnable(target),
            CoroutineState::Runnable => {}
            CoroutineState::Allocated | CoroutineState::Running => {
                fatal("cancel target in an impossible state")
            }
        }

        self.vacate(target);
        let ccb = self.ccb_mut(target);
        ccb.flags |= CcbFlags::CANCELLED;
        let entry = ccb.entry.take();
        let image = std::mem::take(&mut ccb.image);
        let top = if let Some(stack) = &ccb.stack {
            stack.top()
        } else {
            ccb.flags |= CcbFlags::ON_CANCEL_STACK;
            match &ccb.cancel_stack {
                Some(stack) => stack.top(),
                None => fatal("stackless coroutine without a cancellation stack"),
            }
        };
        ccb.ctx = Context::new(top, cancelled_main);

        self.stats.cancelled += 1;
        debug!(coroutine = target.0, "cancelled");
        Ok((entry, image))
    }
}

// ---------------------------------------------------------------------------
// Entry trampolines
// ---------------------------------------------------------------------------

/// Terminate the running coroutine with `status`.
pub(crate) fn terminate(status: i32) -> ! {
    if let Some(switch) = with(|s| s.prepare_exit(status)) {
        perform(switch);
    }
    fatal("terminated coroutine resumed")
}

/// First frame of every coroutine.
extern "C" fn coroutine_main() -> ! {
    let (id, entry) = with(|s| {
        let ccb = s.current_mut();
        (ccb.id, ccb.entry.take())
    });
    let Some(entry) = entry else {
        fatal("coroutine started without an entry point")
    };
    let status = match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(status) => status,
        Err(_) => {
            error!(coroutine = id.0, "coroutine panicked");
            STATUS_PANICKED
        }
    };
    terminate(status)
}

/// First frame of a cancelled coroutine.
extern "C" fn cancelled_main() -> ! {
    terminate(STATUS_CANCELLED)
}

/// First frame of the pivot stack.
extern "C" fn relocate_main() -> ! {
    let load = with(|s| s.relocate());
    let mut discarded = Context::default();
    // SAFETY: `load` points into a boxed control block that is now in place.
    unsafe { context_switch(&mut discarded, load) };
    fatal("pivot context resumed")
}
