//! Counting semaphores
//!
//! A semaphore is a counter plus a FIFO queue of blocked coroutines. When
//! [`sem_v`] moves the counter from 0 to 1 it wakes every queued coroutine;
//! each one re-checks the counter when it runs and queues again if another
//! woken coroutine got there first.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::coroutines::record;
use crate::coroutines::scheduler::{perform, with, Scheduler, Switch};
use crate::error::{messages, Error, Result};

/// Identifier of a live semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SemId(pub usize);

impl std::fmt::Display for SemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Semaphore({})", self.0)
    }
}

/// Semaphore slot. Its wait queue head lives in the scheduler's link arena.
#[derive(Debug)]
pub(crate) struct Semaphore {
    count: u32,
}

impl Scheduler {
    fn semaphore(&mut self, id: SemId) -> Result<&mut Semaphore> {
        if !self.semaphores.in_range(id.0) {
            return Err(Error::invalid(messages::out_of_range(
                "semaphore",
                id.0,
                self.semaphores.capacity(),
            )));
        }
        self.semaphores
            .get_mut(id.0)
            .ok_or_else(|| Error::not_found(format!("{}: {}", messages::NO_SUCH_SEMAPHORE, id)))
    }

    fn sem_new(&mut self, initial: u32) -> Result<SemId> {
        let id = SemId(self.semaphores.insert(Semaphore { count: initial })?);
        debug!(semaphore = id.0, initial, "semaphore created");
        Ok(id)
    }

    fn sem_delete(&mut self, id: SemId) -> Result<()> {
        self.semaphore(id)?;
        self.semaphores.remove(id.0);
        let head = self.sem_head(id.0);
        let mut stranded = 0;
        while self.links.pop_front(head).is_some() {
            stranded += 1;
        }
        if stranded > 0 {
            warn!(semaphore = id.0, stranded, "semaphore deleted with blocked coroutines");
        }
        debug!(semaphore = id.0, "semaphore deleted");
        Ok(())
    }

    fn sem_v(&mut self, id: SemId) -> Result<()> {
        let sem = self.semaphore(id)?;
        let previous = sem.count;
        sem.count = previous
            .checked_add(1)
            .ok_or_else(|| Error::invalid(format!("{} counter overflow", id)))?;
        if previous == 0 {
            let woken = self.wake_all(self.sem_head(id.0));
            trace!(semaphore = id.0, woken, "semaphore signalled");
        }
        Ok(())
    }

    /// Take one unit, or queue the caller and plan a switch.
    fn sem_try_p(&mut self, id: SemId) -> Result<Option<Switch>> {
        let sem = self.semaphore(id)?;
        if sem.count > 0 {
            sem.count -= 1;
            return Ok(None);
        }
        let head = self.sem_head(id.0);
        Ok(Some(self.block(Some(head))))
    }
}

/// Create a semaphore whose counter starts at `initial`.
pub fn sem_new(initial: u32) -> Result<SemId> {
    record(with(|s| s.sem_new(initial)))
}

/// Release the semaphore's slot.
///
/// Coroutines still blocked on it are dropped from its queue and stay
/// blocked until cancelled.
pub fn sem_delete(id: SemId) -> Result<()> {
    record(with(|s| s.sem_delete(id)))
}

/// Increment the counter, waking every blocked coroutine on a 0 to 1
/// transition.
pub fn sem_v(id: SemId) -> Result<()> {
    record(with(|s| s.sem_v(id)))
}

/// Decrement the counter, blocking while it is zero.
pub fn sem_p(id: SemId) -> Result<()> {
    record(loop {
        match with(|s| s.sem_try_p(id)) {
            Ok(Some(switch)) => perform(switch),
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    })
}

/// Current counter value.
pub fn sem_count(id: SemId) -> Result<u32> {
    record(with(|s| s.semaphore(id).map(|sem| sem.count)))
}
