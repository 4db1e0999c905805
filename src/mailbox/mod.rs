//! Mailboxes
//!
//! Unbounded FIFO message queues. Posting wakes every coroutine blocked in
//! [`mbx_get`]; the first one to run takes the message and the others go
//! back to waiting if the queue emptied before their turn.

mod message;

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

pub use message::{mbx_alloc, mbx_format, mbx_free, Message, MESSAGE_HEADER_SIZE};

use crate::coroutines::record;
use crate::coroutines::scheduler::{perform, with, Scheduler, Switch};
use crate::error::{messages, Error, Result};

/// Identifier of a live mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MbxId(pub usize);

impl std::fmt::Display for MbxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mailbox({})", self.0)
    }
}

/// Mailbox slot. Its waiter queue head lives in the scheduler's link arena.
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    messages: VecDeque<Message>,
}

enum Receive {
    Taken(Message),
    Blocked(Switch),
}

impl Scheduler {
    fn mailbox(&mut self, id: MbxId) -> Result<&mut Mailbox> {
        if !self.mailboxes.in_range(id.0) {
            return Err(Error::invalid(messages::out_of_range(
                "mailbox",
                id.0,
                self.mailboxes.capacity(),
            )));
        }
        self.mailboxes
            .get_mut(id.0)
            .ok_or_else(|| Error::not_found(format!("{}: {}", messages::NO_SUCH_MAILBOX, id)))
    }

    fn mbx_new(&mut self) -> Result<MbxId> {
        let id = MbxId(self.mailboxes.insert(Mailbox::default())?);
        debug!(mailbox = id.0, "mailbox created");
        Ok(id)
    }

    fn mbx_delete(&mut self, id: MbxId) -> Result<VecDeque<Message>> {
        self.mailbox(id)?;
        let mailbox = self.mailboxes.remove(id.0).unwrap_or_default();
        let head = self.mbx_head(id.0);
        let mut stranded = 0;
        while self.links.pop_front(head).is_some() {
            stranded += 1;
        }
        if stranded > 0 {
            warn!(mailbox = id.0, stranded, "mailbox deleted with blocked receivers");
        }
        debug!(mailbox = id.0, dropped = mailbox.messages.len(), "mailbox deleted");
        Ok(mailbox.messages)
    }

    fn mbx_post(&mut self, id: MbxId, mut msg: Message) -> Result<()> {
        msg.stamp(self.current_id());
        self.mailbox(id)?.messages.push_back(msg);
        let woken = self.wake_all(self.mbx_head(id.0));
        trace!(mailbox = id.0, woken, "message posted");
        Ok(())
    }

    /// Take the first message, or queue the caller and plan a switch.
    fn mbx_receive(&mut self, id: MbxId) -> Result<Receive> {
        if let Some(msg) = self.mailbox(id)?.messages.pop_front() {
            return Ok(Receive::Taken(msg));
        }
        let head = self.mbx_head(id.0);
        Ok(Receive::Blocked(self.block(Some(head))))
    }

    fn mbx_tryget(&mut self, id: MbxId) -> Result<Message> {
        self.mailbox(id)?
            .messages
            .pop_front()
            .ok_or_else(|| Error::would_block(format!("{} is empty", id)))
    }
}

/// Create an empty mailbox.
pub fn mbx_new() -> Result<MbxId> {
    record(with(|s| s.mbx_new()))
}

/// Release the mailbox's slot, dropping its queued messages.
///
/// Coroutines still blocked on it are dropped from its queue and stay
/// blocked until cancelled.
pub fn mbx_delete(id: MbxId) -> Result<()> {
    let dropped = record(with(|s| s.mbx_delete(id)))?;
    drop(dropped);
    Ok(())
}

/// Append `msg` to the mailbox and wake every blocked receiver.
///
/// On failure the message is dropped.
pub fn mbx_post(id: MbxId, msg: Message) -> Result<()> {
    record(with(|s| s.mbx_post(id, msg)))
}

/// Take the first message, blocking while the mailbox is empty.
pub fn mbx_get(id: MbxId) -> Result<Message> {
    record(loop {
        match with(|s| s.mbx_receive(id)) {
            Ok(Receive::Blocked(switch)) => perform(switch),
            Ok(Receive::Taken(msg)) => break Ok(msg),
            Err(e) => break Err(e),
        }
    })
}

/// Take the first message, failing with [`Error::WouldBlock`] if there is
/// none.
pub fn mbx_tryget(id: MbxId) -> Result<Message> {
    record(with(|s| s.mbx_tryget(id)))
}

/// Number of queued messages.
pub fn mbx_len(id: MbxId) -> Result<usize> {
    record(with(|s| s.mailbox(id).map(|mbx| mbx.messages.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::MAIN_ID;

    #[test]
    fn test_post_then_get_without_blocking() {
        let mbx = mbx_new().unwrap();
        for i in 0..3u8 {
            let mut msg = mbx_alloc(1).unwrap();
            msg.payload_mut()[0] = i;
            mbx_post(mbx, msg).unwrap();
        }
        assert_eq!(mbx_len(mbx).unwrap(), 3);
        for i in 0..3u8 {
            let msg = mbx_get(mbx).unwrap();
            assert_eq!(msg.payload(), &[i]);
            assert_eq!(msg.sender(), Some(MAIN_ID));
        }
        assert_eq!(mbx_len(mbx).unwrap(), 0);
    }

    #[test]
    fn test_tryget_on_empty_would_block() {
        let mbx = mbx_new().unwrap();
        let err = mbx_tryget(mbx).unwrap_err();
        assert_eq!(err.code(), ErrorCode::WouldBlock);
        assert_eq!(crate::last_error(), Some(ErrorCode::WouldBlock));
    }

    #[test]
    fn test_delete_drops_messages_and_frees_slot() {
        let mbx = mbx_new().unwrap();
        mbx_post(mbx, mbx_alloc(8).unwrap()).unwrap();
        mbx_delete(mbx).unwrap();
        assert_eq!(mbx_len(mbx).unwrap_err().code(), ErrorCode::NotFound);
        assert_eq!(mbx_new().unwrap(), mbx);
        assert_eq!(mbx_len(mbx).unwrap(), 0);
    }

    #[test]
    fn test_out_of_range_id() {
        let err = mbx_post(MbxId(usize::MAX), mbx_alloc(0).unwrap()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }
}
