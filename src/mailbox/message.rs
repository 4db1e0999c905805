//! Mailbox messages
//!
//! A message is a byte payload preceded by a hidden header of
//! [`MESSAGE_HEADER_SIZE`] bytes: the payload length followed by the id of
//! the coroutine that posted it. Storage either comes from [`mbx_alloc`]
//! (word aligned, owned by the message) or is a caller buffer adapted in
//! place by [`mbx_format`].

use std::mem::size_of;

use crate::coroutines::{self, CoroutineId};
use crate::error::{Error, Result};

const WORD: usize = size_of::<usize>();

/// Bytes reserved in front of every payload.
pub const MESSAGE_HEADER_SIZE: usize = 2 * WORD;

#[derive(Debug)]
enum Storage {
    Owned(Box<[usize]>),
    Formatted(&'static mut [u8]),
}

/// A message that can be posted to a mailbox.
#[derive(Debug)]
pub struct Message {
    storage: Storage,
}

impl Message {
    fn bytes(&self) -> &[u8] {
        match &self.storage {
            // SAFETY: a `[usize]` is valid as bytes over its whole length.
            Storage::Owned(words) => unsafe {
                std::slice::from_raw_parts(words.as_ptr().cast::<u8>(), words.len() * WORD)
            },
            Storage::Formatted(buffer) => &buffer[..],
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            // SAFETY: as in `bytes`; any byte pattern is a valid `usize`.
            Storage::Owned(words) => unsafe {
                std::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), words.len() * WORD)
            },
            Storage::Formatted(buffer) => &mut buffer[..],
        }
    }

    fn header_word(&self, index: usize) -> usize {
        let start = index * WORD;
        let mut word = [0u8; WORD];
        word.copy_from_slice(&self.bytes()[start..start + WORD]);
        usize::from_ne_bytes(word)
    }

    fn set_header_word(&mut self, index: usize, value: usize) {
        let start = index * WORD;
        self.bytes_mut()[start..start + WORD].copy_from_slice(&value.to_ne_bytes());
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.header_word(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payload(&self) -> &[u8] {
        let len = self.len();
        &self.bytes()[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + len]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let len = self.len();
        &mut self.bytes_mut()[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + len]
    }

    /// Coroutine that last posted this message, if it was ever posted.
    pub fn sender(&self) -> Option<CoroutineId> {
        match self.header_word(1) {
            usize::MAX => None,
            id => Some(CoroutineId(id)),
        }
    }

    pub(crate) fn stamp(&mut self, sender: CoroutineId) {
        self.set_header_word(1, sender.0);
    }

    /// Give back the caller buffer of a formatted message, header included.
    /// Owned messages are released and yield `None`.
    pub fn into_buffer(self) -> Option<&'static mut [u8]> {
        match self.storage {
            Storage::Owned(_) => None,
            Storage::Formatted(buffer) => Some(buffer),
        }
    }

    fn init_header(&mut self, len: usize) {
        self.set_header_word(0, len);
        self.set_header_word(1, usize::MAX);
    }
}

/// Allocate a zeroed message with a `size`-byte payload.
pub fn mbx_alloc(size: usize) -> Result<Message> {
    coroutines::record(alloc(size))
}

fn alloc(size: usize) -> Result<Message> {
    let words = size
        .checked_add(MESSAGE_HEADER_SIZE + WORD - 1)
        .map(|bytes| bytes / WORD)
        .ok_or_else(|| Error::out_of_memory(format!("message of {} bytes", size)))?;
    let mut storage = Vec::new();
    storage
        .try_reserve_exact(words)
        .map_err(|e| Error::out_of_memory(format!("message of {} bytes: {}", size, e)))?;
    storage.resize(words, 0usize);

    let mut msg = Message {
        storage: Storage::Owned(storage.into_boxed_slice()),
    };
    msg.init_header(size);
    Ok(msg)
}

/// Release a message. Formatted buffers are simply forgotten.
pub fn mbx_free(msg: Message) {
    drop(msg);
}

/// Adapt a caller buffer into a message in place, returning it with its
/// usable payload size.
///
/// The buffer must be aligned to a machine word and hold at least
/// [`MESSAGE_HEADER_SIZE`] bytes.
pub fn mbx_format(buffer: &'static mut [u8]) -> Result<(Message, usize)> {
    coroutines::record(format_in_place(buffer))
}

fn format_in_place(buffer: &'static mut [u8]) -> Result<(Message, usize)> {
    if buffer.len() < MESSAGE_HEADER_SIZE {
        return Err(Error::invalid(format!(
            "buffer of {} bytes cannot hold the {} byte message header",
            buffer.len(),
            MESSAGE_HEADER_SIZE
        )));
    }
    if buffer.as_ptr().align_offset(WORD) != 0 {
        return Err(Error::invalid("message buffer is not word aligned"));
    }
    let size = buffer.len() - MESSAGE_HEADER_SIZE;
    let mut msg = Message {
        storage: Storage::Formatted(buffer),
    };
    msg.init_header(size);
    Ok((msg, size))
}
