//! Error types for the Spindle coroutine runtime

use std::fmt;
use thiserror::Error;

/// Main error type for Spindle
///
/// Every fallible runtime call returns one of these and records its
/// [`ErrorCode`] as the calling coroutine's last error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed argument: self-referential id, out-of-range id, bad attributes
    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    /// Operation on an id with no live object behind it
    #[error("NotFound: {0}")]
    NotFound(String),

    /// Conflicting join or cancel already in progress
    #[error("Busy: {0}")]
    Busy(String),

    /// Operation disallowed for the target's state or role
    #[error("PermissionDenied: {0}")]
    PermissionDenied(String),

    /// Fixed-capacity table is full
    #[error("CapacityExceeded: {table} table is full (capacity {capacity})")]
    CapacityExceeded {
        table: TableKind,
        capacity: usize,
    },

    /// Stack, message or table allocation failed
    #[error("OutOfMemory: {0}")]
    OutOfMemory(String),

    /// Non-blocking call found nothing ready
    #[error("WouldBlock: {0}")]
    WouldBlock(String),
}

/// Tables whose capacity is fixed at scheduler creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Coroutine,
    Semaphore,
    Mailbox,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKind::Coroutine => write!(f, "coroutine"),
            TableKind::Semaphore => write!(f, "semaphore"),
            TableKind::Mailbox => write!(f, "mailbox"),
        }
    }
}

/// Copyable error discriminant, kept per coroutine like `errno`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    Busy,
    PermissionDenied,
    CapacityExceeded,
    OutOfMemory,
    WouldBlock,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::InvalidArgument => write!(f, "InvalidArgument"),
            ErrorCode::NotFound => write!(f, "NotFound"),
            ErrorCode::Busy => write!(f, "Busy"),
            ErrorCode::PermissionDenied => write!(f, "PermissionDenied"),
            ErrorCode::CapacityExceeded => write!(f, "CapacityExceeded"),
            ErrorCode::OutOfMemory => write!(f, "OutOfMemory"),
            ErrorCode::WouldBlock => write!(f, "WouldBlock"),
        }
    }
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    /// Create a busy error
    pub fn busy(message: impl Into<String>) -> Self {
        Error::Busy(message.into())
    }

    /// Create a permission error
    pub fn permission(message: impl Into<String>) -> Self {
        Error::PermissionDenied(message.into())
    }

    /// Create an out of memory error
    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Error::OutOfMemory(message.into())
    }

    /// Create a would block error
    pub fn would_block(message: impl Into<String>) -> Self {
        Error::WouldBlock(message.into())
    }

    /// The copyable discriminant of this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::Busy(_) => ErrorCode::Busy,
            Error::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Error::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            Error::OutOfMemory(_) => ErrorCode::OutOfMemory,
            Error::WouldBlock(_) => ErrorCode::WouldBlock,
        }
    }
}

/// Result type alias for Spindle operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error message fragments
pub mod messages {
    pub const NO_SUCH_COROUTINE: &str = "no such coroutine";
    pub const NO_SUCH_SEMAPHORE: &str = "no such semaphore";
    pub const NO_SUCH_MAILBOX: &str = "no such mailbox";
    pub const SELF_TARGET: &str = "a coroutine cannot target itself";

    /// Format an "id out of range" message
    pub fn out_of_range(what: &str, id: usize, capacity: usize) -> String {
        format!("{} id {} out of range (capacity {})", what, id, capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_matches_variant() {
        assert_eq!(Error::invalid("x").code(), ErrorCode::InvalidArgument);
        assert_eq!(Error::not_found("x").code(), ErrorCode::NotFound);
        assert_eq!(Error::busy("x").code(), ErrorCode::Busy);
        assert_eq!(Error::permission("x").code(), ErrorCode::PermissionDenied);
        assert_eq!(Error::out_of_memory("x").code(), ErrorCode::OutOfMemory);
        assert_eq!(Error::would_block("x").code(), ErrorCode::WouldBlock);
        let full = Error::CapacityExceeded {
            table: TableKind::Semaphore,
            capacity: 4,
        };
        assert_eq!(full.code(), ErrorCode::CapacityExceeded);
    }

    #[test]
    fn test_display() {
        let full = Error::CapacityExceeded {
            table: TableKind::Coroutine,
            capacity: 8,
        };
        assert_eq!(
            full.to_string(),
            "CapacityExceeded: coroutine table is full (capacity 8)"
        );
        assert_eq!(
            Error::not_found(messages::NO_SUCH_MAILBOX).to_string(),
            "NotFound: no such mailbox"
        );
    }

    #[test]
    fn test_out_of_range_message() {
        assert_eq!(
            messages::out_of_range("semaphore", 9, 4),
            "semaphore id 9 out of range (capacity 4)"
        );
    }
}
