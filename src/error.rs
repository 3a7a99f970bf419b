//! Error handling utils.
//!
//! All fallible runtime calls return [`Result`] with a single [`Error`] enum
//! covering the whole crate. Every error maps to a stable [`ErrorCode`] which
//! is useful for matching on the failure kind without destructuring the
//! payload (and for log messages, via [`ErrorCode::as_str`]).
//!
//! Programming errors are not represented here: yielding from the root fiber,
//! overflowing the scheduler call stack or unlocking a mutex held by another
//! fiber are bugs in the calling code and panic instead.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A bad argument was passed: waiting on an inactive watcher, a condvar
    /// wait with an unheld mutex, a zero-size or oversize buffer operation.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    /// The operation referenced a stale or never-valid fiber id. Fiber slots
    /// are recycled, so an id is only valid while its generation matches.
    #[error("no such fiber")]
    NoFiber,

    /// An underlying syscall failed, consult the wrapped os error.
    #[error("system error: {0}")]
    System(#[from] io::Error),

    /// Could not establish the pair of adjacent virtual mappings backing a
    /// mirrored ring buffer.
    #[error("failed to mmap two adjacent regions: {0}")]
    BufferMmap(io::Error),

    /// The fiber-local key is not allocated.
    #[error("fiber-local key does not exist")]
    NoKey,

    /// The buffer has no space for the requested operation.
    #[error("buffer has no space")]
    BufferNoSpace,
}

impl Error {
    /// Stable code of the error kind.
    #[inline]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Invalid(_) => ErrorCode::Invalid,
            Self::NoFiber => ErrorCode::NoFiber,
            Self::System(_) => ErrorCode::System,
            Self::BufferMmap(_) => ErrorCode::BufferMmap,
            Self::NoKey => ErrorCode::NoKey,
            Self::BufferNoSpace => ErrorCode::BufferNoSpace,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// ErrorCode
////////////////////////////////////////////////////////////////////////////////

/// Error codes used within the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success = 0,
    Invalid,
    NoFiber,
    System,
    BufferMmap,
    NoKey,
    BufferNoSpace,
}

impl ErrorCode {
    /// A human readable message for the code.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Invalid => "Invalid argument",
            Self::NoFiber => "No such fiber",
            Self::System => "System error, consult system errno",
            Self::BufferMmap => "Failed to mmap two adjacent regions",
            Self::NoKey => "Fiber-local key does not exist",
            Self::BufferNoSpace => "Buffer has no space",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
