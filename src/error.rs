//! Error taxonomy for the runtime.
//!
//! Synchronous setup failures (socket construction, ring init, submission)
//! surface as `Err` values from the submission methods. Kernel completion
//! errors never do: they are delivered to the operation's handler, either as
//! an optional error string (connect, stat) or as a zero-length result
//! (stream I/O), which callers treat as end-of-stream.

use std::io;

/// Errors returned by the runtime's synchronous paths.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A synchronous preparation step failed (socket/bind/listen/unlink,
    /// ring init, ring submit).
    #[error("operation '{operation}' failed: {source}")]
    Setup {
        operation: &'static str,
        #[source]
        source: io::Error,
    },
    /// No submission slot could be acquired even after flushing the ring.
    #[error("submission queue exhausted")]
    SubmissionQueueFull,
    /// Waiting on the ring failed with something other than a timeout.
    #[error("ring wait failed: {0}")]
    RingWait(io::Error),
    /// A buffer slice was requested outside the underlying region.
    #[error("slice {offset}+{len} out of range for buffer of {size} bytes")]
    BufferRange {
        offset: usize,
        len: usize,
        size: usize,
    },
    /// A path contained an interior NUL byte and cannot be passed to the kernel.
    #[error("path contains a NUL byte")]
    InvalidPath,
    /// A path was too long for a Unix socket address.
    #[error("path too long for a unix socket address")]
    PathTooLong,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Setup failure from the current `errno`.
    pub(crate) fn last_os(operation: &'static str) -> Error {
        Error::Setup {
            operation,
            source: io::Error::last_os_error(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Human-readable message for an OS error number.
pub fn error_string(errno: i32) -> String {
    io::Error::from_raw_os_error(errno).to_string()
}

/// Convert a kernel completion result into an optional error message.
///
/// Non-negative results are success; negative results are negated errno
/// values.
pub fn try_extract_error(result: i32) -> Option<String> {
    if result >= 0 {
        None
    } else {
        Some(error_string(-result))
    }
}
