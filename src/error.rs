//! Error taxonomy for the fiber runtime.

use std::io;

/// The crate's result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the fiber runtime.
///
/// Syscall failures are passed through verbatim via [`Error::Io`]; everything
/// else is specific to fiber/scheduler bookkeeping.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A native syscall failed; the underlying [`io::Error`] is preserved
    /// verbatim, including its errno.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Allocating a fiber's stack failed (resource exhaustion).
    #[error("failed to allocate a {size}-byte fiber stack")]
    StackAlloc {
        /// The requested stack size, in bytes.
        size: usize,
    },

    /// A mutex `lock` or an I/O-plus-timer composite wait exceeded its
    /// configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// A fiber-only API (hooked I/O, `yield_now`, `delay`, ...) was called
    /// without an active scheduler running on the current thread.
    #[error("no scheduler is running on this thread")]
    NotRunning,
}

impl Error {
    /// True if this error represents [`Error::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}
