//! Error types for the paged sample buffer.
//!
//! Only two kinds of failure reach callers during normal recording:
//!
//! - **`Io`**: a flush or a disk fetch failed. It is returned from the `append`/`flush`
//!   that triggered the flush, or from the `read` that needed the fetch. The buffer
//!   never retries on its own within that call.
//! - **`Released`**: the session was already torn down.
//!
//! Construction can additionally fail with `SessionExists` (the session directory is
//! already on disk) or `InvalidConfig`. Out-of-range reads are not errors at all; they
//! return an empty or shortened result.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results produced by this crate.
pub type SampleBufferResult<T> = std::result::Result<T, SampleBufferError>;

/// Primary error type for the sample buffer.
#[derive(Error, Debug)]
pub enum SampleBufferError {
    /// The session directory already exists; sessions are never reused or merged.
    #[error("Session directory already exists: {}", path.display())]
    SessionExists {
        /// Directory that was requested for the new session
        path: PathBuf,
    },

    /// An I/O operation against the backing file failed.
    #[error("{context}: {source}")]
    Io {
        /// What the buffer was doing when the failure happened
        context: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// A page was offered to the store at an offset other than its current end.
    #[error("Out-of-order flush: store is at offset {expected} but page starts at {actual}")]
    OutOfOrderFlush {
        /// Current length of the backing file
        expected: u64,
        /// Offset of the page that was offered
        actual: u64,
    },

    /// The buffer was released; no further operations are accepted.
    #[error("Sample buffer session has been released")]
    Released,

    /// Rejected buffer configuration.
    #[error("Invalid buffer configuration: {0}")]
    InvalidConfig(String),
}

impl SampleBufferError {
    /// Wrap an I/O error with a description of the failed operation.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error came from the filesystem.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

/// Attach lazily-built context to `std::io::Result`s.
pub(crate) trait IoResultExt<T> {
    fn io_context<F, S>(self, context: F) -> SampleBufferResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn io_context<F, S>(self, context: F) -> SampleBufferResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| SampleBufferError::io(context(), source))
    }
}
