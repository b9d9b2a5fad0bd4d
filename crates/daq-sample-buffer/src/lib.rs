//! Paged, disk-backed sample buffer for long profiler recordings.
//!
//! A recording session produces an append-only byte stream that outgrows memory. This
//! crate keeps the hot ends of that stream in memory and everything else in a single
//! `session.raw` file per session:
//!
//! - [`WriteBuffer`]: the in-progress tail page plus the last few flushed pages.
//! - [`ReadCache`]: page-aligned cache over the file with background adjacency prefetch.
//! - [`PagedSampleBuffer`]: the facade tying both to a [`PageStore`].
//!
//! Consumers see one contiguous logical stream: bytes are readable as soon as they are
//! appended, whether they still sit in memory or have already been flushed.

pub mod buffering;
pub mod config;
pub mod error;
pub mod paged_buffer;
pub mod read_cache;
pub mod session_store;
pub mod write_buffer;

#[cfg(test)]
mod testing;

pub use buffering::{BufferingHandle, BufferingOutcome, BufferingRegistry, ObserverId};
pub use config::BufferConfig;
pub use error::{SampleBufferError, SampleBufferResult};
pub use paged_buffer::{BufferStats, PagedSampleBuffer, SessionState};
pub use read_cache::{CacheCounters, ReadCache};
pub use session_store::{FileSessionStore, PageStore, SESSION_FILE_NAME};
pub use write_buffer::{WriteBuffer, WritePage};
