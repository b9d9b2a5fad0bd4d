//! The paged sample buffer: one recording session's append/read surface.
//!
//! [`PagedSampleBuffer`] composes the [`WriteBuffer`], the [`ReadCache`] and a
//! [`PageStore`] into the contract used by the rest of the application:
//!
//! - the acquisition side calls [`append`](PagedSampleBuffer::append) and
//!   [`flush`](PagedSampleBuffer::flush),
//! - chart, minimap and export code call [`read`](PagedSampleBuffer::read) with
//!   arbitrary byte ranges,
//! - the session owner calls [`release`](PagedSampleBuffer::release) when done.
//!
//! # Architecture
//!
//! ```text
//! producer ── append ──> WriteBuffer ── flush (in order) ──> session.raw
//!                            │                                    │
//! consumer ── read ──> [tail / pending / ring] ──miss──> ReadCache ┘
//!                                                          └─ prefetch ─> BufferingHandle
//! ```
//!
//! A read is clamped to the committed length. If the write buffer holds the whole
//! range it is served with no disk access. Otherwise the durable prefix of the range
//! goes through the read cache and any not-yet-durable suffix is copied from the
//! write buffer, so readers see appended bytes before they reach disk.
//!
//! # Thread Safety
//!
//! - **Producer**: `append`/`flush` are serialized by an async lock; the design
//!   assumes one producer, a second one simply queues behind the first.
//! - **Readers**: any number, concurrent with each other and with the producer. The
//!   in-memory state is behind a short, never-held-across-await mutex.
//! - **Prefetch**: runs on spawned tasks; observable only through
//!   [`on_buffering`](PagedSampleBuffer::on_buffering).

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace};

use crate::buffering::{BufferingHandle, ObserverId};
use crate::config::BufferConfig;
use crate::error::{IoResultExt, SampleBufferError, SampleBufferResult};
use crate::read_cache::ReadCache;
use crate::session_store::{FileSessionStore, PageStore};
use crate::write_buffer::WriteBuffer;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Constructed; nothing appended or flushed yet
    Created,
    /// At least one append or flush happened
    Recording,
    /// Terminal; every further call is rejected
    Released,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Created => "created",
            SessionState::Recording => "recording",
            SessionState::Released => "released",
        };
        write!(f, "{}", label)
    }
}

/// Point-in-time statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStats {
    /// Lifecycle state
    pub state: SessionState,
    /// Bytes accepted by `append`
    pub committed_length: u64,
    /// Bytes confirmed on disk
    pub durable_length: u64,
    /// Write pages flushed to the store
    pub pages_flushed: u64,
    /// Bytes flushed to the store
    pub bytes_flushed: u64,
    /// Reads served entirely by the write buffer
    pub buffer_hits: u64,
    /// Read pages fetched from disk (foreground and prefetch)
    pub disk_fetches: u64,
    /// Bytes fetched from disk
    pub bytes_fetched: u64,
    /// Read-page lookups served by the read cache
    pub cache_hits: u64,
    /// Read-page lookups that needed a foreground fetch
    pub cache_misses: u64,
    /// Background prefetches started
    pub prefetches: u64,
    /// Pages resident in the read cache
    pub cached_pages: usize,
    /// Flushed write pages retained in memory
    pub retained_write_pages: usize,
}

#[derive(Debug, Default)]
struct WriteCounters {
    pages_flushed: AtomicU64,
    bytes_flushed: AtomicU64,
    buffer_hits: AtomicU64,
}

/// Paged, disk-backed buffer for one recording session.
pub struct PagedSampleBuffer {
    config: BufferConfig,
    session_dir: PathBuf,
    store: Arc<dyn PageStore>,
    writer: Mutex<WriteBuffer>,
    cache: ReadCache,
    state: Mutex<SessionState>,
    /// Serializes producers and keeps flushes in offset order
    flush_lock: tokio::sync::Mutex<()>,
    counters: WriteCounters,
}

impl fmt::Debug for PagedSampleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let writer = self.writer.lock();
        f.debug_struct("PagedSampleBuffer")
            .field("session_dir", &self.session_dir)
            .field("state", &*self.state.lock())
            .field("committed_length", &writer.committed_length())
            .field("durable_length", &writer.durable_length())
            .field("cached_pages", &self.cache.cached_pages())
            .finish()
    }
}

impl PagedSampleBuffer {
    /// Create a session in `session_dir` with the given page sizes and default tuning.
    ///
    /// # Example
    /// ```no_run
    /// use daq_sample_buffer::PagedSampleBuffer;
    ///
    /// # async fn example() -> daq_sample_buffer::SampleBufferResult<()> {
    /// let buffer = PagedSampleBuffer::new(64 * 1024, 64 * 1024, "/tmp/session-1").await?;
    /// buffer.append(&[0u8; 1024]).await?;
    /// let bytes = buffer.read(0, 16).await?;
    /// assert_eq!(bytes.len(), 16);
    /// buffer.release().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(
        read_page_size: usize,
        write_page_size: usize,
        session_dir: impl AsRef<Path>,
    ) -> SampleBufferResult<Self> {
        Self::with_config(BufferConfig::new(read_page_size, write_page_size), session_dir).await
    }

    /// Create a session in `session_dir` backed by `session.raw`.
    ///
    /// Fails with [`SampleBufferError::SessionExists`] if the directory is already there.
    pub async fn with_config(
        config: BufferConfig,
        session_dir: impl AsRef<Path>,
    ) -> SampleBufferResult<Self> {
        config.validate()?;
        let store = FileSessionStore::create(session_dir.as_ref()).await?;
        let session_dir = store.dir().to_path_buf();
        Ok(Self::assemble(config, session_dir, Arc::new(store)))
    }

    /// Build a buffer over any [`PageStore`]. `session_dir` is informational only.
    pub fn with_store(
        config: BufferConfig,
        session_dir: impl Into<PathBuf>,
        store: Arc<dyn PageStore>,
    ) -> SampleBufferResult<Self> {
        config.validate()?;
        Ok(Self::assemble(config, session_dir.into(), store))
    }

    fn assemble(config: BufferConfig, session_dir: PathBuf, store: Arc<dyn PageStore>) -> Self {
        let cache = ReadCache::new(
            Arc::clone(&store),
            config.read_page_size,
            config.read_cache_pages,
            config.prefetch,
        );
        let writer = WriteBuffer::new(config.write_page_size, config.write_ring_depth);
        Self {
            config,
            session_dir,
            store,
            writer: Mutex::new(writer),
            cache,
            state: Mutex::new(SessionState::Created),
            flush_lock: tokio::sync::Mutex::new(()),
            counters: WriteCounters::default(),
        }
    }

    /// Append bytes to the stream.
    ///
    /// The bytes are readable as soon as this is called. Every write page that fills
    /// up is flushed, in order, before this returns; a flush failure is returned here
    /// and the unflushed pages stay queued for the next `append`/`flush`.
    pub async fn append(&self, bytes: &[u8]) -> SampleBufferResult<()> {
        let _producer = self.flush_lock.lock().await;
        self.begin_recording()?;

        let sealed = self.writer.lock().append(bytes);
        if sealed > 0 {
            trace!(len = bytes.len(), sealed, "Sealed write pages");
        }
        self.flush_pending().await
    }

    /// Flush the active write page to disk even if it is partial.
    pub async fn flush(&self) -> SampleBufferResult<()> {
        let _producer = self.flush_lock.lock().await;
        self.begin_recording()?;

        self.writer.lock().seal_partial();
        self.flush_pending().await
    }

    /// Write queued pages in offset order until none are left or one fails.
    async fn flush_pending(&self) -> SampleBufferResult<()> {
        loop {
            let Some(page) = self.writer.lock().next_pending() else {
                return Ok(());
            };
            let offset = page.offset();
            let len = page.len();

            self.store.append_page(offset, page.bytes()).await?;

            self.writer.lock().complete_flush(offset);
            self.counters.pages_flushed.fetch_add(1, Ordering::Relaxed);
            self.counters
                .bytes_flushed
                .fetch_add(len as u64, Ordering::Relaxed);
        }
    }

    /// Read up to `length` bytes starting at `position`.
    ///
    /// The range is clamped to the committed length; a result shorter than `length`
    /// means the end of committed data. Reads at or past the end, and zero-length
    /// reads, return an empty buffer without touching the disk.
    pub async fn read(&self, position: u64, length: usize) -> SampleBufferResult<Bytes> {
        self.ensure_live()?;

        let (end, durable, unflushed) = {
            let writer = self.writer.lock();
            let committed = writer.committed_length();
            if length == 0 || position >= committed {
                return Ok(Bytes::new());
            }
            let end = committed.min(position.saturating_add(length as u64));
            let clamped = (end - position) as usize;

            if let Some(hit) = writer.read_from_buffer(position, clamped) {
                self.counters.buffer_hits.fetch_add(1, Ordering::Relaxed);
                trace!(position, len = clamped, "Served read from write buffer");
                return Ok(hit);
            }

            let durable = writer.durable_length();
            (end, durable, writer.unflushed_range(position, end))
        };

        let disk_end = end.min(durable);
        if position >= disk_end {
            return Ok(unflushed);
        }

        let cached = self
            .cache
            .read(position, (disk_end - position) as usize, durable)
            .await?;
        if unflushed.is_empty() {
            return Ok(cached);
        }

        let mut out = BytesMut::with_capacity((end - position) as usize);
        out.extend_from_slice(&cached);
        out.extend_from_slice(&unflushed);
        Ok(out.freeze())
    }

    /// Stream `[position, position + length)` into `writer`, clamped like [`read`].
    ///
    /// Data is copied one read page at a time through the normal read path, so large
    /// exports never hold more than a page of their own in memory. Returns the number
    /// of bytes written.
    ///
    /// [`read`]: PagedSampleBuffer::read
    pub async fn export_range<W>(
        &self,
        position: u64,
        length: u64,
        writer: &mut W,
    ) -> SampleBufferResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let end = self
            .committed_length()
            .min(position.saturating_add(length));
        let chunk = self.config.read_page_size as u64;

        let mut cursor = position;
        while cursor < end {
            let want = (end - cursor).min(chunk) as usize;
            let bytes = self.read(cursor, want).await?;
            if bytes.is_empty() {
                break;
            }
            writer
                .write_all(&bytes)
                .await
                .io_context(|| format!("Failed to export bytes at offset {}", cursor))?;
            cursor += bytes.len() as u64;
        }
        writer
            .flush()
            .await
            .io_context(|| "Failed to flush export sink")?;

        let written = cursor.saturating_sub(position);
        debug!(position, written, "Exported range");
        Ok(written)
    }

    /// Register an observer called once per background prefetch.
    pub fn on_buffering<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(BufferingHandle) + Send + Sync + 'static,
    {
        self.cache.observers().register(observer)
    }

    /// Remove a buffering observer.
    pub fn remove_buffering_observer(&self, id: ObserverId) -> bool {
        self.cache.observers().unregister(id)
    }

    /// Number of registered buffering observers.
    pub fn buffering_observer_count(&self) -> usize {
        self.cache.observers().count()
    }

    /// Delete the session's on-disk footprint.
    ///
    /// Idempotent. Returns `true` only for the call that actually removed the
    /// session directory. Background prefetches that finish afterwards are dropped.
    pub async fn release(&self) -> SampleBufferResult<bool> {
        let _producer = self.flush_lock.lock().await;
        *self.state.lock() = SessionState::Released;
        self.cache.close();

        let removed = self.store.release().await?;
        if removed {
            info!(session = %self.session_dir.display(), "Sample buffer released");
        }
        Ok(removed)
    }

    /// Bytes accepted by `append` so far.
    pub fn committed_length(&self) -> u64 {
        self.writer.lock().committed_length()
    }

    /// Bytes confirmed on disk.
    pub fn durable_length(&self) -> u64 {
        self.writer.lock().durable_length()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Session directory.
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Configuration in effect.
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Snapshot of buffer statistics.
    pub fn stats(&self) -> BufferStats {
        let (committed_length, durable_length, retained_write_pages) = {
            let writer = self.writer.lock();
            (
                writer.committed_length(),
                writer.durable_length(),
                writer.retained_pages(),
            )
        };
        let cache = self.cache.counters();
        BufferStats {
            state: self.state(),
            committed_length,
            durable_length,
            pages_flushed: self.counters.pages_flushed.load(Ordering::Relaxed),
            bytes_flushed: self.counters.bytes_flushed.load(Ordering::Relaxed),
            buffer_hits: self.counters.buffer_hits.load(Ordering::Relaxed),
            disk_fetches: cache.fetches.load(Ordering::Relaxed),
            bytes_fetched: cache.bytes_fetched.load(Ordering::Relaxed),
            cache_hits: cache.hits.load(Ordering::Relaxed),
            cache_misses: cache.misses.load(Ordering::Relaxed),
            prefetches: cache.prefetches.load(Ordering::Relaxed),
            cached_pages: self.cache.cached_pages(),
            retained_write_pages,
        }
    }

    fn ensure_live(&self) -> SampleBufferResult<()> {
        if *self.state.lock() == SessionState::Released {
            return Err(SampleBufferError::Released);
        }
        Ok(())
    }

    fn begin_recording(&self) -> SampleBufferResult<()> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Released => Err(SampleBufferError::Released),
            SessionState::Created => {
                *state = SessionState::Recording;
                debug!(session = %self.session_dir.display(), "Recording started");
                Ok(())
            }
            SessionState::Recording => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::BufferingOutcome;
    use crate::testing::MemoryStore;
    use tracing_test::traced_test;

    fn memory_buffer(read_page: usize, write_page: usize) -> (PagedSampleBuffer, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = BufferConfig::new(read_page, write_page);
        let buffer = PagedSampleBuffer::with_store(config, "memory", store.clone()).unwrap();
        (buffer, store)
    }

    fn seq(n: u8) -> Vec<u8> {
        (0..n).collect()
    }

    #[tokio::test]
    async fn test_full_page_flushes_once() {
        let (buffer, store) = memory_buffer(10, 10);
        buffer.append(&seq(10)).await.unwrap();
        assert_eq!(store.flushes(), vec![(0, 10)]);
        assert_eq!(store.contents(), seq(10));
    }

    #[tokio::test]
    async fn test_short_append_does_not_flush() {
        let (buffer, store) = memory_buffer(10, 10);
        buffer.append(&seq(9)).await.unwrap();
        assert!(store.flushes().is_empty());
        assert_eq!(buffer.committed_length(), 9);
    }

    #[tokio::test]
    async fn test_overflow_keeps_last_byte_in_memory() {
        let (buffer, store) = memory_buffer(10, 10);
        buffer.append(&seq(11)).await.unwrap();

        assert_eq!(store.flushes(), vec![(0, 10)]);
        assert_eq!(&buffer.read(10, 1).await.unwrap()[..], &[10]);
        assert_eq!(store.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_read_tail_without_disk() {
        let (buffer, store) = memory_buffer(10, 10);
        buffer.append(&seq(5)).await.unwrap();

        assert_eq!(&buffer.read(2, 3).await.unwrap()[..], &[2, 3, 4]);
        assert_eq!(store.fetch_count(), 0);
        assert_eq!(buffer.stats().buffer_hits, 1);
    }

    #[tokio::test]
    async fn test_read_mixes_disk_prefix_and_unflushed_suffix() {
        let store = Arc::new(MemoryStore::new());
        let config = BufferConfig::new(10, 10)
            .with_write_ring_depth(1)
            .with_prefetch(false);
        let buffer = PagedSampleBuffer::with_store(config, "memory", store.clone()).unwrap();

        let data: Vec<u8> = (0..45).collect();
        buffer.append(&data).await.unwrap();
        // Ring holds [30, 40); tail holds [40, 45); [0, 30) is disk-only
        let bytes = buffer.read(25, 20).await.unwrap();
        assert_eq!(&bytes[..], &data[25..45]);
        assert_eq!(store.fetch_offsets(), vec![20, 30]);
    }

    #[tokio::test]
    async fn test_reads_after_release_are_rejected() {
        let (buffer, store) = memory_buffer(10, 10);
        buffer.append(&seq(3)).await.unwrap();

        assert!(buffer.release().await.unwrap());
        assert!(!buffer.release().await.unwrap());
        assert_eq!(store.release_count(), 2);
        assert_eq!(buffer.state(), SessionState::Released);

        assert!(matches!(
            buffer.read(0, 1).await,
            Err(SampleBufferError::Released)
        ));
        assert!(matches!(
            buffer.append(&[1]).await,
            Err(SampleBufferError::Released)
        ));
        assert!(matches!(buffer.flush().await, Err(SampleBufferError::Released)));
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let (buffer, _store) = memory_buffer(10, 10);
        assert_eq!(buffer.state(), SessionState::Created);

        buffer.read(0, 10).await.unwrap();
        assert_eq!(buffer.state(), SessionState::Created);

        buffer.flush().await.unwrap();
        assert_eq!(buffer.state(), SessionState::Recording);
    }

    #[tokio::test]
    async fn test_failed_flush_is_retried_by_next_call() {
        let (buffer, store) = memory_buffer(10, 4);
        store.fail_writes(true);

        let err = buffer.append(&seq(6)).await.unwrap_err();
        assert!(err.is_io());
        // Still readable from memory
        assert_eq!(&buffer.read(0, 6).await.unwrap()[..], &seq(6)[..]);
        assert_eq!(buffer.durable_length(), 0);

        store.fail_writes(false);
        buffer.flush().await.unwrap();
        assert_eq!(store.flushes(), vec![(0, 4), (4, 2)]);
        assert_eq!(store.contents(), seq(6));
    }

    #[tokio::test]
    async fn test_export_range_streams_clamped_bytes() {
        let (buffer, _store) = memory_buffer(8, 8);
        let data: Vec<u8> = (0..50).collect();
        buffer.append(&data).await.unwrap();

        let mut sink: Vec<u8> = Vec::new();
        let written = buffer.export_range(30, 100, &mut sink).await.unwrap();
        assert_eq!(written, 20);
        assert_eq!(sink, &data[30..]);
    }

    #[tokio::test]
    async fn test_observer_receives_prefetch_handles() {
        let store = Arc::new(MemoryStore::new());
        let config = BufferConfig::new(10, 10).with_write_ring_depth(1);
        let buffer = PagedSampleBuffer::with_store(config, "memory", store.clone()).unwrap();

        let handles = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&handles);
        let id = buffer.on_buffering(move |h| sink.lock().push(h));
        assert_eq!(buffer.buffering_observer_count(), 1);

        buffer.append(&[7u8; 100]).await.unwrap();
        buffer.read(50, 5).await.unwrap();

        let pending: Vec<BufferingHandle> = handles.lock().drain(..).collect();
        let mut pages = Vec::new();
        for handle in pending {
            let outcome = handle.wait().await;
            assert!(matches!(outcome, BufferingOutcome::Loaded { bytes: 10, .. }));
            pages.push(outcome.page());
        }
        pages.sort_unstable();
        assert_eq!(pages, vec![4, 6]);
        assert_eq!(buffer.stats().prefetches, 2);

        assert!(buffer.remove_buffering_observer(id));
        assert_eq!(buffer.buffering_observer_count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_release_is_logged() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().join("session");
        let buffer = PagedSampleBuffer::new(16, 16, &dir).await.unwrap();
        buffer.append(&[1u8; 40]).await.unwrap();

        assert!(buffer.release().await.unwrap());
        assert!(!dir.exists());
        assert!(logs_contain("Sample buffer released"));
    }
}
