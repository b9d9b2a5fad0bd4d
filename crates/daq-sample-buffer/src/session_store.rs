//! Session store: the on-disk footprint of one recording.
//!
//! Each session owns a directory holding a single flat file, `session.raw`. The file
//! is the plain concatenation of every flushed write page; byte `i` of the file is
//! logical offset `i` of the sample stream. There is no header and no framing.
//!
//! The store is reached through the [`PageStore`] trait so the buffer can be driven
//! against other backends (tests wrap the file store to count and order operations).
//!
//! # Thread Safety
//!
//! - **Appends**: serialized through an async mutex around the append-mode handle.
//! - **Reads**: each fetch opens its own read handle, so concurrent fetches never
//!   contend with each other or with the writer's file position.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{IoResultExt, SampleBufferError, SampleBufferResult};

/// Name of the backing file inside a session directory.
pub const SESSION_FILE_NAME: &str = "session.raw";

/// Backend holding the flushed bytes of a session.
///
/// Implementations must keep the stream append-only: `append_page` is always called
/// with `offset` equal to the number of bytes previously appended, and pages are
/// never rewritten.
#[async_trait]
pub trait PageStore: Send + Sync + std::fmt::Debug {
    /// Append one write page that starts at logical `offset`.
    async fn append_page(&self, offset: u64, page: Bytes) -> SampleBufferResult<()>;

    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// Callers only request ranges that were previously appended.
    async fn read_at(&self, offset: u64, len: usize) -> SampleBufferResult<Bytes>;

    /// Delete the session footprint. Returns `true` if anything was removed.
    async fn release(&self) -> SampleBufferResult<bool>;

    /// Number of bytes appended so far.
    fn len(&self) -> u64;

    /// Whether nothing has been appended yet.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// File-backed session store.
#[derive(Debug)]
pub struct FileSessionStore {
    /// Session directory (deleted on release)
    dir: PathBuf,

    /// Path of `session.raw`
    path: PathBuf,

    /// Append-mode handle; `None` once released
    writer: Mutex<Option<File>>,

    /// Bytes durably handed to the filesystem
    written: AtomicU64,
}

impl FileSessionStore {
    /// Create a new session directory and its backing file.
    ///
    /// Parent directories are created as needed, but `dir` itself must not exist yet.
    pub async fn create(dir: impl AsRef<Path>) -> SampleBufferResult<Self> {
        let dir = dir.as_ref().to_path_buf();

        if let Some(parent) = dir.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .io_context(|| format!("Failed to create session root {}", parent.display()))?;
        }

        // create_dir (not create_dir_all) so an existing session is a hard error
        match fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(SampleBufferError::SessionExists { path: dir });
            }
            Err(e) => {
                return Err(SampleBufferError::io(
                    format!("Failed to create session directory {}", dir.display()),
                    e,
                ));
            }
        }

        let path = dir.join(SESSION_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&path)
            .await
            .io_context(|| format!("Failed to create session file {}", path.display()))?;

        info!(session = %dir.display(), "Created recording session");

        Ok(Self {
            dir,
            path,
            writer: Mutex::new(Some(file)),
            written: AtomicU64::new(0),
        })
    }

    /// Pick a fresh, not-yet-existing session directory under `root`.
    ///
    /// Names look like `session-20240131T120455Z-1a2b3c4d`.
    #[must_use]
    pub fn allocate_dir(root: impl AsRef<Path>) -> PathBuf {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let id = uuid::Uuid::new_v4().simple().to_string();
        root.as_ref().join(format!("session-{}-{}", stamp, &id[..8]))
    }

    /// Session directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PageStore for FileSessionStore {
    async fn append_page(&self, offset: u64, page: Bytes) -> SampleBufferResult<()> {
        let mut guard = self.writer.lock().await;
        let file = guard.as_mut().ok_or(SampleBufferError::Released)?;

        let expected = self.written.load(Ordering::Acquire);
        if offset != expected {
            return Err(SampleBufferError::OutOfOrderFlush {
                expected,
                actual: offset,
            });
        }

        let result = async {
            file.write_all(&page).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            // Roll back a torn append so a later flush of the same page cannot
            // leave duplicate bytes behind.
            if let Err(truncate_err) = file.set_len(expected).await {
                warn!(
                    offset,
                    error = %truncate_err,
                    "Failed to roll back partial page write"
                );
            }
            return Err(SampleBufferError::io(
                format!("Failed to flush {} byte page at offset {}", page.len(), offset),
                e,
            ));
        }

        self.written
            .store(expected + page.len() as u64, Ordering::Release);
        debug!(offset, len = page.len(), "Flushed write page");
        Ok(())
    }

    async fn read_at(&self, offset: u64, len: usize) -> SampleBufferResult<Bytes> {
        let mut file = File::open(&self.path)
            .await
            .io_context(|| format!("Failed to open {} for reading", self.path.display()))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .io_context(|| format!("Failed to seek to offset {}", offset))?;

        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .await
            .io_context(|| format!("Failed to read {} bytes at offset {}", len, offset))?;

        debug!(offset, len, "Fetched page from disk");
        Ok(Bytes::from(buf))
    }

    async fn release(&self) -> SampleBufferResult<bool> {
        // Drop the write handle first so the directory can be removed everywhere
        self.writer.lock().await.take();

        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                info!(session = %self.dir.display(), "Released recording session");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SampleBufferError::io(
                format!("Failed to remove session directory {}", self.dir.display()),
                e,
            )),
        }
    }

    fn len(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }
}
