//! In-memory page store that records every operation.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{SampleBufferError, SampleBufferResult};
use crate::session_store::PageStore;

#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    data: Mutex<Vec<u8>>,
    flushes: Mutex<Vec<(u64, usize)>>,
    fetches: Mutex<Vec<(u64, usize)>>,
    releases: Mutex<usize>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_contents(data: &[u8]) -> Self {
        let store = Self::default();
        *store.data.lock() = data.to_vec();
        store
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// `(offset, len)` of every successful flush, in call order
    pub(crate) fn flushes(&self) -> Vec<(u64, usize)> {
        self.flushes.lock().clone()
    }

    pub(crate) fn fetch_offsets(&self) -> Vec<u64> {
        self.fetches.lock().iter().map(|(offset, _)| *offset).collect()
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.fetches.lock().len()
    }

    pub(crate) fn release_count(&self) -> usize {
        *self.releases.lock()
    }

    pub(crate) fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

fn injected(what: &str) -> SampleBufferError {
    SampleBufferError::io(
        format!("injected {what} failure"),
        std::io::Error::new(std::io::ErrorKind::Other, "injected"),
    )
}

#[async_trait]
impl PageStore for MemoryStore {
    async fn append_page(&self, offset: u64, page: Bytes) -> SampleBufferResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(injected("write"));
        }
        let mut data = self.data.lock();
        if offset != data.len() as u64 {
            return Err(SampleBufferError::OutOfOrderFlush {
                expected: data.len() as u64,
                actual: offset,
            });
        }
        data.extend_from_slice(&page);
        self.flushes.lock().push((offset, page.len()));
        Ok(())
    }

    async fn read_at(&self, offset: u64, len: usize) -> SampleBufferResult<Bytes> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(injected("read"));
        }
        let data = self.data.lock();
        let start = offset as usize;
        let bytes = data
            .get(start..start + len)
            .map(Bytes::copy_from_slice)
            .ok_or_else(|| injected("short read"))?;
        self.fetches.lock().push((offset, len));
        Ok(bytes)
    }

    async fn release(&self) -> SampleBufferResult<bool> {
        let mut releases = self.releases.lock();
        *releases += 1;
        Ok(*releases == 1)
    }

    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }
}
