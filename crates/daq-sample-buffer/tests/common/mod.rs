//! Shared helpers for the sample buffer integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use daq_sample_buffer::{
    BufferConfig, FileSessionStore, PageStore, PagedSampleBuffer, SampleBufferResult,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// A real `session.raw` store that records every disk operation.
#[derive(Debug)]
pub struct CountingStore {
    inner: FileSessionStore,
    pub appends: Mutex<Vec<(u64, usize)>>,
    pub reads: Mutex<Vec<(u64, usize)>>,
}

impl CountingStore {
    pub async fn create(dir: &Path) -> Arc<Self> {
        let inner = FileSessionStore::create(dir).await.unwrap();
        Arc::new(Self {
            inner,
            appends: Mutex::new(Vec::new()),
            reads: Mutex::new(Vec::new()),
        })
    }

    pub fn append_count(&self) -> usize {
        self.appends.lock().len()
    }

    pub fn read_count(&self) -> usize {
        self.reads.lock().len()
    }

    pub fn read_offsets(&self) -> Vec<u64> {
        self.reads.lock().iter().map(|(offset, _)| *offset).collect()
    }
}

#[async_trait]
impl PageStore for CountingStore {
    async fn append_page(&self, offset: u64, page: Bytes) -> SampleBufferResult<()> {
        let len = page.len();
        self.inner.append_page(offset, page).await?;
        self.appends.lock().push((offset, len));
        Ok(())
    }

    async fn read_at(&self, offset: u64, len: usize) -> SampleBufferResult<Bytes> {
        self.reads.lock().push((offset, len));
        self.inner.read_at(offset, len).await
    }

    async fn release(&self) -> SampleBufferResult<bool> {
        self.inner.release().await
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }
}

/// Buffer over a counting file store in `dir`.
pub async fn counting_buffer(
    config: BufferConfig,
    dir: &Path,
) -> (Arc<PagedSampleBuffer>, Arc<CountingStore>) {
    let store = CountingStore::create(dir).await;
    let buffer = PagedSampleBuffer::with_store(config, dir, store.clone()).unwrap();
    (Arc::new(buffer), store)
}

/// Deterministic, non-repeating-per-page test pattern.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
