//! Page-aligned read cache over the session store.
//!
//! Reads are split into aligned pages of `read_page_size` bytes. Cached pages are
//! sliced directly; missing pages are fetched from the store (one fetch per missing
//! page, issued concurrently) and awaited before `read` returns.
//!
//! ## Prefetch
//!
//! When a read had to go to disk, the page just before and the page just after the
//! fetched run are loaded in the background. Each prefetch runs on its own task and is
//! announced to observers as a [`BufferingHandle`]. Prefetches never block the read
//! that triggered them, and their failures are logged rather than returned.
//!
//! ## Eviction
//!
//! Capacity is counted in pages. When it is exceeded, the page furthest from the most
//! recently requested page is dropped. Scrubbing tends to stay near the last position,
//! so this keeps the working window warm while the ring in the write buffer keeps the
//! live end of the stream warm.
//!
//! ## Short pages
//!
//! The last page of the durable stream may be shorter than `read_page_size`. Such a
//! page is cached as-is and transparently refetched once a read needs bytes past its
//! end.

use bytes::{Bytes, BytesMut};
use futures::future::{try_join_all, FutureExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::buffering::{BufferingHandle, BufferingOutcome, BufferingRegistry};
use crate::error::SampleBufferResult;
use crate::session_store::PageStore;

/// Counters maintained by the read cache.
#[derive(Debug, Default)]
pub struct CacheCounters {
    /// Pages fetched from the store (foreground and prefetch)
    pub fetches: AtomicU64,
    /// Bytes fetched from the store
    pub bytes_fetched: AtomicU64,
    /// Page lookups served from the cache
    pub hits: AtomicU64,
    /// Page lookups that required a foreground fetch
    pub misses: AtomicU64,
    /// Background prefetches started
    pub prefetches: AtomicU64,
}

#[derive(Debug, Default)]
struct CacheState {
    pages: BTreeMap<u64, Bytes>,
    /// Page index of the most recent request; eviction distance is measured from here
    focus: u64,
    /// Pages with a prefetch in flight
    in_flight: HashSet<u64>,
}

#[derive(Debug)]
struct CacheInner {
    store: Arc<dyn PageStore>,
    page_size: u64,
    capacity: usize,
    prefetch: bool,
    state: Mutex<CacheState>,
    observers: BufferingRegistry,
    counters: CacheCounters,
    closed: AtomicBool,
}

/// Read cache shared between foreground reads and background prefetch tasks.
#[derive(Debug, Clone)]
pub struct ReadCache {
    inner: Arc<CacheInner>,
}

impl ReadCache {
    /// Create a cache of `capacity` pages of `page_size` bytes over `store`.
    pub fn new(store: Arc<dyn PageStore>, page_size: usize, capacity: usize, prefetch: bool) -> Self {
        debug_assert!(page_size > 0, "read page size must be non-zero");
        Self {
            inner: Arc::new(CacheInner {
                store,
                page_size: page_size as u64,
                capacity: capacity.max(1),
                prefetch,
                state: Mutex::new(CacheState::default()),
                observers: BufferingRegistry::new(),
                counters: CacheCounters::default(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Read `[position, position + length)`, all of which lies below `extent`.
    ///
    /// `extent` is the durable length of the stream at the time of the call: every
    /// byte below it is on disk, so fetches never run past it.
    pub async fn read(&self, position: u64, length: usize, extent: u64) -> SampleBufferResult<Bytes> {
        let end = position.saturating_add(length as u64).min(extent);
        if length == 0 || position >= end {
            return Ok(Bytes::new());
        }

        let first = position / self.inner.page_size;
        let last = (end - 1) / self.inner.page_size;

        // Resolve cached pages, collect the rest
        let mut pages: Vec<(u64, Option<Bytes>)> = Vec::with_capacity((last - first + 1) as usize);
        {
            let mut state = self.inner.state.lock();
            state.focus = first;
            for index in first..=last {
                let needed = self.inner.bytes_needed(index, end);
                let cached = state
                    .pages
                    .get(&index)
                    .filter(|page| page.len() >= needed)
                    .cloned();
                pages.push((index, cached));
            }
        }

        let missing: Vec<u64> = pages
            .iter()
            .filter(|(_, cached)| cached.is_none())
            .map(|(index, _)| *index)
            .collect();
        let counters = &self.inner.counters;
        counters
            .hits
            .fetch_add((pages.len() - missing.len()) as u64, Ordering::Relaxed);
        counters
            .misses
            .fetch_add(missing.len() as u64, Ordering::Relaxed);

        if !missing.is_empty() {
            let fetched = try_join_all(
                missing
                    .iter()
                    .map(|&index| self.inner.fetch_page(index, extent)),
            )
            .await?;

            {
                let mut state = self.inner.state.lock();
                for (&index, bytes) in missing.iter().zip(&fetched) {
                    state.pages.insert(index, bytes.clone());
                }
                self.inner.evict(&mut state);
            }

            let mut fetched = fetched.into_iter();
            for (_, slot) in pages.iter_mut().filter(|(_, cached)| cached.is_none()) {
                *slot = fetched.next();
            }

            if self.inner.prefetch {
                let before = missing[0].checked_sub(1);
                let after = missing[missing.len() - 1] + 1;
                for index in before.into_iter().chain(std::iter::once(after)) {
                    self.schedule_prefetch(index, extent);
                }
            }
        } else {
            trace!(position, length, "Read cache hit");
        }

        let mut out = BytesMut::with_capacity((end - position) as usize);
        for (index, page) in pages {
            let Some(page) = page else { continue };
            let page_start = index * self.inner.page_size;
            let from = (position.max(page_start) - page_start) as usize;
            let to = ((end.min(page_start + self.inner.page_size)) - page_start) as usize;
            out.extend_from_slice(&page[from..to.min(page.len())]);
        }
        Ok(out.freeze())
    }

    /// Start a background fetch of `index` unless it is cached, in flight, or beyond
    /// `extent`. Returns the handle that observers were given.
    pub fn schedule_prefetch(&self, index: u64, extent: u64) -> Option<BufferingHandle> {
        let start = index.checked_mul(self.inner.page_size)?;
        if start >= extent || self.inner.closed.load(Ordering::Acquire) {
            return None;
        }

        {
            let mut state = self.inner.state.lock();
            let full_len = self.inner.page_len(index, extent);
            let cached = state
                .pages
                .get(&index)
                .is_some_and(|page| page.len() >= full_len);
            if cached || !state.in_flight.insert(index) {
                return None;
            }
        }
        self.inner.counters.prefetches.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.prefetch_page(index, extent).await });
        let completion = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => BufferingOutcome::Failed {
                    page: index,
                    reason: e.to_string(),
                },
            }
        }
        .boxed();

        let handle = BufferingHandle::new(index, completion);
        debug!(page = index, "Prefetch scheduled");
        self.inner.observers.notify_all(&handle);
        Some(handle)
    }

    /// Observers notified of every prefetch.
    pub fn observers(&self) -> &BufferingRegistry {
        &self.inner.observers
    }

    /// Cache counters.
    pub fn counters(&self) -> &CacheCounters {
        &self.inner.counters
    }

    /// Number of cached pages.
    pub fn cached_pages(&self) -> usize {
        self.inner.state.lock().pages.len()
    }

    /// Whether page `index` is currently cached.
    pub fn contains(&self, index: u64) -> bool {
        self.inner.state.lock().pages.contains_key(&index)
    }

    /// Drop every cached page and refuse to cache late prefetch results.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.state.lock().pages.clear();
    }
}

impl CacheInner {
    /// Length of page `index` given the durable extent.
    fn page_len(&self, index: u64, extent: u64) -> usize {
        let start = index * self.page_size;
        (extent.saturating_sub(start)).min(self.page_size) as usize
    }

    /// Bytes of page `index` a read ending at `end` needs to be present.
    fn bytes_needed(&self, index: u64, end: u64) -> usize {
        let start = index * self.page_size;
        (end.min(start + self.page_size) - start) as usize
    }

    async fn fetch_page(&self, index: u64, extent: u64) -> SampleBufferResult<Bytes> {
        let offset = index * self.page_size;
        let len = self.page_len(index, extent);
        let bytes = self.store.read_at(offset, len).await?;

        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_fetched
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        debug!(page = index, offset, len, "Read page fetched");
        Ok(bytes)
    }

    async fn prefetch_page(&self, index: u64, extent: u64) -> BufferingOutcome {
        let result = self.fetch_page(index, extent).await;

        let mut state = self.state.lock();
        state.in_flight.remove(&index);

        match result {
            Ok(_) if self.closed.load(Ordering::Acquire) => {
                BufferingOutcome::Discarded { page: index }
            }
            Ok(bytes) => {
                let len = bytes.len();
                // Keep whichever copy is longer; a foreground read may have refreshed it
                let keep_existing = state.pages.get(&index).is_some_and(|p| p.len() >= len);
                if !keep_existing {
                    state.pages.insert(index, bytes);
                }
                self.evict(&mut state);
                BufferingOutcome::Loaded { page: index, bytes: len }
            }
            Err(_) if self.closed.load(Ordering::Acquire) => {
                BufferingOutcome::Discarded { page: index }
            }
            Err(e) => {
                warn!(page = index, error = %e, "Prefetch failed");
                BufferingOutcome::Failed {
                    page: index,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Drop pages furthest from the focus until within capacity.
    fn evict(&self, state: &mut CacheState) {
        while state.pages.len() > self.capacity {
            let focus = state.focus;
            let victim = state
                .pages
                .keys()
                .copied()
                .max_by_key(|&index| index.abs_diff(focus));
            let Some(victim) = victim else { break };
            state.pages.remove(&victim);
            trace!(page = victim, focus, "Evicted read page");
        }
    }
}
