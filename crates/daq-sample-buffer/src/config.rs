//! Page sizing and cache tuning for a [`PagedSampleBuffer`](crate::PagedSampleBuffer).

use serde::{Deserialize, Serialize};

use crate::error::{SampleBufferError, SampleBufferResult};

/// Default size of a read (cache) page in bytes.
pub const DEFAULT_READ_PAGE_SIZE: usize = 64 * 1024;

/// Default size of a write page in bytes.
pub const DEFAULT_WRITE_PAGE_SIZE: usize = 64 * 1024;

/// Default number of flushed write pages retained in memory.
pub const DEFAULT_WRITE_RING_DEPTH: usize = 3;

/// Default number of read pages held by the read cache.
pub const DEFAULT_READ_CACHE_PAGES: usize = 16;

/// Buffer configuration.
///
/// All fields have serde defaults so a partial `[buffer]` table in a config file
/// is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Size of a page fetched from disk and held in the read cache
    #[serde(default = "default_read_page_size")]
    pub read_page_size: usize,
    /// Size at which the active write page is flushed to disk
    #[serde(default = "default_write_page_size")]
    pub write_page_size: usize,
    /// How many flushed write pages stay resident for live reads
    #[serde(default = "default_write_ring_depth")]
    pub write_ring_depth: usize,
    /// Read cache capacity, in pages
    #[serde(default = "default_read_cache_pages")]
    pub read_cache_pages: usize,
    /// Fetch neighbouring pages in the background after a disk miss
    #[serde(default = "default_prefetch")]
    pub prefetch: bool,
}

fn default_read_page_size() -> usize {
    DEFAULT_READ_PAGE_SIZE
}

fn default_write_page_size() -> usize {
    DEFAULT_WRITE_PAGE_SIZE
}

fn default_write_ring_depth() -> usize {
    DEFAULT_WRITE_RING_DEPTH
}

fn default_read_cache_pages() -> usize {
    DEFAULT_READ_CACHE_PAGES
}

fn default_prefetch() -> bool {
    true
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            read_page_size: DEFAULT_READ_PAGE_SIZE,
            write_page_size: DEFAULT_WRITE_PAGE_SIZE,
            write_ring_depth: DEFAULT_WRITE_RING_DEPTH,
            read_cache_pages: DEFAULT_READ_CACHE_PAGES,
            prefetch: true,
        }
    }
}

impl BufferConfig {
    /// Create a configuration with explicit page sizes and default tuning.
    #[must_use]
    pub fn new(read_page_size: usize, write_page_size: usize) -> Self {
        Self {
            read_page_size,
            write_page_size,
            ..Default::default()
        }
    }

    /// Set the number of retained write pages.
    #[must_use]
    pub fn with_write_ring_depth(mut self, depth: usize) -> Self {
        self.write_ring_depth = depth;
        self
    }

    /// Set the read cache capacity in pages.
    #[must_use]
    pub fn with_read_cache_pages(mut self, pages: usize) -> Self {
        self.read_cache_pages = pages;
        self
    }

    /// Enable or disable adjacency prefetch.
    #[must_use]
    pub fn with_prefetch(mut self, enabled: bool) -> Self {
        self.prefetch = enabled;
        self
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> SampleBufferResult<()> {
        if self.read_page_size == 0 {
            return Err(SampleBufferError::InvalidConfig(
                "read_page_size must be greater than 0".to_string(),
            ));
        }
        if self.write_page_size == 0 {
            return Err(SampleBufferError::InvalidConfig(
                "write_page_size must be greater than 0".to_string(),
            ));
        }
        if self.write_ring_depth == 0 {
            return Err(SampleBufferError::InvalidConfig(
                "write_ring_depth must be at least 1".to_string(),
            ));
        }
        if self.read_cache_pages == 0 {
            return Err(SampleBufferError::InvalidConfig(
                "read_cache_pages must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
