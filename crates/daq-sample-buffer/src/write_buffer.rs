//! Write-side buffering: the active tail page, pages waiting for their flush, and a
//! FIFO ring of recently flushed pages kept for live reads.
//!
//! The write buffer does no I/O itself. `append` seals full pages into a pending
//! queue; the owner writes them to the store in order and reports each completion
//! through [`WriteBuffer::complete_flush`], which moves the page into the ring.
//!
//! ```text
//!   durable_length                                     committed_length
//!        |                                                    |
//!  ring  v   pending (sealed, flush in flight)     tail       v
//! [p0][p1][p2][p3][p4] ...                    [ active page ]
//!  ^ oldest retained
//! ```
//!
//! Every byte in `[durable_length, committed_length)` is always held by the pending
//! queue or the tail, so the unflushed suffix of the stream can always be served from
//! memory. Ring pages are already on disk, so evicting them never loses data.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// A sealed, immutable write page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePage {
    offset: u64,
    data: Bytes,
}

impl WritePage {
    /// Logical offset of the first byte in this page.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// One past the last logical offset in this page.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    /// Page contents (cheap clone).
    #[must_use]
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Page length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the page holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Tail page, pending flushes, and the retained ring.
#[derive(Debug)]
pub struct WriteBuffer {
    page_size: usize,
    ring_depth: usize,

    /// Active page; always shorter than `page_size` between calls
    tail: BytesMut,
    tail_offset: u64,

    /// Sealed pages not yet confirmed on disk, in offset order
    pending: VecDeque<WritePage>,

    /// Flushed pages retained for reads, oldest first
    ring: VecDeque<WritePage>,

    committed: u64,
    durable: u64,
}

impl WriteBuffer {
    /// Create an empty write buffer.
    pub fn new(page_size: usize, ring_depth: usize) -> Self {
        debug_assert!(page_size > 0, "write page size must be non-zero");
        Self {
            page_size,
            ring_depth,
            tail: BytesMut::with_capacity(page_size),
            tail_offset: 0,
            pending: VecDeque::new(),
            ring: VecDeque::with_capacity(ring_depth + 1),
            committed: 0,
            durable: 0,
        }
    }

    /// Append bytes to the tail, sealing every page that reaches `page_size`.
    ///
    /// Returns how many pages were sealed. The committed length grows immediately,
    /// before any of the sealed pages reach disk.
    pub fn append(&mut self, mut bytes: &[u8]) -> usize {
        self.committed += bytes.len() as u64;

        let mut sealed = 0;
        while !bytes.is_empty() {
            let room = self.page_size - self.tail.len();
            let take = room.min(bytes.len());
            self.tail.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];

            if self.tail.len() == self.page_size {
                self.seal_tail();
                sealed += 1;
            }
        }
        sealed
    }

    /// Seal the tail even if it is partial. Returns `false` when the tail was empty.
    pub fn seal_partial(&mut self) -> bool {
        if self.tail.is_empty() {
            return false;
        }
        self.seal_tail();
        true
    }

    fn seal_tail(&mut self) {
        let data = self.tail.split().freeze();
        let page = WritePage {
            offset: self.tail_offset,
            data,
        };
        self.tail_offset = page.end();
        self.tail.reserve(self.page_size);
        self.pending.push_back(page);
    }

    /// Oldest page still waiting to be flushed.
    #[must_use]
    pub fn next_pending(&self) -> Option<WritePage> {
        self.pending.front().cloned()
    }

    /// Record that the page starting at `offset` is on disk.
    ///
    /// Moves it from the pending queue into the ring and evicts ring pages beyond the
    /// configured depth (oldest first). Returns `false` if `offset` is not the head of
    /// the pending queue, which would mean flushes completed out of order.
    pub fn complete_flush(&mut self, offset: u64) -> bool {
        if self.pending.front().map(WritePage::offset) != Some(offset) {
            return false;
        }
        let Some(page) = self.pending.pop_front() else {
            return false;
        };

        self.durable = page.end();
        self.ring.push_back(page);
        while self.ring.len() > self.ring_depth {
            self.ring.pop_front();
        }
        true
    }

    /// Serve `[position, position + length)` from memory.
    ///
    /// Returns `None` unless the whole range is covered by the ring, the pending
    /// queue and the tail. There are no partial results.
    #[must_use]
    pub fn read_from_buffer(&self, position: u64, length: usize) -> Option<Bytes> {
        let end = position.checked_add(length as u64)?;
        if length == 0 || end > self.committed || position < self.earliest_retained() {
            return None;
        }
        Some(self.collect(position, end))
    }

    /// Bytes of `[position, end)` that have not reached disk yet.
    ///
    /// `position` is raised to the durable length, so the result covers exactly the
    /// part of the range that only exists in memory. Empty when the whole range is
    /// already durable.
    #[must_use]
    pub fn unflushed_range(&self, position: u64, end: u64) -> Bytes {
        let start = position.max(self.durable);
        let end = end.min(self.committed);
        if start >= end {
            return Bytes::new();
        }
        self.collect(start, end)
    }

    /// Lowest offset still resident in memory.
    fn earliest_retained(&self) -> u64 {
        self.ring
            .front()
            .or_else(|| self.pending.front())
            .map_or(self.tail_offset, WritePage::offset)
    }

    /// Gather `[start, end)` from retained pages and the tail, in offset order.
    ///
    /// The caller guarantees the range is resident.
    fn collect(&self, start: u64, end: u64) -> Bytes {
        let mut pieces: Vec<Bytes> = Vec::new();

        for page in self.ring.iter().chain(self.pending.iter()) {
            if let Some(piece) = slice_overlap(page.offset, &page.data, start, end) {
                pieces.push(piece);
            }
        }
        if end > self.tail_offset {
            let from = (start.max(self.tail_offset) - self.tail_offset) as usize;
            let to = (end - self.tail_offset) as usize;
            pieces.push(Bytes::copy_from_slice(&self.tail[from..to]));
        }

        // Zero-copy when a single page covers the whole range
        if pieces.len() == 1 {
            return pieces.swap_remove(0);
        }
        let mut out = BytesMut::with_capacity((end - start) as usize);
        for piece in pieces {
            out.extend_from_slice(&piece);
        }
        out.freeze()
    }

    /// Total bytes accepted by `append`.
    #[must_use]
    pub fn committed_length(&self) -> u64 {
        self.committed
    }

    /// Bytes confirmed on disk.
    #[must_use]
    pub fn durable_length(&self) -> u64 {
        self.durable
    }

    /// Bytes in the active tail page.
    #[must_use]
    pub fn tail_len(&self) -> usize {
        self.tail.len()
    }

    /// Number of sealed pages waiting for their flush.
    #[must_use]
    pub fn pending_pages(&self) -> usize {
        self.pending.len()
    }

    /// Number of flushed pages retained in the ring.
    #[must_use]
    pub fn retained_pages(&self) -> usize {
        self.ring.len()
    }
}

/// Slice of `data` (located at `offset`) that falls inside `[start, end)`.
fn slice_overlap(offset: u64, data: &Bytes, start: u64, end: u64) -> Option<Bytes> {
    let page_end = offset + data.len() as u64;
    let lo = start.max(offset);
    let hi = end.min(page_end);
    if lo >= hi {
        return None;
    }
    Some(data.slice((lo - offset) as usize..(hi - offset) as usize))
}
