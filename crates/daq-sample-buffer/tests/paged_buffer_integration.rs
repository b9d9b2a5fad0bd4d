//! End-to-end tests of the paged sample buffer against real session files.

mod common;

use common::{counting_buffer, pattern};
use daq_sample_buffer::{
    BufferConfig, BufferingHandle, BufferingOutcome, PagedSampleBuffer, SampleBufferError,
    SessionState, SESSION_FILE_NAME,
};
use parking_lot::Mutex;
use std::sync::Arc;

fn session_bytes(dir: &std::path::Path) -> Vec<u8> {
    std::fs::read(dir.join(SESSION_FILE_NAME)).unwrap()
}

fn handle_sink(buffer: &PagedSampleBuffer) -> Arc<Mutex<Vec<BufferingHandle>>> {
    let handles = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&handles);
    buffer.on_buffering(move |h| sink.lock().push(h));
    handles
}

async fn settle(handles: &Arc<Mutex<Vec<BufferingHandle>>>) -> Vec<BufferingOutcome> {
    let pending: Vec<BufferingHandle> = handles.lock().drain(..).collect();
    let mut outcomes = Vec::with_capacity(pending.len());
    for handle in pending {
        outcomes.push(handle.wait().await);
    }
    outcomes
}

#[tokio::test]
async fn test_ten_byte_page_scenario() {
    let temp_dir = tempfile::tempdir().unwrap();

    // Exactly one page: one flush
    let dir = temp_dir.path().join("full");
    let (buffer, store) = counting_buffer(BufferConfig::new(10, 10), &dir).await;
    buffer.append(&pattern(10)).await.unwrap();
    assert_eq!(store.append_count(), 1);
    assert_eq!(session_bytes(&dir), pattern(10));

    // One byte short: nothing flushed
    let dir = temp_dir.path().join("short");
    let (buffer, store) = counting_buffer(BufferConfig::new(10, 10), &dir).await;
    buffer.append(&pattern(9)).await.unwrap();
    assert_eq!(store.append_count(), 0);
    assert!(session_bytes(&dir).is_empty());

    // One byte over: one flush, the extra byte stays in memory
    let dir = temp_dir.path().join("over");
    let (buffer, store) = counting_buffer(BufferConfig::new(10, 10), &dir).await;
    buffer.append(&pattern(11)).await.unwrap();
    assert_eq!(store.append_count(), 1);
    assert_eq!(session_bytes(&dir).len(), 10);
    assert_eq!(&buffer.read(10, 1).await.unwrap()[..], &[10]);

    // Tail-only read: no disk access
    let dir = temp_dir.path().join("tail");
    let (buffer, store) = counting_buffer(BufferConfig::new(10, 10), &dir).await;
    buffer.append(&pattern(5)).await.unwrap();
    assert_eq!(&buffer.read(2, 3).await.unwrap()[..], &[2, 3, 4]);
    assert_eq!(store.read_count(), 0);
}

#[tokio::test]
async fn test_flushes_are_ordered_and_contiguous() {
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path().join("session");
    let (buffer, store) = counting_buffer(BufferConfig::new(16, 16), &dir).await;

    let data = pattern(1000);
    for chunk in data.chunks(37) {
        buffer.append(chunk).await.unwrap();
    }

    let appends = store.appends.lock().clone();
    let mut expected_offset = 0;
    for (offset, len) in &appends {
        assert_eq!(*offset, expected_offset);
        assert_eq!(*len, 16);
        expected_offset += *len as u64;
    }
    assert_eq!(appends.len(), 1000 / 16);
    assert_eq!(buffer.durable_length(), (1000 / 16 * 16) as u64);
    assert_eq!(buffer.committed_length(), 1000);
    assert_eq!(session_bytes(&dir), &data[..buffer.durable_length() as usize]);
}

#[tokio::test]
async fn test_explicit_flush_writes_partial_page_and_continues() {
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path().join("session");
    let (buffer, store) = counting_buffer(BufferConfig::new(10, 10), &dir).await;

    let data = pattern(27);
    buffer.append(&data[..5]).await.unwrap();
    buffer.flush().await.unwrap();
    assert_eq!(session_bytes(&dir), &data[..5]);

    // Flushing an empty tail is a no-op
    buffer.flush().await.unwrap();
    assert_eq!(store.append_count(), 1);

    buffer.append(&data[5..]).await.unwrap();
    buffer.flush().await.unwrap();
    assert_eq!(session_bytes(&dir), data);
    assert_eq!(
        store.appends.lock().clone(),
        vec![(0, 5), (5, 10), (15, 10), (25, 2)]
    );

    let read_back = buffer.read(0, 27).await.unwrap();
    assert_eq!(&read_back[..], &data[..]);
}

#[tokio::test]
async fn test_reads_are_clamped_to_committed_length() {
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path().join("session");
    let (buffer, store) = counting_buffer(BufferConfig::new(8, 8), &dir).await;

    let data = pattern(20);
    buffer.append(&data).await.unwrap();

    assert_eq!(&buffer.read(15, 100).await.unwrap()[..], &data[15..]);
    assert!(buffer.read(20, 4).await.unwrap().is_empty());
    assert!(buffer.read(1_000_000, 4).await.unwrap().is_empty());
    assert!(buffer.read(3, 0).await.unwrap().is_empty());
    assert!(buffer.read(u64::MAX, usize::MAX).await.unwrap().is_empty());
    assert_eq!(store.read_count(), 0);
}

#[tokio::test]
async fn test_ring_and_cache_hits_avoid_disk() {
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path().join("session");
    let config = BufferConfig::new(16, 16).with_prefetch(false);
    let (buffer, store) = counting_buffer(config, &dir).await;

    let data = pattern(16 * 10);
    buffer.append(&data).await.unwrap();

    // Last three write pages are still retained in memory
    let recent = buffer.read(16 * 7, 48).await.unwrap();
    assert_eq!(&recent[..], &data[16 * 7..]);
    assert_eq!(store.read_count(), 0);

    // Older data goes to disk once, then comes from the read cache
    let old = buffer.read(20, 30).await.unwrap();
    assert_eq!(&old[..], &data[20..50]);
    assert_eq!(store.read_offsets(), vec![16, 32, 48]);

    let again = buffer.read(24, 20).await.unwrap();
    assert_eq!(&again[..], &data[24..44]);
    assert_eq!(store.read_count(), 3);

    let stats = buffer.stats();
    assert_eq!(stats.disk_fetches, 3);
    assert_eq!(stats.bytes_fetched, 48);
    assert_eq!(stats.buffer_hits, 1);
    assert_eq!(stats.cache_misses, 3);
    assert_eq!(stats.cache_hits, 2);
}

#[tokio::test]
async fn test_disk_fetch_prefetches_adjacent_pages() {
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path().join("session");
    let config = BufferConfig::new(32, 32).with_write_ring_depth(1);
    let (buffer, store) = counting_buffer(config, &dir).await;
    let handles = handle_sink(&buffer);

    let data = pattern(32 * 20);
    buffer.append(&data).await.unwrap();

    // Pages 5 and 6 are missing; 4 and 7 are prefetched
    let bytes = buffer.read(32 * 5 + 3, 40).await.unwrap();
    assert_eq!(&bytes[..], &data[32 * 5 + 3..32 * 5 + 43]);

    let outcomes = settle(&handles).await;
    let mut pages: Vec<u64> = outcomes.iter().map(BufferingOutcome::page).collect();
    pages.sort_unstable();
    assert_eq!(pages, vec![4, 7]);
    assert!(outcomes.iter().all(BufferingOutcome::is_loaded));
    assert_eq!(store.read_count(), 4);
    assert_eq!(buffer.stats().prefetches, 2);

    // Prefetched pages are served without touching the disk again
    let before = buffer.read(32 * 4, 32).await.unwrap();
    let after = buffer.read(32 * 7, 32).await.unwrap();
    assert_eq!(&before[..], &data[32 * 4..32 * 5]);
    assert_eq!(&after[..], &data[32 * 7..32 * 8]);
    assert_eq!(store.read_count(), 4);
    assert!(handles.lock().is_empty());
}

#[tokio::test]
async fn test_read_spanning_disk_and_memory() {
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path().join("session");
    let config = BufferConfig::new(64, 8)
        .with_write_ring_depth(1)
        .with_prefetch(false);
    let (buffer, store) = counting_buffer(config, &dir).await;

    let data = pattern(100);
    buffer.append(&data).await.unwrap();

    // Durable is 96; the read page at 64 is short and the last 4 bytes are the tail
    let bytes = buffer.read(50, 50).await.unwrap();
    assert_eq!(&bytes[..], &data[50..100]);
    assert_eq!(store.read_offsets(), vec![0, 64]);

    // More data lands on disk; the short cached page is refetched when needed
    buffer.append(&pattern(200)[100..]).await.unwrap();
    let bytes = buffer.read(60, 60).await.unwrap();
    assert_eq!(&bytes[..], &pattern(200)[60..120]);
    assert_eq!(store.read_offsets(), vec![0, 64, 64]);
}

#[tokio::test]
async fn test_session_teardown() {
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path().join("session");
    let buffer = PagedSampleBuffer::new(16, 16, &dir).await.unwrap();
    assert_eq!(buffer.state(), SessionState::Created);

    buffer.append(&pattern(100)).await.unwrap();
    assert_eq!(buffer.state(), SessionState::Recording);
    assert!(dir.join(SESSION_FILE_NAME).is_file());

    assert!(buffer.release().await.unwrap());
    assert!(!dir.exists());
    assert_eq!(buffer.state(), SessionState::Released);

    // Idempotent
    assert!(!buffer.release().await.unwrap());

    assert!(matches!(
        buffer.read(0, 10).await,
        Err(SampleBufferError::Released)
    ));
    assert!(matches!(
        buffer.append(&[1, 2, 3]).await,
        Err(SampleBufferError::Released)
    ));
    assert!(matches!(
        buffer.flush().await,
        Err(SampleBufferError::Released)
    ));
    assert_eq!(buffer.stats().state, SessionState::Released);
}

#[tokio::test]
async fn test_existing_session_directory_is_rejected() {
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path().join("session");

    let first = PagedSampleBuffer::new(16, 16, &dir).await.unwrap();
    let err = PagedSampleBuffer::new(16, 16, &dir).await.unwrap_err();
    assert!(matches!(err, SampleBufferError::SessionExists { .. }));

    // Once released the directory may be reused by a fresh session
    first.release().await.unwrap();
    let second = PagedSampleBuffer::new(16, 16, &dir).await.unwrap();
    assert_eq!(second.committed_length(), 0);
    second.release().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path().join("session");

    let err = PagedSampleBuffer::new(0, 16, &dir).await.unwrap_err();
    assert!(matches!(err, SampleBufferError::InvalidConfig(_)));
    assert!(!dir.exists());
}

#[tokio::test]
async fn test_late_prefetch_after_release_is_dropped() {
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path().join("session");
    let config = BufferConfig::new(16, 16).with_write_ring_depth(1);
    let buffer = PagedSampleBuffer::with_config(config, &dir).await.unwrap();
    let handles = handle_sink(&buffer);

    buffer.append(&pattern(16 * 8)).await.unwrap();
    buffer.read(16 * 3, 4).await.unwrap();
    assert!(buffer.release().await.unwrap());

    for outcome in settle(&handles).await {
        assert!(
            !matches!(outcome, BufferingOutcome::Failed { .. }),
            "unexpected outcome {:?}",
            outcome
        );
    }
    assert!(!dir.exists());
    assert_eq!(buffer.stats().cached_pages, 0);
}

#[tokio::test]
async fn test_export_range_to_file() {
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path().join("session");
    let buffer = PagedSampleBuffer::new(64, 32, &dir).await.unwrap();

    let data = pattern(1000);
    buffer.append(&data).await.unwrap();

    let out_path = temp_dir.path().join("export.bin");
    let mut out = tokio::fs::File::create(&out_path).await.unwrap();
    let written = buffer.export_range(100, 850, &mut out).await.unwrap();
    drop(out);

    assert_eq!(written, 850);
    assert_eq!(std::fs::read(&out_path).unwrap(), &data[100..950]);
    buffer.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_with_live_producer() {
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path().join("session");
    let config = BufferConfig::new(64, 48).with_read_cache_pages(4);
    let (buffer, _store) = counting_buffer(config, &dir).await;

    const TOTAL: usize = 64 * 200;
    let data = Arc::new(pattern(TOTAL));

    let producer = {
        let buffer = Arc::clone(&buffer);
        let data = Arc::clone(&data);
        tokio::spawn(async move {
            for chunk in data.chunks(97) {
                buffer.append(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            buffer.flush().await.unwrap();
        })
    };

    let readers: Vec<_> = (0..4u64)
        .map(|reader| {
            let buffer = Arc::clone(&buffer);
            let data = Arc::clone(&data);
            tokio::spawn(async move {
                let mut step = 0u64;
                while buffer.durable_length() < TOTAL as u64 {
                    let committed = buffer.committed_length();
                    if committed == 0 {
                        tokio::task::yield_now().await;
                        continue;
                    }
                    let position = (step * 131 + reader * 977) % committed;
                    let bytes = buffer.read(position, 150).await.unwrap();
                    let start = position as usize;
                    assert_eq!(&bytes[..], &data[start..start + bytes.len()]);
                    assert!(!bytes.is_empty());
                    step += 1;
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    producer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }

    assert_eq!(session_bytes(&dir), *data);
    let all = buffer.read(0, TOTAL).await.unwrap();
    assert_eq!(&all[..], &data[..]);
    assert!(buffer.release().await.unwrap());
}
