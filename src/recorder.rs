//! Recording run: a mock producer feeding a paged sample buffer while a scrubber reads
//! it back, the way a live chart would.
//!
//! ```text
//! MockSampleSource ── append ──> PagedSampleBuffer <── read ── scrubber
//!                                      │
//!                                      └── on_buffering ──> prefetch outcome log
//! ```
//!
//! After the producer finishes the buffer is flushed, an optional range is exported,
//! statistics are collected, and the session is released unless asked to keep it.

use anyhow::{Context, Result};
use daq_sample_buffer::{
    BufferStats, BufferingOutcome, FileSessionStore, PagedSampleBuffer,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::config::AppConfig;
use crate::mock_source::{MockSampleSource, SAMPLE_SIZE};

/// A byte range to copy out of the session before release.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    /// First logical byte
    pub start: u64,
    /// Number of bytes (clamped to the recording)
    pub len: u64,
    /// Destination file
    pub out: PathBuf,
}

/// Per-run options on top of [`AppConfig`].
#[derive(Debug, Clone)]
pub struct RecordOptions {
    /// Recording length
    pub duration_secs: u64,
    /// Mock source sample rate
    pub sample_rate_hz: u32,
    /// Samples per append
    pub chunk_samples: usize,
    /// Pace the producer in real time; otherwise produce as fast as possible
    pub realtime: bool,
    /// Keep the session directory after the run
    pub keep: bool,
    /// Optional export performed before release
    pub export: Option<ExportRequest>,
    /// Seed for the mock source and the scrubber
    pub seed: Option<u64>,
}

impl RecordOptions {
    /// Options taken from the `[recording]` section.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            duration_secs: config.recording.duration_secs,
            sample_rate_hz: config.recording.sample_rate_hz,
            chunk_samples: config.recording.chunk_samples,
            realtime: true,
            keep: false,
            export: None,
            seed: None,
        }
    }
}

/// Outcome of a recording run.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingSummary {
    /// Session directory (removed unless kept)
    pub session_dir: PathBuf,
    /// Whether the session directory was kept
    pub kept: bool,
    /// Samples produced
    pub samples: u64,
    /// Reads issued by the scrubber
    pub scrub_reads: u64,
    /// Prefetches that landed in the cache
    pub prefetches_loaded: u64,
    /// Bytes exported, if an export was requested
    pub exported_bytes: Option<u64>,
    /// Wall-clock run time in milliseconds
    pub elapsed_ms: u64,
    /// Buffer statistics before release
    pub buffer: BufferStats,
}

/// Record a mock stream through a fresh session under `config.recording.session_root`.
#[instrument(skip_all, fields(rate = options.sample_rate_hz, secs = options.duration_secs))]
pub async fn run_recording(config: &AppConfig, options: RecordOptions) -> Result<RecordingSummary> {
    let started = Instant::now();
    let session_dir = FileSessionStore::allocate_dir(&config.recording.session_root);
    let buffer = Arc::new(
        PagedSampleBuffer::with_config(config.buffer.clone(), &session_dir)
            .await
            .with_context(|| format!("Failed to create session in {}", session_dir.display()))?,
    );
    info!(session = %session_dir.display(), "Recording started");

    let prefetches_loaded = Arc::new(AtomicU64::new(0));
    {
        let loaded = Arc::clone(&prefetches_loaded);
        buffer.on_buffering(move |handle| {
            let loaded = Arc::clone(&loaded);
            tokio::spawn(async move {
                match handle.wait().await {
                    BufferingOutcome::Loaded { page, bytes } => {
                        loaded.fetch_add(1, Ordering::Relaxed);
                        debug!(page, bytes, "Prefetch landed");
                    }
                    BufferingOutcome::Discarded { page } => debug!(page, "Prefetch discarded"),
                    BufferingOutcome::Failed { page, reason } => {
                        warn!(page, %reason, "Prefetch failed")
                    }
                }
            });
        });
    }

    let producing = Arc::new(AtomicBool::new(true));
    let scrubber = tokio::spawn(scrub(
        Arc::clone(&buffer),
        Arc::clone(&producing),
        options.seed,
    ));

    let produced = produce(&buffer, &options).await;
    producing.store(false, Ordering::Release);
    let scrub_reads = scrubber.await.context("Scrubber task panicked")??;
    let samples = produced?;

    buffer.flush().await.context("Final flush failed")?;

    let exported_bytes = match &options.export {
        Some(request) => Some(export(&buffer, request).await?),
        None => None,
    };

    let stats = buffer.stats();
    info!(
        committed = stats.committed_length,
        pages_flushed = stats.pages_flushed,
        disk_fetches = stats.disk_fetches,
        "Recording finished"
    );

    if !options.keep {
        buffer.release().await.context("Failed to release session")?;
    }

    Ok(RecordingSummary {
        session_dir,
        kept: options.keep,
        samples,
        scrub_reads,
        prefetches_loaded: prefetches_loaded.load(Ordering::Relaxed),
        exported_bytes,
        elapsed_ms: started.elapsed().as_millis() as u64,
        buffer: stats,
    })
}

async fn produce(buffer: &PagedSampleBuffer, options: &RecordOptions) -> Result<u64> {
    let total = options.duration_secs * u64::from(options.sample_rate_hz);
    let chunk = options.chunk_samples.max(1);
    let mut source = MockSampleSource::new(options.sample_rate_hz, options.seed);

    let chunk_period =
        Duration::from_secs_f64(chunk as f64 / f64::from(options.sample_rate_hz.max(1)));
    let mut ticker = tokio::time::interval(chunk_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    while source.samples_produced() < total {
        if options.realtime {
            ticker.tick().await;
        }
        let remaining = (total - source.samples_produced()) as usize;
        let bytes = source.next_chunk(chunk.min(remaining));
        buffer.append(&bytes).await.context("Append failed")?;
        if !options.realtime {
            tokio::task::yield_now().await;
        }
    }
    Ok(source.samples_produced())
}

/// Random sample-aligned reads while the producer runs, then one pass over the
/// recording.
async fn scrub(
    buffer: Arc<PagedSampleBuffer>,
    producing: Arc<AtomicBool>,
    seed: Option<u64>,
) -> Result<u64> {
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s ^ 0x5c2b),
        None => StdRng::from_entropy(),
    };
    let window = buffer.config().read_page_size;
    let mut reads = 0u64;

    while producing.load(Ordering::Acquire) {
        let committed = buffer.committed_length();
        let samples = committed / SAMPLE_SIZE as u64;
        if samples > 0 {
            let position = rng.gen_range(0..samples) * SAMPLE_SIZE as u64;
            let bytes = buffer.read(position, window).await?;
            if bytes.is_empty() {
                anyhow::bail!("Empty read at {} below committed length {}", position, committed);
            }
            reads += 1;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Sequential pass, the way a minimap redraw walks the whole recording
    let committed = buffer.committed_length();
    let mut position = 0;
    while position < committed {
        let bytes = buffer.read(position, window).await?;
        if bytes.is_empty() {
            break;
        }
        position += bytes.len() as u64;
        reads += 1;
    }
    debug!(reads, "Scrubber finished");
    Ok(reads)
}

async fn export(buffer: &PagedSampleBuffer, request: &ExportRequest) -> Result<u64> {
    if let Some(parent) = request.out.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut file = tokio::fs::File::create(&request.out)
        .await
        .with_context(|| format!("Failed to create {}", request.out.display()))?;
    let written = buffer
        .export_range(request.start, request.len, &mut file)
        .await?;
    info!(out = %request.out.display(), written, "Exported range");
    Ok(written)
}
