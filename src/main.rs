//! CLI entry point for profiler-daq
//!
//! # Usage
//!
//! Record five seconds of mock data and print statistics:
//! ```bash
//! profiler-daq record --duration-secs 5
//! ```
//!
//! Keep the session and export a slice of it:
//! ```bash
//! profiler-daq record --keep --export-start 0 --export-len 65536 --export-out slice.bin
//! ```
//!
//! Show the effective configuration:
//! ```bash
//! profiler-daq config
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use profiler_daq::config::AppConfig;
use profiler_daq::recorder::{run_recording, ExportRequest, RecordOptions};
use profiler_daq::tracing_setup;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "profiler-daq")]
#[command(about = "Power-profiler recorder backed by a paged sample buffer", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/profiler.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a mock stream through a fresh session
    Record {
        /// Recording length in seconds
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Mock source sample rate in Hz
        #[arg(long)]
        sample_rate: Option<u32>,

        /// Produce as fast as possible instead of in real time
        #[arg(long)]
        fast: bool,

        /// Keep the session directory after the run
        #[arg(long)]
        keep: bool,

        /// Seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,

        /// First byte to export
        #[arg(long, requires = "export_out", default_value = "0")]
        export_start: u64,

        /// Number of bytes to export
        #[arg(long, requires = "export_out")]
        export_len: Option<u64>,

        /// Export destination file
        #[arg(long)]
        export_out: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.clone())?;
    tracing_setup::init_from_config(&config)?;

    match cli.command {
        Commands::Record {
            duration_secs,
            sample_rate,
            fast,
            keep,
            seed,
            export_start,
            export_len,
            export_out,
        } => {
            let mut options = RecordOptions::from_config(&config);
            if let Some(secs) = duration_secs {
                options.duration_secs = secs;
            }
            if let Some(rate) = sample_rate {
                options.sample_rate_hz = rate;
            }
            options.realtime = !fast;
            options.keep = keep;
            options.seed = seed;
            options.export = export_out.map(|out| ExportRequest {
                start: export_start,
                len: export_len.unwrap_or(u64::MAX),
                out,
            });

            let summary = run_recording(&config, options).await?;
            let rendered =
                toml::to_string_pretty(&summary).context("Failed to render summary")?;
            println!("{}", rendered);
        }
        Commands::Config => {
            println!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
