//! Tracing subscriber setup for the recorder.
//!
//! The sample buffer library only emits `tracing` events; this module installs the
//! subscriber that renders them. `RUST_LOG` takes precedence over the configured
//! level when set.
//!
//! # Example
//! ```no_run
//! use profiler_daq::{config::AppConfig, tracing_setup};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = AppConfig::load(None)?;
//! tracing_setup::init_from_config(&config)?;
//! tracing::info!("Recorder started");
//! # Ok(())
//! # }
//! ```

use crate::config::AppConfig;
use anyhow::{anyhow, Result};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact single-line format without colors
    Compact,
    /// JSON lines for log aggregation
    Json,
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(anyhow!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                s
            )),
        }
    }
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to log span open/close events
    pub with_span_events: bool,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to include thread names
    pub with_thread_names: bool,
    /// Whether to enable ANSI colors (pretty format only)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Derive tracing options from the application configuration.
    pub fn from_app_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Set output format
    #[must_use]
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    #[must_use]
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }
}

/// Initialize tracing from the application configuration.
pub fn init_from_config(config: &AppConfig) -> Result<()> {
    init(TracingConfig::from_app_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed this returns `Ok(())`, so tests
/// and embedding code can call it freely.
pub fn init(config: TracingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let result = match config.format {
        OutputFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_thread_names(config.with_thread_names)
                .with_ansi(config.with_ansi)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(fmt_layer).try_init()
        }
        OutputFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_thread_names(config.with_thread_names)
                .with_ansi(false)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(fmt_layer).try_init()
        }
        OutputFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_thread_names(config.with_thread_names)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(fmt_layer).try_init()
        }
    };

    result.or_else(already_initialized)
}

fn already_initialized(e: TryInitError) -> Result<()> {
    if e
        .to_string()
        .contains("a global default trace dispatcher has already been set")
    {
        Ok(())
    } else {
        Err(anyhow!("Failed to initialize tracing: {}", e))
    }
}

/// Parse a log level name (case-insensitive).
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| {
        anyhow!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )
    })
}
