//! Application configuration loaded with Figment.
//!
//! Configuration is layered, later layers overriding earlier ones:
//!
//! 1. Built-in defaults ([`AppConfig::default`])
//! 2. A TOML file (`config/profiler.toml` unless another path is given); a missing
//!    file is not an error
//! 3. Environment variables prefixed with `PROFILER_DAQ_`; nested keys use a double
//!    underscore, e.g. `PROFILER_DAQ_BUFFER__READ_PAGE_SIZE=131072`
//!
//! # Example
//! ```no_run
//! use profiler_daq::config::AppConfig;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = AppConfig::load(None)?;
//! println!("Recording into {}", config.recording.session_root.display());
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use daq_sample_buffer::BufferConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/profiler.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "PROFILER_DAQ_";

/// Accepted `log_level` values.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Accepted `log_format` values.
pub const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Sample buffer paging and caching
    #[serde(default)]
    pub buffer: BufferConfig,
    /// Recording run settings
    #[serde(default)]
    pub recording: RecordingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "profiler-daq".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Recording run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Directory under which session directories are allocated
    pub session_root: PathBuf,
    /// Mock source sample rate
    pub sample_rate_hz: u32,
    /// Length of a recording run in seconds
    pub duration_secs: u64,
    /// Samples produced per append
    pub chunk_samples: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            session_root: PathBuf::from("./sessions"),
            sample_rate_hz: 100_000,
            duration_secs: 5,
            chunk_samples: 1_000,
        }
    }
}

impl Provider for AppConfig {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("Built-in Defaults")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

impl AppConfig {
    /// Load defaults, then `config_path` (or [`DEFAULT_CONFIG_PATH`]), then environment.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let file_path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::figment(&file_path)
            .extract::<AppConfig>()
            .context("Failed to extract configuration from Figment")
            .and_then(|config| {
                config
                    .validate()
                    .context("Configuration validation failed")?;
                Ok(config)
            })
    }

    /// Build the layered figment without extracting it.
    pub fn figment(file_path: &Path) -> Figment {
        let mut figment = Figment::from(AppConfig::default());

        if file_path.exists() {
            figment = figment.merge(Toml::file(file_path));
        } else {
            // Tracing is not up yet
            eprintln!(
                "Config file not found: {}. Using defaults.",
                file_path.display()
            );
        }

        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<()> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            anyhow::bail!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            );
        }

        let format = self.application.log_format.to_lowercase();
        if !LOG_FORMATS.contains(&format.as_str()) {
            anyhow::bail!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                LOG_FORMATS.join(", ")
            );
        }

        if self.recording.sample_rate_hz == 0 {
            anyhow::bail!("recording.sample_rate_hz must be greater than 0");
        }
        if self.recording.chunk_samples == 0 {
            anyhow::bail!("recording.chunk_samples must be greater than 0");
        }

        self.buffer.validate()?;
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
