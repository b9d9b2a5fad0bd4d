//! # Profiler DAQ
//!
//! Application layer around the `daq-sample-buffer` crate: configuration loading,
//! tracing setup, a mock power-profiler source, and the recording run used by the
//! `profiler-daq` binary.
//!
//! ## Crate Structure
//!
//! - **`config`**: layered [`AppConfig`](config::AppConfig) (defaults, TOML, environment).
//! - **`tracing_setup`**: global subscriber installation.
//! - **`mock_source`**: synthetic current/digital sample stream.
//! - **`recorder`**: producer, scrubber and export driven against one session.
//!
//! The buffer itself is re-exported as [`sample_buffer`].

pub mod config;
pub mod mock_source;
pub mod recorder;
pub mod tracing_setup;

pub use daq_sample_buffer as sample_buffer;
