//! Logging infrastructure for the Tandem build pipeline.
//!
//! This crate provides:
//! - Structured JSON or pretty logging on stderr
//! - Standard event names shared by every pipeline stage
//!
//! # Usage
//!
//! ```ignore
//! use tandem_telemetry::{LogFormat, TelemetryConfig};
//!
//! let config = TelemetryConfig::new()
//!     .with_log_level("debug")
//!     .with_log_format(LogFormat::Pretty);
//!
//! tandem_telemetry::init(&config)?;
//! ```

pub mod config;
pub mod logging;

pub use config::{LogFormat, TelemetryConfig};
pub use logging::events;

use thiserror::Error;

/// Telemetry errors.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize logging.
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),

    /// Unknown log format name.
    #[error("unknown log format '{0}' (expected 'json' or 'pretty')")]
    UnknownFormat(String),
}

/// Initialize logging for the current process.
///
/// Can only succeed once per process; later calls return `LoggingInit`.
pub fn init(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    logging::init_logging(config)
}
