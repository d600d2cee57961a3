//! Structured logging with JSON output.
//!
//! Everything goes to stderr; stdout is reserved for command results.

use crate::{LogFormat, TelemetryConfig, TelemetryError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the logging subsystem.
///
/// Sets up tracing-subscriber with either JSON or pretty format,
/// respecting the configured log level.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    // Build the env filter from config or RUST_LOG
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Json => init_json_logging(filter),
        LogFormat::Pretty => init_pretty_logging(filter),
    }
}

fn init_json_logging(filter: EnvFilter) -> Result<(), TelemetryError> {
    let json_layer = fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_file(false)
        .with_line_number(false)
        .flatten_event(true)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

fn init_pretty_logging(filter: EnvFilter) -> Result<(), TelemetryError> {
    let pretty_layer = fmt::layer()
        .pretty()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(pretty_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

/// Standard log event names.
pub mod events {
    /// A pipeline run is starting.
    pub const PIPELINE_STARTED: &str = "pipeline_started";

    /// A pipeline run has finished (successfully or not).
    pub const PIPELINE_FINISHED: &str = "pipeline_finished";

    /// The contract has been loaded and hashed.
    pub const CONTRACT_LOADED: &str = "contract_loaded";

    /// The build version has been resolved.
    pub const VERSION_RESOLVED: &str = "version_resolved";

    /// A task is starting.
    pub const TASK_STARTED: &str = "task_started";

    /// A task was skipped because its outputs are current.
    pub const TASK_UP_TO_DATE: &str = "task_up_to_date";

    /// A task failed.
    pub const TASK_FAILED: &str = "task_failed";

    /// An archive has been written.
    pub const ARTIFACT_PACKAGED: &str = "artifact_packaged";

    /// An archive has been uploaded and recorded.
    pub const ARTIFACT_PUBLISHED: &str = "artifact_published";
}

/// Helper macros for structured logging with standard fields.
///
/// These wrap the tracing macros to ensure consistent field naming.
#[macro_export]
macro_rules! log_pipeline_started {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::PIPELINE_STARTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_pipeline_finished {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::PIPELINE_FINISHED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_contract_loaded {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::CONTRACT_LOADED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_version_resolved {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::VERSION_RESOLVED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_task_started {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::TASK_STARTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_task_up_to_date {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::TASK_UP_TO_DATE,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_task_failed {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::TASK_FAILED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_artifact_packaged {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::ARTIFACT_PACKAGED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_artifact_published {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::ARTIFACT_PUBLISHED,
            $($field)*
        )
    };
}
