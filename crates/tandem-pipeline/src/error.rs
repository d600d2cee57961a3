use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::graph::{GraphError, Stage};
use crate::profile::TargetKind;
use crate::version::VersionError;

/// Errors produced by the pipeline stages.
///
/// Every stage failure names the branch (server or client) and the file it
/// was working on, so a failing run can be diagnosed from its output alone.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// E2001: The contract file is absent or unreadable.
    #[error("E2001: missing contract {}: {reason}", .path.display())]
    MissingContract { path: PathBuf, reason: String },

    /// E2002: The contract could not be parsed as an OpenAPI 3.x document.
    #[error("E2002: invalid contract {}: {reason}", .path.display())]
    InvalidContract { path: PathBuf, reason: String },

    /// E2010: The generation engine rejected the contract or profile.
    #[error("E2010: {target} generation from {} failed: {reason}", .contract.display())]
    GenerationFailure {
        target: TargetKind,
        contract: PathBuf,
        reason: String,
    },

    /// E2020: The generated sources did not compile.
    #[error("E2020: {target} compilation failed: {reason}")]
    CompileFailure { target: TargetKind, reason: String },

    /// E2030: The compiled output could not be packaged.
    #[error("E2030: {target} packaging failed: {reason}")]
    PackagingFailure { target: TargetKind, reason: String },

    /// E2040: No usable registry credentials.
    #[error("E2040: no registry credentials to publish {artifact_id}: {reason}")]
    CredentialsMissing { artifact_id: String, reason: String },

    /// E2041: The registry was unreachable or rejected the upload.
    #[error("E2041: publishing {artifact_id} failed: {reason}")]
    PublishTransportFailure { artifact_id: String, reason: String },

    /// A task ran before the task producing its input.
    #[error("task {task} ran without {missing}")]
    MissingInput { task: String, missing: &'static str },

    /// A task panicked while running.
    #[error("task {task} panicked")]
    TaskPanicked { task: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Version(#[from] VersionError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Stable error code, if this is a stage failure.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::MissingContract { .. } => Some("E2001"),
            Self::InvalidContract { .. } => Some("E2002"),
            Self::GenerationFailure { .. } => Some("E2010"),
            Self::CompileFailure { .. } => Some("E2020"),
            Self::PackagingFailure { .. } => Some("E2030"),
            Self::CredentialsMissing { .. } => Some("E2040"),
            Self::PublishTransportFailure { .. } => Some("E2041"),
            _ => None,
        }
    }

    /// The pipeline stage this error belongs to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::MissingContract { .. } | Self::InvalidContract { .. } => {
                Some(Stage::LoadContract)
            }
            Self::Version(_) => Some(Stage::ResolveVersion),
            Self::GenerationFailure { .. } => Some(Stage::Generate),
            Self::CompileFailure { .. } => Some(Stage::Compile),
            Self::PackagingFailure { .. } => Some(Stage::Package),
            Self::CredentialsMissing { .. } | Self::PublishTransportFailure { .. } => {
                Some(Stage::Publish)
            }
            _ => None,
        }
    }
}
