//! Contract-driven build pipeline.
//!
//! Loads one OpenAPI contract, fans it out into a server skeleton and a
//! client SDK, compiles each against its own dependency scope, stamps both
//! with a version derived from git tags, packages them into reproducible
//! archives and publishes them under one group identity.

pub mod binding;
pub mod config;
pub mod contract;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod fsx;
pub mod generate;
pub mod graph;
pub mod package;
pub mod pipeline;
pub mod process;
pub mod profile;
pub mod publish;
pub mod registry;
pub mod toolchain;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;

pub use binding::{CompiledBinding, DependencyScope, SourceBinding};
pub use config::{ConfigError, ProjectConfig, DEFAULT_CONFIG_FILE};
pub use contract::{Contract, ContractFormat, ContractSummary};
pub use credentials::{resolve_credentials, CredentialSettings, Credentials};
pub use engine::{CommandEngine, GenerationEngine, GenerationRequest};
pub use error::PipelineError;
pub use generate::{GeneratedSourceSet, GenerationTarget};
pub use graph::{CancelFlag, GraphError, Stage, TaskGraph, TaskId, TaskNode, TaskOutcome};
pub use package::{list_entries, load_manifest, ArchiveManifest, PackagedArtifact, Packager};
pub use pipeline::{
    BranchReport, BranchState, Goal, Pipeline, PipelineOptions, PipelineReport, StageFailure,
};
pub use process::ExternalError;
pub use profile::{GenerationProfile, PackageNames, ProfileSettings, TargetKind};
pub use publish::{load_receipt, receipt_path, PublishCoordinate, PublishReceipt, Publisher};
pub use registry::{
    open_registry, DirectoryRegistry, HttpRegistry, RegistryTransport, TransportError,
};
pub use toolchain::{toolchain_from_settings, CommandToolchain, StageToolchain, Toolchain};
pub use version::{
    resolve_version, RepoHistory, TagRef, Version, VersionError, VersionPolicy, VersionResolver,
};

/// Tool version (from Cargo.toml), recorded in archive manifests.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");
