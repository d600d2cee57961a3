//! Boundary to the code-generation engine.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use crate::config::GeneratorSettings;
use crate::process::{self, ExternalError};
use crate::profile::{PackageNames, TargetKind};

/// One invocation of the generation engine.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub target: TargetKind,
    pub contract: PathBuf,
    pub generator: String,
    /// Empty directory the engine must write into.
    pub output_dir: PathBuf,
    pub packages: PackageNames,
    pub options: BTreeMap<String, String>,
    pub global_properties: BTreeMap<String, String>,
}

/// A code generator, treated as a black box.
pub trait GenerationEngine: Send + Sync {
    /// Stable description of the engine; part of every target's fingerprint.
    fn identity(&self) -> String;

    fn generate(&self, request: &GenerationRequest) -> Result<(), ExternalError>;
}

/// Runs an openapi-generator compatible command line.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    prefix_args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            timeout: None,
        }
    }

    pub fn from_settings(settings: &GeneratorSettings) -> Self {
        Self::new(settings.program.clone())
            .with_args(settings.args.clone())
            .with_timeout(settings.timeout())
    }

    /// Arguments placed before the `generate` subcommand.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.prefix_args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Full argument list for one request.
    pub fn command_args(&self, request: &GenerationRequest) -> Vec<String> {
        let mut args = self.prefix_args.clone();
        args.extend([
            "generate".to_string(),
            "--input-spec".to_string(),
            request.contract.display().to_string(),
            "--generator-name".to_string(),
            request.generator.clone(),
            "--output".to_string(),
            request.output_dir.display().to_string(),
            "--package-name".to_string(),
            request.packages.root.clone(),
            "--api-package".to_string(),
            request.packages.api.clone(),
            "--model-package".to_string(),
            request.packages.model.clone(),
            "--invoker-package".to_string(),
            request.packages.invoker.clone(),
        ]);
        if !request.options.is_empty() {
            args.push(format!(
                "--additional-properties={}",
                join_pairs(&request.options)
            ));
        }
        if !request.global_properties.is_empty() {
            args.push(format!(
                "--global-property={}",
                join_pairs(&request.global_properties)
            ));
        }
        args
    }
}

fn join_pairs(pairs: &BTreeMap<String, String>) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

impl GenerationEngine for CommandEngine {
    fn identity(&self) -> String {
        let mut identity = self.program.clone();
        for arg in &self.prefix_args {
            identity.push(' ');
            identity.push_str(arg);
        }
        identity
    }

    fn generate(&self, request: &GenerationRequest) -> Result<(), ExternalError> {
        let mut command = Command::new(&self.program);
        command.args(self.command_args(request));
        let output = process::run(&mut command, self.timeout)?;
        tracing::debug!(
            branch = %request.target,
            generator = %request.generator,
            stdout_bytes = output.stdout.len(),
            "generation engine finished"
        );
        Ok(())
    }
}
