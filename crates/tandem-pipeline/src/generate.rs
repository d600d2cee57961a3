//! Generation Targets: turn the contract into one target's source tree.
//!
//! Each target owns its output directory outright. A run either leaves it
//! untouched (inputs unchanged, tree intact) or deletes it and regenerates
//! everything; stale files from an older contract never survive.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tandem_telemetry::log_task_up_to_date;

use crate::contract::Contract;
use crate::engine::{GenerationEngine, GenerationRequest};
use crate::error::PipelineError;
use crate::fsx::{
    remove_dir_if_exists, remove_file_if_exists, sha256_hex, tree_checksums, tree_sha256,
    write_atomic,
};
use crate::profile::{GenerationProfile, TargetKind};

/// Source files produced for one target.
#[derive(Debug, Clone)]
pub struct GeneratedSourceSet {
    pub target: TargetKind,
    pub dir: PathBuf,
    /// Relative path -> SHA-256.
    pub files: BTreeMap<String, String>,
    /// Input fingerprint the files were generated from.
    pub fingerprint: String,
    /// The previous output was reused.
    pub up_to_date: bool,
}

/// Record of the last successful generation, used for up-to-date checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct GenerationStamp {
    fingerprint: String,
    contract_sha256: String,
    tree_sha256: String,
    file_count: usize,
}

/// One generation target: a profile bound to its own output directory.
#[derive(Debug, Clone)]
pub struct GenerationTarget {
    profile: GenerationProfile,
    output_dir: PathBuf,
    state_dir: PathBuf,
}

impl GenerationTarget {
    pub fn new(
        profile: GenerationProfile,
        output_dir: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            profile,
            output_dir: output_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    pub fn kind(&self) -> TargetKind {
        self.profile.kind()
    }

    pub fn profile(&self) -> &GenerationProfile {
        &self.profile
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn stamp_path(&self) -> PathBuf {
        self.state_dir
            .join(format!("{}.generate.json", self.kind()))
    }

    /// Digest of everything that determines this target's output.
    pub fn fingerprint(&self, contract: &Contract, engine: &dyn GenerationEngine) -> String {
        let canonical = format!(
            "contract={}\nprofile={}\nengine={}\n",
            contract.sha256(),
            self.profile.fingerprint(),
            engine.identity()
        );
        sha256_hex(canonical.as_bytes())
    }

    /// Generate this target's sources from `contract`.
    ///
    /// Skipped when the recorded fingerprint matches and the output tree is
    /// unchanged, unless `force` is set. On failure the output directory is
    /// left absent.
    pub fn generate(
        &self,
        contract: &Contract,
        engine: &dyn GenerationEngine,
        force: bool,
    ) -> Result<GeneratedSourceSet, PipelineError> {
        let kind = self.kind();
        let fail = |reason: String| PipelineError::GenerationFailure {
            target: kind,
            contract: contract.path().to_path_buf(),
            reason,
        };
        let fingerprint = self.fingerprint(contract, engine);

        if !force {
            if let Some(files) = self.current_output(&fingerprint) {
                log_task_up_to_date!(
                    branch = %kind,
                    dir = %self.output_dir.display(),
                    files = files.len()
                );
                return Ok(GeneratedSourceSet {
                    target: kind,
                    dir: self.output_dir.clone(),
                    files,
                    fingerprint,
                    up_to_date: true,
                });
            }
        }

        remove_file_if_exists(&self.stamp_path()).map_err(|e| fail(e.to_string()))?;
        remove_dir_if_exists(&self.output_dir).map_err(|e| fail(e.to_string()))?;

        let parent = self
            .output_dir
            .parent()
            .ok_or_else(|| fail("output directory has no parent".into()))?;
        fs::create_dir_all(parent).map_err(|e| fail(e.to_string()))?;

        // Dropping the handle removes the staging dir unless it was renamed into place.
        let staging = tempfile::Builder::new()
            .prefix(".tandem-generate-")
            .tempdir_in(parent)
            .map_err(|e| fail(e.to_string()))?;

        let request = GenerationRequest {
            target: kind,
            contract: contract.path().to_path_buf(),
            generator: self.profile.generator().to_string(),
            output_dir: staging.path().to_path_buf(),
            packages: self.profile.packages().clone(),
            options: self.profile.effective_options(),
            global_properties: self.profile.global_properties(),
        };
        engine
            .generate(&request)
            .map_err(|e| fail(e.to_string()))?;

        let files = tree_checksums(staging.path()).map_err(|e| fail(e.to_string()))?;
        if files.is_empty() {
            return Err(fail("generator produced no files".into()));
        }

        if let Err(e) = fs::rename(staging.path(), &self.output_dir) {
            return Err(fail(format!(
                "could not move sources into {}: {}",
                self.output_dir.display(),
                e
            )));
        }

        let stamp = GenerationStamp {
            fingerprint: fingerprint.clone(),
            contract_sha256: contract.sha256().to_string(),
            tree_sha256: tree_sha256(&files),
            file_count: files.len(),
        };
        let content = serde_json::to_vec_pretty(&stamp)?;
        write_atomic(&self.stamp_path(), &content)?;

        tracing::info!(
            branch = %kind,
            dir = %self.output_dir.display(),
            files = files.len(),
            "generated sources"
        );

        Ok(GeneratedSourceSet {
            target: kind,
            dir: self.output_dir.clone(),
            files,
            fingerprint,
            up_to_date: false,
        })
    }

    /// Files of the existing output, if it is current for `fingerprint`.
    fn current_output(&self, fingerprint: &str) -> Option<BTreeMap<String, String>> {
        let content = fs::read(self.stamp_path()).ok()?;
        let stamp: GenerationStamp = serde_json::from_slice(&content).ok()?;
        if stamp.fingerprint != fingerprint || !self.output_dir.is_dir() {
            return None;
        }
        let files = tree_checksums(&self.output_dir).ok()?;
        (files.len() == stamp.file_count && tree_sha256(&files) == stamp.tree_sha256)
            .then_some(files)
    }
}
