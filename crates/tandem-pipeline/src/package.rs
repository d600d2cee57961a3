//! Artifact Packager: turns one compiled binding into a versioned archive.
//!
//! Archive layout (`<base_name>-<version>.tar.gz`):
//! - `manifest.json` - identity, version, contract hash and per-file checksums
//! - `files/...` - the binding's compiled output
//!
//! Entries are written in sorted order with fixed mode and mtime, so the same
//! inputs always give byte-identical archives.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tandem_telemetry::log_artifact_packaged;
use tar::Builder;

use crate::binding::CompiledBinding;
use crate::contract::Contract;
use crate::error::PipelineError;
use crate::fsx::{remove_file_if_exists, sha256_hex, write_atomic};
use crate::profile::TargetKind;
use crate::publish::receipt_path;
use crate::version::Version;
use crate::TOOL_VERSION;

/// Current archive format version.
pub const ARCHIVE_FORMAT_VERSION: u32 = 1;

/// Directory prefix for packaged files inside the archive.
const FILES_PREFIX: &str = "files/";

/// Manifest stored first in every archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub tandem_archive_version: u32,
    pub base_name: String,
    pub target: TargetKind,
    pub version: Version,
    /// SHA-256 of the contract the sources were generated from.
    pub contract_sha256: String,
    pub tool_version: String,
    /// Relative path -> SHA-256 of every packaged file.
    pub checksums: BTreeMap<String, String>,
}

/// A written archive.
#[derive(Debug, Clone)]
pub struct PackagedArtifact {
    pub target: TargetKind,
    pub base_name: String,
    pub version: Version,
    pub path: PathBuf,
    pub file_name: String,
    pub sha256: String,
    pub size: u64,
    pub manifest: ArchiveManifest,
}

/// Packages compiled bindings under one base name.
#[derive(Debug, Clone)]
pub struct Packager {
    base_name: String,
}

impl Packager {
    pub fn new(base_name: impl Into<String>) -> Self {
        Self {
            base_name: base_name.into(),
        }
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn file_name(&self, version: &Version) -> String {
        format!("{}-{}.tar.gz", self.base_name, version)
    }

    /// Package `binding` into `out_dir`.
    ///
    /// The archive appears under its final name only once fully written.
    pub fn package(
        &self,
        binding: &CompiledBinding,
        version: &Version,
        contract: &Contract,
        out_dir: &Path,
    ) -> Result<PackagedArtifact, PipelineError> {
        let fail = |reason: String| PipelineError::PackagingFailure {
            target: binding.target,
            reason,
        };

        if !binding.output_dir.is_dir() {
            return Err(fail(format!(
                "compiled output {} does not exist",
                binding.output_dir.display()
            )));
        }
        if binding.files.is_empty() {
            return Err(fail(format!(
                "compiled output {} is empty",
                binding.output_dir.display()
            )));
        }

        let manifest = ArchiveManifest {
            tandem_archive_version: ARCHIVE_FORMAT_VERSION,
            base_name: self.base_name.clone(),
            target: binding.target,
            version: version.clone(),
            contract_sha256: contract.sha256().to_string(),
            tool_version: TOOL_VERSION.to_string(),
            checksums: binding.files.clone(),
        };

        let bytes = self
            .build_archive(binding, &manifest)
            .map_err(|e| fail(e.to_string()))?;

        let file_name = self.file_name(version);
        let path = out_dir.join(&file_name);
        // A receipt belongs to the bytes that were uploaded, not to this archive.
        remove_file_if_exists(&receipt_path(&path))
            .map_err(|e| fail(format!("{}: {}", path.display(), e)))?;
        write_atomic(&path, &bytes).map_err(|e| fail(format!("{}: {}", path.display(), e)))?;

        let artifact = PackagedArtifact {
            target: binding.target,
            base_name: self.base_name.clone(),
            version: version.clone(),
            file_name,
            sha256: sha256_hex(&bytes),
            size: bytes.len() as u64,
            manifest,
            path,
        };
        log_artifact_packaged!(
            branch = %artifact.target,
            archive = %artifact.path.display(),
            version = %artifact.version,
            size = artifact.size
        );
        Ok(artifact)
    }

    fn build_archive(
        &self,
        binding: &CompiledBinding,
        manifest: &ArchiveManifest,
    ) -> io::Result<Vec<u8>> {
        let buffer = Vec::new();
        let encoder = GzEncoder::new(buffer, Compression::default());
        let mut archive = Builder::new(encoder);

        let manifest_json = serde_json::to_string_pretty(manifest)?;
        add_file_to_tar(&mut archive, "manifest.json", manifest_json.as_bytes())?;

        for (relative, expected) in &binding.files {
            let content = fs::read(binding.output_dir.join(relative))?;
            if &sha256_hex(&content) != expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{} changed after compilation", relative),
                ));
            }
            add_file_to_tar(&mut archive, &format!("{}{}", FILES_PREFIX, relative), &content)?;
        }

        let encoder = archive.into_inner()?;
        encoder.finish()
    }
}

fn add_file_to_tar<W: Write>(
    archive: &mut Builder<W>,
    name: &str,
    content: &[u8],
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0); // Reproducible builds
    header.set_cksum();
    archive.append_data(&mut header, name, content)
}

/// Load the manifest from an archive.
pub fn load_manifest(archive_path: &Path) -> Result<ArchiveManifest, PipelineError> {
    let file = File::open(archive_path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        if path.to_str() == Some("manifest.json") {
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            let manifest: ArchiveManifest = serde_json::from_str(&content)?;
            return Ok(manifest);
        }
    }

    Err(PipelineError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} has no manifest.json", archive_path.display()),
    )))
}

/// Entry names of an archive, in archive order.
pub fn list_entries(archive_path: &Path) -> Result<Vec<String>, PipelineError> {
    let file = File::open(archive_path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}
