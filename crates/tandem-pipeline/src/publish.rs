//! Publisher: uploads packaged archives under their registry coordinates.
//!
//! A publication is recorded by a receipt written next to the archive, and
//! only after every upload for that archive succeeded. Each artifact is
//! published and recorded on its own; one failing never marks the other.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tandem_telemetry::log_artifact_published;

use crate::credentials::Credentials;
use crate::error::PipelineError;
use crate::fsx::{remove_file_if_exists, sha256_hex, write_atomic};
use crate::package::PackagedArtifact;
use crate::registry::RegistryTransport;
use crate::version::Version;
use crate::TOOL_VERSION;

/// Registry identity of one archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishCoordinate {
    pub group_id: String,
    pub artifact_id: String,
    pub version: Version,
}

impl PublishCoordinate {
    pub fn new(group_id: impl Into<String>, artifact_id: impl Into<String>, version: Version) -> Self {
        Self {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
            version,
        }
    }

    /// Registry path: `<group as dirs>/<artifact>/<version>/<artifact>-<version>.<ext>`.
    pub fn artifact_path(&self, extension: &str) -> String {
        format!(
            "{}/{}/{}/{}-{}.{}",
            self.group_id.replace('.', "/"),
            self.artifact_id,
            self.version,
            self.artifact_id,
            self.version,
            extension
        )
    }
}

impl fmt::Display for PublishCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group_id, self.artifact_id, self.version)
    }
}

/// Confirmation of one successful publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub coordinate: PublishCoordinate,
    pub location: String,
    pub sha256: String,
    pub size: u64,
    pub published_at: DateTime<Utc>,
    pub published_by: String,
}

/// Receipt path for an archive.
pub fn receipt_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".published.json");
    PathBuf::from(name)
}

/// Read the receipt recorded for an archive, if it was published.
pub fn load_receipt(archive: &Path) -> Result<Option<PublishReceipt>, PipelineError> {
    match fs::read(receipt_path(archive)) {
        Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Uploads archives with one set of credentials.
pub struct Publisher {
    transport: Box<dyn RegistryTransport>,
    credentials: Credentials,
}

impl Publisher {
    pub fn new(transport: Box<dyn RegistryTransport>, credentials: Credentials) -> Self {
        Self {
            transport,
            credentials,
        }
    }

    /// Publish `artifact` under `coordinate`.
    ///
    /// Uploads the archive and its `.sha256` sidecar, then records the
    /// receipt. Transport errors are not retried.
    pub fn publish(
        &self,
        artifact: &PackagedArtifact,
        coordinate: &PublishCoordinate,
    ) -> Result<PublishReceipt, PipelineError> {
        let fail = |reason: String| PipelineError::PublishTransportFailure {
            artifact_id: coordinate.artifact_id.clone(),
            reason,
        };

        let receipt_file = receipt_path(&artifact.path);
        remove_file_if_exists(&receipt_file)?;

        if coordinate.version != artifact.version {
            return Err(fail(format!(
                "archive version {} does not match coordinate {}",
                artifact.version, coordinate
            )));
        }

        let body = fs::read(&artifact.path)
            .map_err(|e| fail(format!("{}: {}", artifact.path.display(), e)))?;
        let sha256 = sha256_hex(&body);
        if sha256 != artifact.sha256 {
            return Err(fail(format!(
                "{} changed since it was packaged",
                artifact.path.display()
            )));
        }

        let location = self
            .transport
            .upload(&coordinate.artifact_path("tar.gz"), &body, &self.credentials)
            .map_err(|e| fail(e.to_string()))?;
        self.transport
            .upload(
                &coordinate.artifact_path("tar.gz.sha256"),
                sha256.as_bytes(),
                &self.credentials,
            )
            .map_err(|e| fail(e.to_string()))?;

        let receipt = PublishReceipt {
            coordinate: coordinate.clone(),
            location,
            sha256,
            size: body.len() as u64,
            published_at: Utc::now(),
            published_by: format!("tandem {}", TOOL_VERSION),
        };
        write_atomic(&receipt_file, &serde_json::to_vec_pretty(&receipt)?)?;

        log_artifact_published!(
            coordinate = %coordinate,
            registry = %self.transport.describe(),
            location = %receipt.location
        );
        Ok(receipt)
    }
}
