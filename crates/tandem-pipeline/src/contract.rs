//! Spec Loader: reads the single API contract every target is generated from.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::error::PipelineError;
use crate::fsx::sha256_hex;

/// HTTP methods we recognize in OpenAPI paths.
const HTTP_METHODS: &[&str] = &[
    "get", "post", "put", "delete", "patch", "head", "options", "trace",
];

/// Serialization format of the contract, from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractFormat {
    Yaml,
    Json,
    Unknown,
}

impl ContractFormat {
    pub fn detect(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("yaml") | Some("yml") => ContractFormat::Yaml,
            Some("json") => ContractFormat::Json,
            _ => ContractFormat::Unknown,
        }
    }
}

/// The loaded contract. Read-only after loading.
#[derive(Debug, Clone)]
pub struct Contract {
    path: PathBuf,
    sha256: String,
    format: ContractFormat,
    size: u64,
}

/// Headline facts about a contract, for `inspect`.
#[derive(Debug, Clone, Serialize)]
pub struct ContractSummary {
    pub spec_version: String,
    pub title: String,
    pub api_version: String,
    pub path_count: usize,
    pub operation_count: usize,
}

impl Contract {
    /// Load the contract at `path`.
    ///
    /// Only checks that the file exists and is readable; the content is
    /// validated by whoever consumes it.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let missing = |reason: String| PipelineError::MissingContract {
            path: path.to_path_buf(),
            reason,
        };

        let metadata = fs::metadata(path).map_err(|e| missing(e.to_string()))?;
        if !metadata.is_file() {
            return Err(missing("not a regular file".into()));
        }
        let content = fs::read(path).map_err(|e| missing(e.to_string()))?;

        Ok(Self {
            path: path.canonicalize().unwrap_or_else(|_| path.to_path_buf()),
            sha256: sha256_hex(&content),
            format: ContractFormat::detect(path),
            size: content.len() as u64,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn format(&self) -> ContractFormat {
        self.format
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Parse the contract and summarize it. Only OpenAPI 3.x is recognised.
    pub fn summary(&self) -> Result<ContractSummary, PipelineError> {
        let invalid = |reason: String| PipelineError::InvalidContract {
            path: self.path.clone(),
            reason,
        };

        let content = fs::read_to_string(&self.path).map_err(|e| PipelineError::MissingContract {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        // YAML parsing also handles JSON
        let root: Value = serde_yaml::from_str(&content).map_err(|e| invalid(e.to_string()))?;
        let root = root
            .as_object()
            .ok_or_else(|| invalid("document root must be an object".into()))?;

        let spec_version = root
            .get("openapi")
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid("missing 'openapi' version field".into()))?;
        if !spec_version.starts_with("3.") {
            return Err(invalid(format!(
                "unsupported OpenAPI version '{}' (expected 3.x)",
                spec_version
            )));
        }

        let info = root
            .get("info")
            .and_then(|v| v.as_object())
            .ok_or_else(|| invalid("missing 'info' object".into()))?;
        let title = info
            .get("title")
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid("missing 'info.title'".into()))?;
        let api_version = info
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("0.0.0");

        let paths = root.get("paths").and_then(|v| v.as_object());
        let path_count = paths.map(|p| p.len()).unwrap_or(0);
        let operation_count = paths
            .into_iter()
            .flat_map(|p| p.values())
            .filter_map(|item| item.as_object())
            .map(|item| {
                item.keys()
                    .filter(|k| HTTP_METHODS.contains(&k.as_str()))
                    .count()
            })
            .sum();

        Ok(ContractSummary {
            spec_version: spec_version.to_string(),
            title: title.to_string(),
            api_version: api_version.to_string(),
            path_count,
            operation_count,
        })
    }
}
