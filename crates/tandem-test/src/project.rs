//! TestProject: a project directory in a temp dir.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;
use walkdir::WalkDir;

use tandem_pipeline::{ConfigError, ProjectConfig, DEFAULT_CONFIG_FILE};

/// Errors from TestProject operations.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("fixture not found: {0}")]
    FixtureNotFound(String),
}

/// Absolute path to the shared test fixtures directory.
pub fn fixtures_dir() -> PathBuf {
    // CARGO_MANIFEST_DIR = .../crates/tandem-test
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../tests/fixtures")
        .components()
        .collect()
}

/// A project holding the health contract, a `tandem.yaml` that runs
/// `fake-generator.sh` through `sh`, and a `file://` registry.
///
/// The directory is removed when the value is dropped.
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    /// Create a project using the `health.yaml` fixture as its contract.
    pub fn new() -> Result<Self, TestError> {
        Self::with_contract_fixture("health.yaml")
    }

    /// Create a project whose contract is a copy of the named fixture.
    pub fn with_contract_fixture(name: &str) -> Result<Self, TestError> {
        let fixture = fixtures_dir().join(name);
        if !fixture.is_file() {
            return Err(TestError::FixtureNotFound(fixture.display().to_string()));
        }
        let generator = fixtures_dir().join("fake-generator.sh");
        if !generator.is_file() {
            return Err(TestError::FixtureNotFound(generator.display().to_string()));
        }

        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("api"))?;
        fs::copy(&fixture, dir.path().join("api/openapi.yaml"))?;

        let config = format!(
            r#"product: health
group: com.example.health
contract: api/openapi.yaml
generator:
  program: sh
  args: ["{generator}"]
  timeout_secs: 60
registry:
  url: "file://{registry}"
"#,
            generator = generator.display(),
            registry = dir.path().join("registry").display(),
        );
        fs::write(dir.path().join(DEFAULT_CONFIG_FILE), config)?;

        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.root().join(DEFAULT_CONFIG_FILE)
    }

    pub fn contract_path(&self) -> PathBuf {
        self.root().join("api/openapi.yaml")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.root().join("registry")
    }

    pub fn dist_dir(&self) -> PathBuf {
        self.root().join("build/dist")
    }

    /// Load the project configuration the way the CLI does.
    pub fn config(&self) -> Result<ProjectConfig, TestError> {
        Ok(ProjectConfig::load(&self.config_path())?)
    }

    /// Remove the contract file.
    pub fn remove_contract(&self) -> Result<(), TestError> {
        fs::remove_file(self.contract_path())?;
        Ok(())
    }

    /// Write registry credentials to `local.properties`.
    pub fn write_credentials(&self, user: &str, token: &str) -> Result<(), TestError> {
        fs::write(
            self.root().join("local.properties"),
            format!("registry.user={}\nregistry.token={}\n", user, token),
        )?;
        Ok(())
    }

    /// Every packaged archive under `build/dist`, sorted.
    pub fn archives(&self) -> Result<Vec<PathBuf>, TestError> {
        files_with_suffix(&self.dist_dir(), ".tar.gz")
    }

    /// Every file under the registry directory, sorted.
    pub fn registry_files(&self) -> Result<Vec<PathBuf>, TestError> {
        files_with_suffix(&self.registry_dir(), "")
    }
}

fn files_with_suffix(root: &Path, suffix: &str) -> Result<Vec<PathBuf>, TestError> {
    let mut found = Vec::new();
    if !root.exists() {
        return Ok(found);
    }
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() && entry.path().to_string_lossy().ends_with(suffix) {
            found.push(entry.into_path());
        }
    }
    Ok(found)
}
