//! Project configuration (`tandem.yaml`) parser.
//!
//! Relative paths are resolved against the directory holding the file.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::binding::{invalid_coordinates, DependencyScope};
use crate::credentials::CredentialSettings;
use crate::fsx::{normalize, paths_overlap};
use crate::profile::{GenerationProfile, PackageNames, ProfileSettings, TargetKind};
use crate::version::{Version, VersionPolicy, BASE_VERSION, DEFAULT_TAG_PREFIX};

/// Conventional configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "tandem.yaml";

/// Errors from loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {reason}", .path.display())]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse {}: {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// The project configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Product name; default artifact ids derive from it.
    pub product: String,
    /// Group identity shared by every published artifact.
    pub group: String,
    /// Path to the API contract.
    pub contract: PathBuf,
    #[serde(default = "default_build_dir")]
    pub build_dir: PathBuf,
    #[serde(default)]
    pub version: VersionSettings,
    #[serde(default)]
    pub generator: GeneratorSettings,
    #[serde(default)]
    pub toolchain: ToolchainSettings,
    /// Dependencies shared by both bindings.
    #[serde(default)]
    pub dependencies: DependencyScope,
    #[serde(default)]
    pub targets: TargetsConfig,
    #[serde(default)]
    pub registry: Option<RegistrySettings>,

    /// Directory the configuration was loaded from.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_build_dir() -> PathBuf {
    PathBuf::from("build")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VersionSettings {
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
    #[serde(default = "default_base_version")]
    pub base: String,
}

impl Default for VersionSettings {
    fn default() -> Self {
        Self {
            tag_prefix: default_tag_prefix(),
            base: default_base_version(),
        }
    }
}

fn default_tag_prefix() -> String {
    DEFAULT_TAG_PREFIX.to_string()
}

fn default_base_version() -> String {
    BASE_VERSION.to_string()
}

/// How the generation engine is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorSettings {
    #[serde(default = "default_generator_program")]
    pub program: String,
    /// Arguments placed before `generate`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Deadline per invocation; 0 disables it.
    #[serde(default = "default_generator_timeout")]
    pub timeout_secs: u64,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            program: default_generator_program(),
            args: Vec::new(),
            timeout_secs: default_generator_timeout(),
        }
    }
}

impl GeneratorSettings {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

fn default_generator_program() -> String {
    "openapi-generator-cli".to_string()
}

fn default_generator_timeout() -> u64 {
    300
}

/// Which toolchain compiles the generated sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ToolchainSettings {
    /// Built-in: stage sources and the dependency scope for a later build.
    #[default]
    Stage,
    /// External compiler command with `{sources}`, `{output}` and `{scope}` placeholders.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetsConfig {
    #[serde(default)]
    pub server: TargetConfig,
    #[serde(default)]
    pub client: TargetConfig,
}

/// Per-target overrides. Everything is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub generator: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub artifact_id: Option<String>,
    #[serde(default)]
    pub packages: PackageOverrides,
    #[serde(default)]
    pub options: BTreeMap<String, OptionValue>,
    #[serde(default)]
    pub dependencies: DependencyScope,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageOverrides {
    pub root: Option<String>,
    pub api: Option<String>,
    pub model: Option<String>,
    pub invoker: Option<String>,
}

/// A generator option value as written in YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{}", b),
            OptionValue::Int(i) => write!(f, "{}", i),
            OptionValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistrySettings {
    /// `https://…` for an HTTP registry, `file://…` for a directory.
    pub url: String,
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub credentials: CredentialSettings,
}

fn default_registry_timeout() -> u64 {
    60
}

impl RegistrySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ProjectConfig {
    /// Load a configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::parse(&content, path)
    }

    /// Parse a configuration from YAML content.
    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        config.base_dir = parent.canonicalize().unwrap_or(parent);
        Ok(config)
    }

    /// Resolve a configured path against the configuration directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&self.base_dir.join(path))
        }
    }

    pub fn contract_path(&self) -> PathBuf {
        self.resolve_path(&self.contract)
    }

    pub fn build_dir(&self) -> PathBuf {
        self.resolve_path(&self.build_dir)
    }

    /// Up-to-date stamps.
    pub fn state_dir(&self) -> PathBuf {
        self.build_dir().join(".tandem")
    }

    /// Packaged archives.
    pub fn dist_dir(&self) -> PathBuf {
        self.build_dir().join("dist")
    }

    /// Archives of one artifact.
    pub fn artifact_dist_dir(&self, kind: TargetKind) -> PathBuf {
        self.dist_dir().join(self.artifact_id(kind))
    }

    /// Working directory of one source binding.
    pub fn binding_dir(&self, kind: TargetKind) -> PathBuf {
        self.build_dir().join("bindings").join(kind.as_str())
    }

    pub fn target(&self, kind: TargetKind) -> &TargetConfig {
        match kind {
            TargetKind::Server => &self.targets.server,
            TargetKind::Client => &self.targets.client,
        }
    }

    /// Generated sources of one target.
    pub fn output_dir(&self, kind: TargetKind) -> PathBuf {
        match &self.target(kind).output_dir {
            Some(dir) => self.resolve_path(dir),
            None => self.build_dir().join("generated").join(kind.as_str()),
        }
    }

    pub fn artifact_id(&self, kind: TargetKind) -> String {
        self.target(kind)
            .artifact_id
            .clone()
            .unwrap_or_else(|| format!("{}-api-{}", self.product, kind))
    }

    pub fn packages(&self, kind: TargetKind) -> PackageNames {
        let overrides = &self.target(kind).packages;
        let root = overrides
            .root
            .clone()
            .unwrap_or_else(|| format!("{}.{}", self.group, kind));
        let derived = PackageNames::under(&root);
        PackageNames {
            root,
            api: overrides.api.clone().unwrap_or(derived.api),
            model: overrides.model.clone().unwrap_or(derived.model),
            invoker: overrides.invoker.clone().unwrap_or(derived.invoker),
        }
    }

    pub fn profile(&self, kind: TargetKind) -> GenerationProfile {
        let target = self.target(kind);
        GenerationProfile::new(
            kind,
            ProfileSettings {
                generator: target
                    .generator
                    .clone()
                    .unwrap_or_else(|| kind.default_generator().to_string()),
                packages: self.packages(kind),
                options: target
                    .options
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_string()))
                    .collect(),
            },
        )
    }

    /// Built-in defaults for `kind`, then the shared dependencies, then the
    /// target's own. The shared list is not modified.
    pub fn dependency_scope(&self, kind: TargetKind) -> DependencyScope {
        DependencyScope::compose(&self.dependencies, &self.target(kind).dependencies)
            .with_defaults(&kind.default_dependencies())
    }

    pub fn version_policy(&self) -> Result<VersionPolicy, ConfigError> {
        let base = self.version.base.parse::<Version>().map_err(|e| {
            ConfigError::Invalid(vec![format!("version.base: {}", e)])
        })?;
        Ok(VersionPolicy {
            tag_prefix: self.version.tag_prefix.clone(),
            base,
        })
    }

    /// Check the configuration, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.product.trim().is_empty() {
            problems.push("'product' must not be empty".to_string());
        }
        if self.group.trim().is_empty() || self.group.contains(char::is_whitespace) {
            problems.push(format!("'group' is not a valid group id: '{}'", self.group));
        }
        if let Err(ConfigError::Invalid(mut found)) = self.version_policy() {
            problems.append(&mut found);
        }

        let contract = self.contract_path();
        let reserved = [
            ("state directory", self.state_dir()),
            ("dist directory", self.dist_dir()),
            ("server binding directory", self.binding_dir(TargetKind::Server)),
            ("client binding directory", self.binding_dir(TargetKind::Client)),
        ];
        for kind in TargetKind::ALL {
            let output = self.output_dir(kind);
            if contract.starts_with(&output) {
                problems.push(format!(
                    "targets.{}.output_dir {} contains the contract",
                    kind,
                    output.display()
                ));
            }
            if self.base_dir.starts_with(&output) {
                problems.push(format!(
                    "targets.{}.output_dir {} contains the project directory",
                    kind,
                    output.display()
                ));
            }
            for (what, dir) in &reserved {
                if paths_overlap(&output, dir) {
                    problems.push(format!(
                        "targets.{}.output_dir {} overlaps the {}",
                        kind,
                        output.display(),
                        what
                    ));
                }
            }
        }

        let server_out = self.output_dir(TargetKind::Server);
        let client_out = self.output_dir(TargetKind::Client);
        if paths_overlap(&server_out, &client_out) {
            problems.push(format!(
                "server and client output directories overlap ({} / {})",
                server_out.display(),
                client_out.display()
            ));
        }

        let server_id = self.artifact_id(TargetKind::Server);
        if server_id == self.artifact_id(TargetKind::Client) {
            problems.push(format!(
                "server and client share the artifact id '{}'",
                server_id
            ));
        }

        let server_packages = self.packages(TargetKind::Server);
        let client_packages = self.packages(TargetKind::Client);
        if let Some((a, b)) = server_packages.overlap_with(&client_packages) {
            problems.push(format!(
                "server package '{}' overlaps client package '{}'",
                a, b
            ));
        }

        for (scope_name, scope) in [
            ("dependencies", &self.dependencies),
            ("targets.server.dependencies", &self.targets.server.dependencies),
            ("targets.client.dependencies", &self.targets.client.dependencies),
        ] {
            for coordinate in invalid_coordinates(scope) {
                problems.push(format!(
                    "{}: '{}' is not a group:name[:version] coordinate",
                    scope_name, coordinate
                ));
            }
        }

        if let Some(registry) = &self.registry {
            if !(registry.url.starts_with("http://")
                || registry.url.starts_with("https://")
                || registry.url.starts_with("file://"))
            {
                problems.push(format!(
                    "registry.url must be http(s):// or file://, got '{}'",
                    registry.url
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}
