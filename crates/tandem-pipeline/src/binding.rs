//! Source Bindings: each compiles exactly one target's generated sources.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::ProjectConfig;
use crate::error::PipelineError;
use crate::fsx::{remove_dir_if_exists, tree_checksums};
use crate::generate::GeneratedSourceSet;
use crate::profile::TargetKind;
use crate::toolchain::{CompileRequest, Toolchain};

/// Dependency coordinates (`group:name[:version]`) by scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencyScope {
    #[serde(default)]
    pub implementation: Vec<String>,
    #[serde(default)]
    pub runtime_only: Vec<String>,
    #[serde(default)]
    pub compile_only: Vec<String>,
}

impl DependencyScope {
    /// Union of `base` and `specific` per scope, base entries first, duplicates dropped.
    ///
    /// Returns a new value; neither input is modified.
    pub fn compose(base: &DependencyScope, specific: &DependencyScope) -> DependencyScope {
        DependencyScope {
            implementation: union(&base.implementation, &specific.implementation),
            runtime_only: union(&base.runtime_only, &specific.runtime_only),
            compile_only: union(&base.compile_only, &specific.compile_only),
        }
    }

    /// `defaults` underneath `self`: a default is dropped when `self` already
    /// names the same `group:name` in any scope, whatever the version.
    pub fn with_defaults(&self, defaults: &DependencyScope) -> DependencyScope {
        let named: Vec<&str> = self.iter().map(module_key).collect();
        let keep = |list: &[String]| -> Vec<String> {
            list.iter()
                .filter(|c| !named.contains(&module_key(c.as_str())))
                .cloned()
                .collect()
        };
        let kept = DependencyScope {
            implementation: keep(&defaults.implementation),
            runtime_only: keep(&defaults.runtime_only),
            compile_only: keep(&defaults.compile_only),
        };
        DependencyScope::compose(&kept, self)
    }

    pub fn is_empty(&self) -> bool {
        self.implementation.is_empty() && self.runtime_only.is_empty() && self.compile_only.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.implementation
            .iter()
            .chain(&self.runtime_only)
            .chain(&self.compile_only)
            .map(String::as_str)
    }
}

/// `group:name` without the version.
fn module_key(coordinate: &str) -> &str {
    match coordinate.match_indices(':').nth(1) {
        Some((at, _)) => &coordinate[..at],
        None => coordinate,
    }
}

fn union(a: &[String], b: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(a.len() + b.len());
    for item in a.iter().chain(b) {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

/// Coordinates in `scope` that are not `group:name[:version]`.
pub fn invalid_coordinates(scope: &DependencyScope) -> Vec<String> {
    scope
        .iter()
        .filter(|c| {
            let parts: Vec<&str> = c.split(':').collect();
            !(2..=3).contains(&parts.len())
                || parts
                    .iter()
                    .any(|p| p.is_empty() || p.contains(char::is_whitespace))
        })
        .map(str::to_string)
        .collect()
}

/// Output of one binding's compilation.
#[derive(Debug, Clone)]
pub struct CompiledBinding {
    pub target: TargetKind,
    pub output_dir: PathBuf,
    pub scope: DependencyScope,
    /// Relative path -> SHA-256 of every produced file.
    pub files: BTreeMap<String, String>,
}

/// Compilation unit for one target.
#[derive(Debug, Clone)]
pub struct SourceBinding {
    target: TargetKind,
    scope: DependencyScope,
    work_dir: PathBuf,
    output_dir: PathBuf,
}

impl SourceBinding {
    pub fn new(target: TargetKind, scope: DependencyScope, work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        Self {
            target,
            scope,
            output_dir: work_dir.join("out"),
            work_dir,
        }
    }

    pub fn for_target(config: &ProjectConfig, kind: TargetKind) -> Self {
        Self::new(kind, config.dependency_scope(kind), config.binding_dir(kind))
    }

    pub fn target(&self) -> TargetKind {
        self.target
    }

    pub fn scope(&self) -> &DependencyScope {
        &self.scope
    }

    pub fn work_dir(&self) -> &std::path::Path {
        &self.work_dir
    }

    /// Compile `sources` with `toolchain` into this binding's output directory.
    ///
    /// Only this binding's source set is visible to the toolchain.
    pub fn compile(
        &self,
        sources: &GeneratedSourceSet,
        toolchain: &dyn Toolchain,
    ) -> Result<CompiledBinding, PipelineError> {
        let fail = |reason: String| PipelineError::CompileFailure {
            target: self.target,
            reason,
        };

        if sources.target != self.target {
            return Err(fail(format!(
                "received sources generated for the {} target",
                sources.target
            )));
        }
        if !sources.dir.is_dir() {
            return Err(fail(format!(
                "source root {} does not exist",
                sources.dir.display()
            )));
        }

        remove_dir_if_exists(&self.work_dir).map_err(|e| fail(e.to_string()))?;
        fs::create_dir_all(&self.output_dir).map_err(|e| fail(e.to_string()))?;

        let request = CompileRequest {
            target: self.target,
            source_dir: &sources.dir,
            output_dir: &self.output_dir,
            work_dir: &self.work_dir,
            scope: &self.scope,
        };
        toolchain
            .compile(&request)
            .map_err(|e| fail(format!("{}: {}", toolchain.name(), e)))?;

        let files = tree_checksums(&self.output_dir).map_err(|e| fail(e.to_string()))?;
        tracing::debug!(
            branch = %self.target,
            toolchain = %toolchain.name(),
            files = files.len(),
            "compiled binding"
        );

        Ok(CompiledBinding {
            target: self.target,
            output_dir: self.output_dir.clone(),
            scope: self.scope.clone(),
            files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolchain::StageToolchain;
    use tempfile::TempDir;

    fn coords(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn source_set(root: &std::path::Path, target: TargetKind) -> GeneratedSourceSet {
        let dir = root.join("generated").join(target.as_str());
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("src/Api.kt"), format!("// {}", target)).unwrap();
        GeneratedSourceSet {
            target,
            files: tree_checksums(&dir).unwrap(),
            dir,
            fingerprint: "f".repeat(64),
            up_to_date: false,
        }
    }

    #[test]
    fn compose_unions_without_mutating_base() {
        let base = DependencyScope {
            implementation: coords(&["org.jetbrains.kotlin:kotlin-stdlib:1.9.0"]),
            ..Default::default()
        };
        let server = DependencyScope {
            implementation: coords(&[
                "org.jetbrains.kotlin:kotlin-stdlib:1.9.0",
                "org.springframework:spring-web:6.1.0",
            ]),
            ..Default::default()
        };
        let client = DependencyScope {
            runtime_only: coords(&["io.ktor:ktor-client-cio:2.3.0"]),
            ..Default::default()
        };
        let base_before = base.clone();

        let server_scope = DependencyScope::compose(&base, &server);
        let client_scope = DependencyScope::compose(&base, &client);

        assert_eq!(base, base_before);
        assert_eq!(server_scope.implementation.len(), 2);
        assert!(server_scope.runtime_only.is_empty());
        assert_eq!(client_scope.implementation, base.implementation);
        assert!(!client_scope.iter().any(|c| c.contains("spring")));
    }

    #[test]
    fn user_entries_replace_defaults_of_same_module() {
        let defaults = DependencyScope {
            implementation: coords(&["io.ktor:ktor-client-core", "io.ktor:ktor-client-content-negotiation"]),
            runtime_only: coords(&["io.ktor:ktor-client-cio"]),
            ..Default::default()
        };
        let user = DependencyScope {
            implementation: coords(&["io.ktor:ktor-client-core:2.3.0"]),
            compile_only: coords(&["io.ktor:ktor-client-cio:2.3.0"]),
            ..Default::default()
        };

        let scope = user.with_defaults(&defaults);
        assert_eq!(
            scope.implementation,
            coords(&["io.ktor:ktor-client-content-negotiation", "io.ktor:ktor-client-core:2.3.0"])
        );
        assert!(scope.runtime_only.is_empty());
        assert_eq!(scope.compile_only, coords(&["io.ktor:ktor-client-cio:2.3.0"]));
        assert_eq!(module_key("a:b:1.0"), "a:b");
        assert_eq!(module_key("a:b"), "a:b");
    }

    #[test]
    fn coordinate_validation() {
        let scope = DependencyScope {
            implementation: coords(&["a:b", "a:b:1.0", "ab", "a::1", "a:b:c:d", "a b:c"]),
            ..Default::default()
        };
        assert_eq!(invalid_coordinates(&scope), coords(&["ab", "a::1", "a:b:c:d", "a b:c"]));
    }

    #[test]
    fn compile_stages_only_own_sources() {
        let dir = TempDir::new().unwrap();
        let server_set = source_set(dir.path(), TargetKind::Server);
        let _client_set = source_set(dir.path(), TargetKind::Client);

        let binding = SourceBinding::new(
            TargetKind::Server,
            DependencyScope::default(),
            dir.path().join("bindings/server"),
        );
        let compiled = binding.compile(&server_set, &StageToolchain).unwrap();

        assert_eq!(compiled.target, TargetKind::Server);
        assert!(compiled.files.contains_key("sources/src/Api.kt"));
        assert!(compiled.files.contains_key("dependencies.json"));
        let content = fs::read_to_string(compiled.output_dir.join("sources/src/Api.kt")).unwrap();
        assert_eq!(content, "// server");
    }

    #[test]
    fn compile_rejects_other_targets_sources() {
        let dir = TempDir::new().unwrap();
        let client_set = source_set(dir.path(), TargetKind::Client);
        let binding = SourceBinding::new(
            TargetKind::Server,
            DependencyScope::default(),
            dir.path().join("bindings/server"),
        );

        let err = binding.compile(&client_set, &StageToolchain).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::CompileFailure {
                target: TargetKind::Server,
                ..
            }
        ));
    }

    #[test]
    fn compile_fails_on_missing_source_root() {
        let dir = TempDir::new().unwrap();
        let set = source_set(dir.path(), TargetKind::Client);
        fs::remove_dir_all(&set.dir).unwrap();
        let binding = SourceBinding::new(
            TargetKind::Client,
            DependencyScope::default(),
            dir.path().join("bindings/client"),
        );

        let err = binding.compile(&set, &StageToolchain).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn recompiling_drops_stale_output() {
        let dir = TempDir::new().unwrap();
        let set = source_set(dir.path(), TargetKind::Client);
        let binding = SourceBinding::new(
            TargetKind::Client,
            DependencyScope::default(),
            dir.path().join("bindings/client"),
        );
        let first = binding.compile(&set, &StageToolchain).unwrap();
        fs::write(first.output_dir.join("stale.txt"), "old").unwrap();

        let second = binding.compile(&set, &StageToolchain).unwrap();
        assert!(!second.files.contains_key("stale.txt"));
    }
}
