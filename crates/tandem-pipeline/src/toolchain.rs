//! Compilers for generated sources.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use crate::binding::DependencyScope;
use crate::config::ToolchainSettings;
use crate::fsx::{copy_tree, write_atomic};
use crate::process::{self, ExternalError};
use crate::profile::TargetKind;

/// Everything a toolchain may look at for one compilation.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    pub target: TargetKind,
    pub source_dir: &'a Path,
    pub output_dir: &'a Path,
    /// Scratch space owned by the binding.
    pub work_dir: &'a Path,
    pub scope: &'a DependencyScope,
}

/// Compiles one target's generated sources against its dependency scope.
pub trait Toolchain: Send + Sync {
    fn name(&self) -> String;

    /// Compile `request.source_dir` into `request.output_dir`, which exists and is empty.
    fn compile(&self, request: &CompileRequest<'_>) -> Result<(), ExternalError>;
}

/// Build the toolchain described by the configuration.
pub fn toolchain_from_settings(settings: &ToolchainSettings) -> Box<dyn Toolchain> {
    match settings {
        ToolchainSettings::Stage => Box::new(StageToolchain),
        ToolchainSettings::Command {
            program,
            args,
            timeout_secs,
        } => Box::new(
            CommandToolchain::new(program.clone(), args.clone())
                .with_timeout(timeout_secs.map(Duration::from_secs)),
        ),
    }
}

/// Built-in toolchain: stages the sources together with their resolved
/// dependency scope, ready for an external build.
#[derive(Debug, Default, Clone, Copy)]
pub struct StageToolchain;

/// Scope manifest written next to staged sources.
pub const SCOPE_FILE: &str = "dependencies.json";

impl Toolchain for StageToolchain {
    fn name(&self) -> String {
        "stage".to_string()
    }

    fn compile(&self, request: &CompileRequest<'_>) -> Result<(), ExternalError> {
        let copied = copy_tree(request.source_dir, &request.output_dir.join("sources"))?;
        if copied == 0 {
            return Err(ExternalError::Rejected(format!(
                "no source files under {}",
                request.source_dir.display()
            )));
        }

        let scope = serde_json::to_vec_pretty(request.scope)
            .map_err(|e| ExternalError::Rejected(e.to_string()))?;
        write_atomic(&request.output_dir.join(SCOPE_FILE), &scope)?;
        Ok(())
    }
}

/// Runs an external compiler.
///
/// `{sources}`, `{output}` and `{scope}` in the arguments are replaced by
/// the source directory, the output directory and a JSON file holding the
/// dependency scope.
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandToolchain {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Toolchain for CommandToolchain {
    fn name(&self) -> String {
        self.program.clone()
    }

    fn compile(&self, request: &CompileRequest<'_>) -> Result<(), ExternalError> {
        let scope_file = request.work_dir.join("scope.json");
        let scope = serde_json::to_vec_pretty(request.scope)
            .map_err(|e| ExternalError::Rejected(e.to_string()))?;
        write_atomic(&scope_file, &scope)?;

        let sources = request.source_dir.display().to_string();
        let output = request.output_dir.display().to_string();
        let scope = scope_file.display().to_string();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{sources}", &sources)
                    .replace("{output}", &output)
                    .replace("{scope}", &scope)
            })
            .collect();

        let mut command = Command::new(&self.program);
        command.args(&args).current_dir(request.work_dir);
        process::run(&mut command, self.timeout)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct Dirs {
        _root: TempDir,
        sources: std::path::PathBuf,
        output: std::path::PathBuf,
        work: std::path::PathBuf,
    }

    fn dirs() -> Dirs {
        let root = TempDir::new().unwrap();
        let sources = root.path().join("src");
        let work = root.path().join("work");
        let output = work.join("out");
        fs::create_dir_all(sources.join("com/example")).unwrap();
        fs::write(sources.join("com/example/HealthApi.kt"), "interface HealthApi").unwrap();
        fs::create_dir_all(&output).unwrap();
        Dirs {
            _root: root,
            sources,
            output,
            work,
        }
    }

    fn scope() -> DependencyScope {
        DependencyScope {
            implementation: vec!["io.ktor:ktor-client-core:2.3.0".into()],
            ..Default::default()
        }
    }

    #[test]
    fn stage_copies_sources_and_scope() {
        let d = dirs();
        let scope = scope();
        let request = CompileRequest {
            target: TargetKind::Client,
            source_dir: &d.sources,
            output_dir: &d.output,
            work_dir: &d.work,
            scope: &scope,
        };
        StageToolchain.compile(&request).unwrap();

        assert!(d.output.join("sources/com/example/HealthApi.kt").is_file());
        let written: DependencyScope =
            serde_json::from_slice(&fs::read(d.output.join(SCOPE_FILE)).unwrap()).unwrap();
        assert_eq!(written, scope);
    }

    #[test]
    fn stage_rejects_empty_sources() {
        let d = dirs();
        fs::remove_dir_all(&d.sources).unwrap();
        fs::create_dir_all(&d.sources).unwrap();
        let scope = DependencyScope::default();
        let request = CompileRequest {
            target: TargetKind::Server,
            source_dir: &d.sources,
            output_dir: &d.output,
            work_dir: &d.work,
            scope: &scope,
        };
        assert!(matches!(
            StageToolchain.compile(&request),
            Err(ExternalError::Rejected(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn command_substitutes_placeholders() {
        let d = dirs();
        let scope = scope();
        let toolchain = CommandToolchain::new(
            "sh",
            vec![
                "-c".into(),
                r#"cp -R "$1"/. "$2" && cp "$3" "$2/scope.json""#.into(),
                "sh".into(),
                "{sources}".into(),
                "{output}".into(),
                "{scope}".into(),
            ],
        );
        let request = CompileRequest {
            target: TargetKind::Server,
            source_dir: &d.sources,
            output_dir: &d.output,
            work_dir: &d.work,
            scope: &scope,
        };
        toolchain.compile(&request).unwrap();

        assert!(d.output.join("com/example/HealthApi.kt").is_file());
        assert!(d.output.join("scope.json").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn command_failure_carries_stderr() {
        let d = dirs();
        let scope = DependencyScope::default();
        let toolchain = CommandToolchain::new(
            "sh",
            vec!["-c".into(), "echo 'unresolved reference: Foo' >&2; exit 1".into()],
        );
        let request = CompileRequest {
            target: TargetKind::Server,
            source_dir: &d.sources,
            output_dir: &d.output,
            work_dir: &d.work,
            scope: &scope,
        };
        let err = toolchain.compile(&request).unwrap_err();
        assert!(err.to_string().contains("unresolved reference"));
    }

    #[test]
    fn settings_select_toolchain() {
        assert_eq!(toolchain_from_settings(&ToolchainSettings::Stage).name(), "stage");
        let command = ToolchainSettings::Command {
            program: "gradle".into(),
            args: vec![],
            timeout_secs: Some(5),
        };
        assert_eq!(toolchain_from_settings(&command).name(), "gradle");
    }
}
