//! Orchestration: wires the stages of both branches into one task graph,
//! runs it, and reports each branch on its own.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

use parking_lot::Mutex;
use serde::Serialize;
use tandem_telemetry::{
    log_contract_loaded, log_pipeline_finished, log_pipeline_started, log_version_resolved,
};

use crate::binding::{CompiledBinding, SourceBinding};
use crate::config::{ConfigError, ProjectConfig};
use crate::contract::Contract;
use crate::credentials::resolve_credentials;
use crate::engine::{CommandEngine, GenerationEngine};
use crate::error::PipelineError;
use crate::generate::{GeneratedSourceSet, GenerationTarget};
use crate::graph::{CancelFlag, Stage, TaskGraph, TaskId, TaskNode, TaskOutcome};
use crate::package::{PackagedArtifact, Packager};
use crate::profile::TargetKind;
use crate::publish::{PublishCoordinate, PublishReceipt, Publisher};
use crate::registry::open_registry;
use crate::toolchain::{toolchain_from_settings, Toolchain};
use crate::version::{Version, VersionResolver};

/// How far a run goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Goal {
    Generate,
    Build,
    Package,
    Publish,
}

impl Goal {
    pub fn as_str(self) -> &'static str {
        match self {
            Goal::Generate => "generate",
            Goal::Build => "build",
            Goal::Package => "package",
            Goal::Publish => "publish",
        }
    }

    /// Branch state every selected branch must reach for the run to succeed.
    pub fn final_state(self) -> BranchState {
        match self {
            Goal::Generate => BranchState::Generated,
            Goal::Build => BranchState::Compiled,
            Goal::Package => BranchState::Packaged,
            Goal::Publish => BranchState::Published,
        }
    }

    fn branch_stages(self) -> &'static [Stage] {
        const ALL: [Stage; 4] = [Stage::Generate, Stage::Compile, Stage::Package, Stage::Publish];
        match self {
            Goal::Generate => &ALL[..1],
            Goal::Build => &ALL[..2],
            Goal::Package => &ALL[..3],
            Goal::Publish => &ALL,
        }
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run options.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Regenerate even when outputs are current.
    pub force: bool,
    /// Tasks allowed to run at once.
    pub max_parallel: usize,
    /// Use this version instead of reading tag history.
    pub version_override: Option<Version>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            force: false,
            max_parallel: 2,
            version_override: None,
        }
    }
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// The build pipeline for one project configuration.
pub struct Pipeline {
    config: ProjectConfig,
    engine: Box<dyn GenerationEngine>,
    toolchain: Box<dyn Toolchain>,
    env: EnvLookup,
    options: PipelineOptions,
    cancel: CancelFlag,
}

/// Artifacts produced so far by one branch.
#[derive(Default)]
struct BranchArtifacts {
    sources: Option<GeneratedSourceSet>,
    compiled: Option<CompiledBinding>,
    packaged: Option<PackagedArtifact>,
    receipt: Option<PublishReceipt>,
}

/// State shared by the tasks of one run. Each value is written once.
struct RunState {
    contract: OnceLock<Contract>,
    version: OnceLock<Version>,
    branches: BTreeMap<TargetKind, Mutex<BranchArtifacts>>,
}

impl RunState {
    fn new(targets: &[TargetKind]) -> Self {
        Self {
            contract: OnceLock::new(),
            version: OnceLock::new(),
            branches: targets
                .iter()
                .map(|t| (*t, Mutex::new(BranchArtifacts::default())))
                .collect(),
        }
    }
}

impl Pipeline {
    pub fn new(config: ProjectConfig) -> Self {
        let engine = CommandEngine::from_settings(&config.generator);
        let toolchain = toolchain_from_settings(&config.toolchain);
        Self {
            config,
            engine: Box::new(engine),
            toolchain,
            env: Box::new(|key| std::env::var(key).ok()),
            options: PipelineOptions::default(),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_engine(mut self, engine: impl GenerationEngine + 'static) -> Self {
        self.engine = Box::new(engine);
        self
    }

    pub fn with_toolchain(mut self, toolchain: impl Toolchain + 'static) -> Self {
        self.toolchain = Box::new(toolchain);
        self
    }

    /// Replace the environment lookup used for credentials.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Box::new(lookup);
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// Flag that stops the run from starting further tasks.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Build the task graph for `goal` over `targets`.
    pub fn plan(&self, goal: Goal, targets: &[TargetKind]) -> Result<TaskGraph, PipelineError> {
        let load = TaskId::shared(Stage::LoadContract);
        let version = TaskId::shared(Stage::ResolveVersion);

        let versioned = goal >= Goal::Package;
        let mut graph = TaskGraph::new();
        graph.add(TaskNode::new(load))?;
        if versioned {
            graph.add(TaskNode::new(version))?;
        }

        for &target in targets {
            let generate = TaskId::branch(Stage::Generate, target);
            let mut node = TaskNode::new(generate).after(load);
            // The version is read from the working tree before anything writes to it.
            if versioned {
                node = node.after(version);
            }
            graph.add(node.writes(self.config.output_dir(target)))?;
            if goal < Goal::Build {
                continue;
            }

            let compile = TaskId::branch(Stage::Compile, target);
            graph.add(
                TaskNode::new(compile)
                    .after(generate)
                    .writes(self.config.binding_dir(target)),
            )?;
            if goal < Goal::Package {
                continue;
            }

            let package = TaskId::branch(Stage::Package, target);
            graph.add(
                TaskNode::new(package)
                    .after(compile)
                    .after(version)
                    .writes(self.config.artifact_dist_dir(target)),
            )?;
            if goal < Goal::Publish {
                continue;
            }

            graph.add(TaskNode::new(TaskId::branch(Stage::Publish, target)).after(package))?;
        }

        graph.validate()?;
        Ok(graph)
    }

    /// Run the pipeline up to `goal` for `targets`.
    ///
    /// Configuration problems are returned as errors. Stage failures are
    /// recorded per branch in the report.
    pub fn run(&self, goal: Goal, targets: &[TargetKind]) -> Result<PipelineReport, PipelineError> {
        let mut targets = targets.to_vec();
        targets.sort();
        targets.dedup();

        if goal == Goal::Publish && self.config.registry.is_none() {
            return Err(ConfigError::Invalid(vec![
                "publishing requires a 'registry' section".to_string(),
            ])
            .into());
        }
        self.config.validate()?;

        let graph = self.plan(goal, &targets)?;
        let state = RunState::new(&targets);

        log_pipeline_started!(
            goal = %goal,
            targets = ?targets,
            tasks = graph.len(),
            product = %self.config.product
        );

        let outcomes = graph.execute(self.options.max_parallel, &self.cancel, |task| {
            self.run_task(task, &state)
        })?;

        let report = self.report(goal, &targets, outcomes, state);
        log_pipeline_finished!(goal = %goal, success = report.is_success());
        Ok(report)
    }

    fn run_task(&self, task: TaskId, state: &RunState) -> Result<(), PipelineError> {
        let Some(target) = task.target else {
            return match task.stage {
                Stage::LoadContract => self.load_contract(state),
                Stage::ResolveVersion => self.resolve_version(state),
                _ => Err(missing(task, "a target")),
            };
        };
        let branch = state
            .branches
            .get(&target)
            .ok_or_else(|| missing(task, "branch state"))?;

        match task.stage {
            Stage::Generate => {
                let contract = state.contract.get().ok_or_else(|| missing(task, "contract"))?;
                let generation = GenerationTarget::new(
                    self.config.profile(target),
                    self.config.output_dir(target),
                    self.config.state_dir(),
                );
                let sources = generation.generate(contract, self.engine.as_ref(), self.options.force)?;
                branch.lock().sources = Some(sources);
            }
            Stage::Compile => {
                let sources = branch
                    .lock()
                    .sources
                    .clone()
                    .ok_or_else(|| missing(task, "generated sources"))?;
                let compiled = SourceBinding::for_target(&self.config, target)
                    .compile(&sources, self.toolchain.as_ref())?;
                branch.lock().compiled = Some(compiled);
            }
            Stage::Package => {
                let compiled = branch
                    .lock()
                    .compiled
                    .clone()
                    .ok_or_else(|| missing(task, "compiled binding"))?;
                let contract = state.contract.get().ok_or_else(|| missing(task, "contract"))?;
                let version = state.version.get().ok_or_else(|| missing(task, "version"))?;
                let artifact = Packager::new(self.config.artifact_id(target)).package(
                    &compiled,
                    version,
                    contract,
                    &self.config.artifact_dist_dir(target),
                )?;
                branch.lock().packaged = Some(artifact);
            }
            Stage::Publish => {
                let artifact = branch
                    .lock()
                    .packaged
                    .clone()
                    .ok_or_else(|| missing(task, "packaged archive"))?;
                let receipt = self.publish(target, &artifact)?;
                branch.lock().receipt = Some(receipt);
            }
            Stage::LoadContract | Stage::ResolveVersion => return Err(missing(task, "a shared slot")),
        }
        Ok(())
    }

    fn load_contract(&self, state: &RunState) -> Result<(), PipelineError> {
        let contract = Contract::load(&self.config.contract_path())?;
        log_contract_loaded!(
            path = %contract.path().display(),
            sha256 = %contract.sha256(),
            size = contract.size()
        );
        let _ = state.contract.set(contract);
        Ok(())
    }

    fn resolve_version(&self, state: &RunState) -> Result<(), PipelineError> {
        let policy = self.config.version_policy()?;
        let version = VersionResolver::new(self.config.base_dir.clone(), policy)
            .with_override(self.options.version_override.clone())
            .resolve();
        log_version_resolved!(version = %version);
        let _ = state.version.set(version);
        Ok(())
    }

    /// Credentials are resolved before any connection is made.
    fn publish(
        &self,
        target: TargetKind,
        artifact: &PackagedArtifact,
    ) -> Result<PublishReceipt, PipelineError> {
        let artifact_id = self.config.artifact_id(target);
        let registry = self.config.registry.as_ref().ok_or_else(|| {
            ConfigError::Invalid(vec!["publishing requires a 'registry' section".to_string()])
        })?;

        let credentials = resolve_credentials(&registry.credentials, &self.config.base_dir, |key| {
            (self.env)(key)
        })
        .map_err(|reason| PipelineError::CredentialsMissing {
            artifact_id: artifact_id.clone(),
            reason,
        })?;

        let transport = open_registry(&registry.url, registry.timeout()).map_err(|e| {
            PipelineError::PublishTransportFailure {
                artifact_id: artifact_id.clone(),
                reason: e.to_string(),
            }
        })?;

        let coordinate =
            PublishCoordinate::new(self.config.group.clone(), artifact_id, artifact.version.clone());
        Publisher::new(transport, credentials).publish(artifact, &coordinate)
    }

    fn report(
        &self,
        goal: Goal,
        targets: &[TargetKind],
        mut outcomes: BTreeMap<TaskId, TaskOutcome>,
        state: RunState,
    ) -> PipelineReport {
        let shared_failure = [Stage::LoadContract, Stage::ResolveVersion]
            .into_iter()
            .find_map(|stage| match outcomes.remove(&TaskId::shared(stage)) {
                Some(TaskOutcome::Failed(error)) => Some(StageFailure::new(stage, &error)),
                _ => None,
            });

        let RunState {
            contract,
            version,
            mut branches,
        } = state;
        let contract = contract.into_inner();

        let branches = targets
            .iter()
            .map(|&target| {
                let artifacts = branches
                    .remove(&target)
                    .map(|m| m.into_inner())
                    .unwrap_or_default();
                let (state, failure) = branch_state(goal, target, &mut outcomes);
                BranchReport {
                    target,
                    artifact_id: self.config.artifact_id(target),
                    state,
                    failure,
                    up_to_date: artifacts.sources.as_ref().is_some_and(|s| s.up_to_date),
                    sources_dir: artifacts.sources.map(|s| s.dir),
                    archive: artifacts.packaged.as_ref().map(|a| a.path.clone()),
                    archive_sha256: artifacts.packaged.map(|a| a.sha256),
                    receipt: artifacts.receipt,
                }
            })
            .collect();

        PipelineReport {
            goal,
            contract: contract.as_ref().map(|c| c.path().to_path_buf()),
            contract_sha256: contract.map(|c| c.sha256().to_string()),
            version: version.into_inner(),
            shared_failure,
            branches,
        }
    }
}

fn missing(task: TaskId, what: &'static str) -> PipelineError {
    PipelineError::MissingInput {
        task: task.to_string(),
        missing: what,
    }
}

/// Fold one branch's task outcomes into its reported state.
fn branch_state(
    goal: Goal,
    target: TargetKind,
    outcomes: &mut BTreeMap<TaskId, TaskOutcome>,
) -> (BranchState, Option<StageFailure>) {
    let mut state = BranchState::Pending;
    for &stage in goal.branch_stages() {
        match outcomes.remove(&TaskId::branch(stage, target)) {
            Some(TaskOutcome::Succeeded) => state = BranchState::after(stage),
            Some(TaskOutcome::Failed(error)) => {
                return (BranchState::Failed, Some(StageFailure::new(stage, &error)))
            }
            Some(TaskOutcome::Skipped { .. }) => return (BranchState::Skipped, None),
            Some(TaskOutcome::Cancelled) => return (BranchState::Cancelled, None),
            None => break,
        }
    }
    (state, None)
}

/// Where a branch ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchState {
    Pending,
    Generated,
    Compiled,
    Packaged,
    Published,
    Failed,
    /// Blocked by a failed shared task.
    Skipped,
    Cancelled,
}

impl BranchState {
    fn after(stage: Stage) -> Self {
        match stage {
            Stage::Generate => BranchState::Generated,
            Stage::Compile => BranchState::Compiled,
            Stage::Package => BranchState::Packaged,
            Stage::Publish => BranchState::Published,
            Stage::LoadContract | Stage::ResolveVersion => BranchState::Pending,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BranchState::Pending => "pending",
            BranchState::Generated => "generated",
            BranchState::Compiled => "compiled",
            BranchState::Packaged => "packaged",
            BranchState::Published => "published",
            BranchState::Failed => "failed",
            BranchState::Skipped => "skipped",
            BranchState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed stage, as reported.
#[derive(Debug, Clone, Serialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub code: Option<&'static str>,
    pub message: String,
}

impl StageFailure {
    fn new(stage: Stage, error: &PipelineError) -> Self {
        let code = error.code();
        let full = error.to_string();
        let message = code
            .and_then(|c| full.strip_prefix(c))
            .and_then(|rest| rest.strip_prefix(": "))
            .map(str::to_string)
            .unwrap_or(full);
        Self {
            stage,
            code,
            message,
        }
    }
}

/// Outcome of one branch.
#[derive(Debug, Clone, Serialize)]
pub struct BranchReport {
    pub target: TargetKind,
    pub artifact_id: String,
    pub state: BranchState,
    pub failure: Option<StageFailure>,
    /// Generation was skipped because the sources were current.
    pub up_to_date: bool,
    pub sources_dir: Option<PathBuf>,
    pub archive: Option<PathBuf>,
    pub archive_sha256: Option<String>,
    pub receipt: Option<PublishReceipt>,
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub goal: Goal,
    pub contract: Option<PathBuf>,
    pub contract_sha256: Option<String>,
    pub version: Option<Version>,
    /// Failure of a task both branches depend on.
    pub shared_failure: Option<StageFailure>,
    pub branches: Vec<BranchReport>,
}

impl PipelineReport {
    /// Every selected branch reached the goal.
    pub fn is_success(&self) -> bool {
        self.shared_failure.is_none()
            && self
                .branches
                .iter()
                .all(|b| b.state == self.goal.final_state())
    }

    /// The run stopped because the contract could not be read.
    pub fn missing_contract(&self) -> bool {
        self.shared_failure
            .as_ref()
            .is_some_and(|f| f.code == Some("E2001"))
    }

    pub fn branch(&self, target: TargetKind) -> Option<&BranchReport> {
        self.branches.iter().find(|b| b.target == target)
    }

    /// Every failure with the branch it belongs to (`None` for shared tasks).
    pub fn failures(&self) -> impl Iterator<Item = (Option<TargetKind>, &StageFailure)> {
        self.shared_failure
            .iter()
            .map(|f| (None, f))
            .chain(
                self.branches
                    .iter()
                    .filter_map(|b| b.failure.as_ref().map(|f| (Some(b.target), f))),
            )
    }
}
