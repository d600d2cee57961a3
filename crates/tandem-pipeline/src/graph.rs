//! Task graph and scheduler.
//!
//! Every unit of pipeline work is a node with explicit dependencies and
//! declared outputs. The scheduler starts a node only once all of its
//! dependencies succeeded, runs independent nodes concurrently, and turns a
//! failure into `Skipped` for everything downstream of it while unrelated
//! branches keep going.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use serde::{Deserialize, Serialize};
use tandem_telemetry::{log_task_failed, log_task_started};
use thiserror::Error;

use crate::error::PipelineError;
use crate::fsx::paths_overlap;
use crate::profile::TargetKind;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    LoadContract,
    ResolveVersion,
    Generate,
    Compile,
    Package,
    Publish,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::LoadContract => "load_contract",
            Stage::ResolveVersion => "resolve_version",
            Stage::Generate => "generate",
            Stage::Compile => "compile",
            Stage::Package => "package",
            Stage::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage, either shared by the run or bound to one branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub stage: Stage,
    pub target: Option<TargetKind>,
}

impl TaskId {
    pub fn shared(stage: Stage) -> Self {
        Self {
            stage,
            target: None,
        }
    }

    pub fn branch(stage: Stage, target: TargetKind) -> Self {
        Self {
            stage,
            target: Some(target),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Some(target) => write!(f, "{}:{}", self.stage, target),
            None => write!(f, "{}", self.stage),
        }
    }
}

/// A node: what it depends on and which paths it exclusively writes.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: TaskId,
    pub depends_on: Vec<TaskId>,
    pub outputs: Vec<PathBuf>,
}

impl TaskNode {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            depends_on: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn after(mut self, dependency: TaskId) -> Self {
        self.depends_on.push(dependency);
        self
    }

    pub fn writes(mut self, output: impl Into<PathBuf>) -> Self {
        self.outputs.push(output.into());
        self
    }
}

/// Structural problems in a graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("task {0} is declared twice")]
    DuplicateTask(TaskId),

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("dependency cycle through task {0}")]
    Cycle(TaskId),

    #[error("tasks {first} and {second} both write {}", .path.display())]
    OverlappingOutputs {
        first: TaskId,
        second: TaskId,
        path: PathBuf,
    },
}

/// How a task ended.
#[derive(Debug)]
pub enum TaskOutcome {
    Succeeded,
    Failed(PipelineError),
    /// Not run because a task it depends on failed.
    Skipped { blocked_by: TaskId },
    /// Not run because the run was cancelled.
    Cancelled,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded)
    }
}

/// Cooperative cancellation shared between the scheduler and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop starting new tasks. Running tasks finish normally.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A dependency graph of pipeline tasks.
#[derive(Debug, Default)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: TaskNode) -> Result<(), GraphError> {
        if self.contains(node.id) {
            return Err(GraphError::DuplicateTask(node.id));
        }
        self.nodes.push(node);
        Ok(())
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check dependencies exist, there is no cycle, and no two tasks write
    /// overlapping paths.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in &self.nodes {
            for dependency in &node.depends_on {
                if !self.contains(*dependency) {
                    return Err(GraphError::UnknownDependency {
                        task: node.id,
                        dependency: *dependency,
                    });
                }
            }
        }

        self.topological_order()?;

        for (i, a) in self.nodes.iter().enumerate() {
            for b in &self.nodes[i + 1..] {
                for out_a in &a.outputs {
                    if let Some(out_b) = b.outputs.iter().find(|out_b| paths_overlap(out_a, out_b)) {
                        let path = if out_a.starts_with(out_b) { out_a } else { out_b };
                        return Err(GraphError::OverlappingOutputs {
                            first: a.id,
                            second: b.id,
                            path: path.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Kahn's algorithm; insertion order breaks ties.
    pub fn topological_order(&self) -> Result<Vec<TaskId>, GraphError> {
        let mut pending: HashMap<TaskId, usize> = self
            .nodes
            .iter()
            .map(|n| (n.id, n.depends_on.len()))
            .collect();
        let mut ready: VecDeque<TaskId> = self
            .nodes
            .iter()
            .filter(|n| n.depends_on.is_empty())
            .map(|n| n.id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_front() {
            order.push(id);
            for dependent in self.dependents(id) {
                if let Some(count) = pending.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            let stuck = self
                .nodes
                .iter()
                .map(|n| n.id)
                .find(|id| !order.contains(id));
            match stuck {
                Some(id) => Err(GraphError::Cycle(id)),
                None => Ok(order),
            }
        }
    }

    fn dependents(&self, id: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        self.nodes
            .iter()
            .filter(move |n| n.depends_on.contains(&id))
            .map(|n| n.id)
    }

    /// Run every task with at most `max_parallel` running at once.
    ///
    /// Returns one outcome per task. A panicking task is reported as failed.
    pub fn execute<F>(
        &self,
        max_parallel: usize,
        cancel: &CancelFlag,
        run: F,
    ) -> Result<BTreeMap<TaskId, TaskOutcome>, GraphError>
    where
        F: Fn(TaskId) -> Result<(), PipelineError> + Sync,
    {
        self.validate()?;

        let max_parallel = max_parallel.max(1);
        let mut pending: HashMap<TaskId, usize> = self
            .nodes
            .iter()
            .map(|n| (n.id, n.depends_on.len()))
            .collect();
        let mut ready: VecDeque<TaskId> = self
            .nodes
            .iter()
            .filter(|n| n.depends_on.is_empty())
            .map(|n| n.id)
            .collect();
        let mut outcomes: BTreeMap<TaskId, TaskOutcome> = BTreeMap::new();
        let run = &run;

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<(TaskId, Result<(), PipelineError>)>();
            let mut running = 0usize;

            loop {
                while running < max_parallel && !cancel.is_cancelled() {
                    let Some(id) = ready.pop_front() else {
                        break;
                    };
                    let tx = tx.clone();
                    scope.spawn(move || {
                        let span = tracing::info_span!("task", task = %id);
                        let _enter = span.enter();
                        log_task_started!(task = %id);
                        let result = catch_unwind(AssertUnwindSafe(|| run(id))).unwrap_or_else(
                            |_| {
                                Err(PipelineError::TaskPanicked {
                                    task: id.to_string(),
                                })
                            },
                        );
                        let _ = tx.send((id, result));
                    });
                    running += 1;
                }

                if running == 0 {
                    break;
                }
                let Ok((id, result)) = rx.recv() else {
                    break;
                };
                running -= 1;

                match result {
                    Ok(()) => {
                        outcomes.insert(id, TaskOutcome::Succeeded);
                        for dependent in self.dependents(id) {
                            if let Some(count) = pending.get_mut(&dependent) {
                                *count -= 1;
                                if *count == 0 {
                                    ready.push_back(dependent);
                                }
                            }
                        }
                    }
                    Err(error) => {
                        log_task_failed!(task = %id, error = %error);
                        outcomes.insert(id, TaskOutcome::Failed(error));
                        self.skip_downstream(id, &mut outcomes);
                    }
                }
            }
        });

        for node in &self.nodes {
            outcomes.entry(node.id).or_insert(TaskOutcome::Cancelled);
        }
        Ok(outcomes)
    }

    fn skip_downstream(&self, failed: TaskId, outcomes: &mut BTreeMap<TaskId, TaskOutcome>) {
        let mut queue: VecDeque<TaskId> = self.dependents(failed).collect();
        while let Some(id) = queue.pop_front() {
            if outcomes.contains_key(&id) {
                continue;
            }
            tracing::debug!(task = %id, blocked_by = %failed, "skipping task");
            outcomes.insert(id, TaskOutcome::Skipped { blocked_by: failed });
            queue.extend(self.dependents(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn id(stage: Stage, target: TargetKind) -> TaskId {
        TaskId::branch(stage, target)
    }

    fn two_branch_graph() -> TaskGraph {
        let load = TaskId::shared(Stage::LoadContract);
        let mut graph = TaskGraph::new();
        graph.add(TaskNode::new(load)).unwrap();
        for target in TargetKind::ALL {
            let generate = id(Stage::Generate, target);
            let compile = id(Stage::Compile, target);
            graph
                .add(
                    TaskNode::new(generate)
                        .after(load)
                        .writes(format!("/b/generated/{}", target)),
                )
                .unwrap();
            graph.add(TaskNode::new(compile).after(generate)).unwrap();
        }
        graph
    }

    fn io_error(message: &str) -> PipelineError {
        PipelineError::Io(std::io::Error::other(message.to_string()))
    }

    #[test]
    fn runs_dependencies_first() {
        let graph = two_branch_graph();
        let order = Mutex::new(Vec::new());

        let outcomes = graph
            .execute(2, &CancelFlag::new(), |task| {
                order.lock().push(task);
                Ok(())
            })
            .unwrap();

        assert!(outcomes.values().all(TaskOutcome::is_success));
        let order = order.into_inner();
        let pos = |t: TaskId| order.iter().position(|x| *x == t).unwrap();
        assert_eq!(pos(TaskId::shared(Stage::LoadContract)), 0);
        for target in TargetKind::ALL {
            assert!(pos(id(Stage::Generate, target)) < pos(id(Stage::Compile, target)));
        }
    }

    #[test]
    fn failure_skips_only_its_branch() {
        let graph = two_branch_graph();
        let ran = Mutex::new(Vec::new());

        let outcomes = graph
            .execute(2, &CancelFlag::new(), |task| {
                ran.lock().push(task);
                if task == id(Stage::Generate, TargetKind::Server) {
                    Err(io_error("generator crashed"))
                } else {
                    Ok(())
                }
            })
            .unwrap();

        assert!(matches!(
            outcomes[&id(Stage::Generate, TargetKind::Server)],
            TaskOutcome::Failed(_)
        ));
        assert!(matches!(
            outcomes[&id(Stage::Compile, TargetKind::Server)],
            TaskOutcome::Skipped { blocked_by } if blocked_by == id(Stage::Generate, TargetKind::Server)
        ));
        assert!(outcomes[&id(Stage::Compile, TargetKind::Client)].is_success());
        assert!(!ran.into_inner().contains(&id(Stage::Compile, TargetKind::Server)));
    }

    #[test]
    fn shared_failure_blocks_everything() {
        let graph = two_branch_graph();
        let outcomes = graph
            .execute(2, &CancelFlag::new(), |task| {
                if task.stage == Stage::LoadContract {
                    Err(io_error("gone"))
                } else {
                    Ok(())
                }
            })
            .unwrap();

        let skipped = outcomes
            .values()
            .filter(|o| matches!(o, TaskOutcome::Skipped { .. }))
            .count();
        assert_eq!(skipped, 4);
    }

    #[test]
    fn independent_branches_run_concurrently() {
        let graph = two_branch_graph();
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        graph
            .execute(2, &CancelFlag::new(), |task| {
                if task.stage == Stage::Generate {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(150));
                    running.fetch_sub(1, Ordering::SeqCst);
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn single_worker_runs_one_at_a_time() {
        let graph = two_branch_graph();
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        graph
            .execute(1, &CancelFlag::new(), |_| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancellation_stops_new_tasks() {
        let graph = two_branch_graph();
        let cancel = CancelFlag::new();

        let outcomes = graph
            .execute(1, &cancel, |task| {
                if task.stage == Stage::LoadContract {
                    cancel.cancel();
                }
                Ok(())
            })
            .unwrap();

        assert!(outcomes[&TaskId::shared(Stage::LoadContract)].is_success());
        let cancelled = outcomes
            .values()
            .filter(|o| matches!(o, TaskOutcome::Cancelled))
            .count();
        assert_eq!(cancelled, 4);
    }

    #[test]
    fn panicking_task_is_a_failure() {
        let mut graph = TaskGraph::new();
        let load = TaskId::shared(Stage::LoadContract);
        graph.add(TaskNode::new(load)).unwrap();

        let outcomes = graph
            .execute(1, &CancelFlag::new(), |_| panic!("engine bug"))
            .unwrap();
        assert!(matches!(
            &outcomes[&load],
            TaskOutcome::Failed(PipelineError::TaskPanicked { .. })
        ));
    }

    #[test]
    fn validation_rejects_bad_graphs() {
        let load = TaskId::shared(Stage::LoadContract);
        let gen_server = id(Stage::Generate, TargetKind::Server);
        let gen_client = id(Stage::Generate, TargetKind::Client);

        let mut graph = TaskGraph::new();
        graph.add(TaskNode::new(load)).unwrap();
        assert!(matches!(
            graph.add(TaskNode::new(load)),
            Err(GraphError::DuplicateTask(_))
        ));

        let mut unknown = TaskGraph::new();
        unknown.add(TaskNode::new(gen_server).after(load)).unwrap();
        assert!(matches!(
            unknown.validate(),
            Err(GraphError::UnknownDependency { .. })
        ));

        let mut cycle = TaskGraph::new();
        cycle.add(TaskNode::new(gen_server).after(gen_client)).unwrap();
        cycle.add(TaskNode::new(gen_client).after(gen_server)).unwrap();
        assert!(matches!(cycle.validate(), Err(GraphError::Cycle(_))));

        let mut overlap = TaskGraph::new();
        overlap.add(TaskNode::new(gen_server).writes("/b/generated")).unwrap();
        overlap
            .add(TaskNode::new(gen_client).writes("/b/generated/client"))
            .unwrap();
        let err = overlap.validate().unwrap_err();
        assert!(err.to_string().contains("/b/generated/client"));
    }

    #[test]
    fn task_ids_display() {
        assert_eq!(TaskId::shared(Stage::ResolveVersion).to_string(), "resolve_version");
        assert_eq!(id(Stage::Publish, TargetKind::Client).to_string(), "publish:client");
    }
}
