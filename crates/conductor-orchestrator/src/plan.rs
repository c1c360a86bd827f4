//! Execution plans: a one-shot batch of tasks with an explicit dependency
//! graph, partitioned into parallel groups.

use crate::types::{Task, TaskSpec};
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Lifecycle of a node inside a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Some dependency has not completed.
    Waiting,
    /// Dependencies completed; waiting for its group.
    Ready,
    /// An attempt is running.
    Executing,
    /// Finished successfully.
    Completed,
    /// Retries exhausted.
    Failed,
}

/// A task plus its position in the plan graph and retry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionNode {
    /// The task being run.
    pub task: Task,
    /// Ids this node waits on.
    pub dependencies: Vec<String>,
    /// Ids that wait on this node.
    pub dependents: Vec<String>,
    /// Current status.
    pub status: NodeStatus,
    /// Retries consumed so far (attempts minus one).
    pub retry_count: u32,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Last attempt's error.
    pub error: Option<String>,
    /// Agent of the latest attempt.
    pub agent_id: Option<String>,
    /// Start of the first attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal state was reached.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Lifecycle of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Created, not started.
    Pending,
    /// Groups are running.
    Executing,
    /// Every node completed.
    Completed,
    /// Stopped on a failed node.
    Failed,
    /// Waiting for a resume before its next group.
    Paused,
}

impl PlanStatus {
    /// Completed or failed.
    pub fn is_finished(self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Failed)
    }
}

/// Per-plan overrides of the engine defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanOptions {
    /// Retry budget per node.
    pub max_retries: Option<u32>,
    /// Per-attempt timeout.
    pub timeout_ms: Option<u64>,
}

impl PlanOptions {
    /// No override.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Override the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

/// A validated task graph with its run state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Nodes keyed by task id.
    pub nodes: HashMap<String, ExecutionNode>,
    /// Task ids in the order they were supplied.
    pub order: Vec<String>,
    /// Dependency levels; each group runs after the previous one.
    pub parallel_groups: Vec<Vec<String>>,
    /// Longest chain by estimated duration.
    pub critical_path: Vec<String>,
    /// Seconds along the critical path.
    pub estimated_duration: u64,
    /// Current status.
    pub status: PlanStatus,
    /// Per-attempt dispatch timeout.
    pub timeout_ms: u64,
    /// Why the plan failed, if it did.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Start of the first attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal state was reached.
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionPlan {
    /// Build and analyse a plan. Nothing is returned unless the graph is
    /// well formed: ids unique, every dependency known, no cycle.
    pub fn build(
        name: impl Into<String>,
        specs: Vec<TaskSpec>,
        max_retries: u32,
        timeout: Duration,
    ) -> ConductorResult<Self> {
        let name = name.into();
        if specs.is_empty() {
            return Err(ConductorError::Validation(format!(
                "plan '{name}' has no tasks"
            )));
        }

        let mut nodes: HashMap<String, ExecutionNode> = HashMap::with_capacity(specs.len());
        let mut order = Vec::with_capacity(specs.len());
        for spec in specs {
            let task = Task::from_spec(spec);
            if nodes.contains_key(&task.id) {
                return Err(ConductorError::Duplicate(format!(
                    "task '{}' appears twice in plan '{name}'",
                    task.id
                )));
            }
            order.push(task.id.clone());
            nodes.insert(
                task.id.clone(),
                ExecutionNode {
                    dependencies: task.dependencies.clone(),
                    task,
                    dependents: Vec::new(),
                    status: NodeStatus::Waiting,
                    retry_count: 0,
                    max_retries,
                    error: None,
                    agent_id: None,
                    started_at: None,
                    completed_at: None,
                },
            );
        }

        for id in &order {
            let deps = nodes
                .get(id)
                .map(|n| n.dependencies.clone())
                .unwrap_or_default();
            for dep in deps {
                match nodes.get_mut(&dep) {
                    Some(parent) => parent.dependents.push(id.clone()),
                    None => {
                        return Err(ConductorError::Validation(format!(
                            "task '{id}' depends on unknown task '{dep}'"
                        )))
                    }
                }
            }
        }

        let parallel_groups = compute_parallel_groups(&order, &nodes)?;
        let (critical_path, estimated_duration) =
            compute_critical_path(&parallel_groups, &nodes);

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            nodes,
            order,
            parallel_groups,
            critical_path,
            estimated_duration,
            status: PlanStatus::Pending,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        })
    }

    /// Per-attempt timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Node for `task_id`.
    pub fn node(&self, task_id: &str) -> Option<&ExecutionNode> {
        self.nodes.get(task_id)
    }

    /// Index of the parallel group holding `task_id`.
    pub fn group_index_of(&self, task_id: &str) -> Option<usize> {
        self.parallel_groups
            .iter()
            .position(|group| group.iter().any(|id| id == task_id))
    }

    /// Nodes currently in `status`.
    pub fn count_nodes(&self, status: NodeStatus) -> usize {
        self.nodes.values().filter(|n| n.status == status).count()
    }

    /// Wall-clock time between start and completion, once both are known.
    pub fn elapsed(&self) -> Option<Duration> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        completed.signed_duration_since(started).to_std().ok()
    }
}

/// Partition nodes into rounds: a node joins the first round in which all
/// its dependencies were placed in earlier rounds. Group members keep the
/// supplied task order.
fn compute_parallel_groups(
    order: &[String],
    nodes: &HashMap<String, ExecutionNode>,
) -> ConductorResult<Vec<Vec<String>>> {
    let mut placed: HashSet<&str> = HashSet::with_capacity(order.len());
    let mut groups = Vec::new();

    while placed.len() < order.len() {
        let round: Vec<String> = order
            .iter()
            .filter(|id| !placed.contains(id.as_str()))
            .filter(|id| {
                nodes.get(*id).is_some_and(|n| {
                    n.dependencies.iter().all(|d| placed.contains(d.as_str()))
                })
            })
            .cloned()
            .collect();

        if round.is_empty() {
            let stuck: Vec<String> = order
                .iter()
                .filter(|id| !placed.contains(id.as_str()))
                .cloned()
                .collect();
            return Err(ConductorError::CyclicDependency(stuck));
        }

        for id in &round {
            if let Some((key, _)) = nodes.get_key_value(id) {
                placed.insert(key.as_str());
            }
        }
        groups.push(round);
    }

    Ok(groups)
}

/// Longest duration-weighted chain, walked back from its heaviest end along
/// the heaviest dependency at each step.
fn compute_critical_path(
    groups: &[Vec<String>],
    nodes: &HashMap<String, ExecutionNode>,
) -> (Vec<String>, u64) {
    let mut cumulative: HashMap<&str, u64> = HashMap::with_capacity(nodes.len());
    let mut heaviest: Option<(&str, u64)> = None;

    for id in groups.iter().flatten() {
        let Some((key, node)) = nodes.get_key_value(id) else {
            continue;
        };
        let upstream = node
            .dependencies
            .iter()
            .filter_map(|d| cumulative.get(d.as_str()).copied())
            .max()
            .unwrap_or(0);
        let total = upstream.saturating_add(node.task.estimated_duration);
        cumulative.insert(key.as_str(), total);
        if heaviest.map_or(true, |(_, best)| total > best) {
            heaviest = Some((key.as_str(), total));
        }
    }

    let Some((end, total)) = heaviest else {
        return (Vec::new(), 0);
    };

    let mut path = vec![end.to_string()];
    let mut current = end;
    loop {
        let Some(node) = nodes.get(current) else {
            break;
        };
        let mut next: Option<(&str, u64)> = None;
        for dep in &node.dependencies {
            if let Some((key, value)) = cumulative.get_key_value(dep.as_str()) {
                if next.map_or(true, |(_, best)| *value > best) {
                    next = Some((*key, *value));
                }
            }
        }
        match next {
            Some((dep, _)) => {
                path.push(dep.to_string());
                current = dep;
            }
            None => break,
        }
    }
    path.reverse();

    (path, total)
}
