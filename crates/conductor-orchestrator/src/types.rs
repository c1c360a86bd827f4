use chrono::{DateTime, Utc};
use conductor_core::Priority;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Estimated task duration in seconds when a spec leaves it out.
pub const DEFAULT_ESTIMATED_DURATION_SECS: u64 = 60;

/// Closed set of agent kinds known to the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// Plans and delegates; always preferred when it can take the work.
    Coordinator,
    /// Performs domain work (documents, calendars, messaging...).
    Specialist,
    /// Relays work to an external platform.
    Bridge,
    /// Observes other agents.
    Monitor,
    /// Cleans up after failures.
    Recovery,
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentType::Coordinator => write!(f, "coordinator"),
            AgentType::Specialist => write!(f, "specialist"),
            AgentType::Bridge => write!(f, "bridge"),
            AgentType::Monitor => write!(f, "monitor"),
            AgentType::Recovery => write!(f, "recovery"),
        }
    }
}

/// Liveness and load state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Registered with spare capacity.
    Idle,
    /// At its concurrency ceiling.
    Busy,
    /// Heartbeat went stale.
    Offline,
    /// Reported a fault.
    Error,
}

/// A named unit of work an agent can perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Unique name matched against task requirements.
    pub name: String,
    /// Human-readable summary.
    #[serde(default)]
    pub description: String,
    /// Grouping label such as `documents`.
    #[serde(default)]
    pub category: String,
    /// JSON schema of accepted input.
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
    /// JSON schema of produced output.
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
}

impl Capability {
    /// A capability with no description or schema.
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            category: category.into(),
            input_schema: None,
            output_schema: None,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// What an agent source supplies on registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetadata {
    /// Unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Agent kind.
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    /// Declared capabilities.
    pub capabilities: Vec<Capability>,
    /// Tasks the agent accepts at once.
    pub max_concurrent_tasks: u32,
    /// Agent version string.
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

impl AgentMetadata {
    /// Metadata with no capability and a concurrency of one.
    pub fn new(id: impl Into<String>, name: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            agent_type,
            capabilities: Vec::new(),
            max_concurrent_tasks: 1,
            version: default_version(),
        }
    }

    /// Add one capability.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Set the concurrency ceiling.
    pub fn with_max_concurrent_tasks(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = max;
        self
    }
}

/// A registered agent as held by the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Agent version string.
    pub version: String,
    /// Agent kind.
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    /// Declared capabilities.
    pub capabilities: Vec<Capability>,
    /// Liveness and load state.
    pub status: AgentStatus,
    /// Concurrency ceiling.
    pub max_concurrent_tasks: u32,
    /// Tasks currently assigned to the agent.
    pub current_tasks: u32,
    /// Time of the last heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// Registration time.
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    /// Build a fresh idle agent from its registration metadata.
    pub fn from_metadata(metadata: AgentMetadata, now: DateTime<Utc>) -> Self {
        Self {
            id: metadata.id,
            name: metadata.name,
            version: metadata.version,
            agent_type: metadata.agent_type,
            capabilities: metadata.capabilities,
            status: AgentStatus::Idle,
            max_concurrent_tasks: metadata.max_concurrent_tasks,
            current_tasks: 0,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    /// `current_tasks / max_concurrent_tasks`.
    pub fn load_ratio(&self) -> f64 {
        if self.max_concurrent_tasks == 0 {
            return 1.0;
        }
        f64::from(self.current_tasks) / f64::from(self.max_concurrent_tasks)
    }

    /// Whether one more task fits under the ceiling.
    pub fn has_capacity(&self) -> bool {
        self.current_tasks < self.max_concurrent_tasks
    }

    /// Whether a capability named `name` is declared.
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }

    /// Whether this is a coordinator agent.
    pub fn is_coordinator(&self) -> bool {
        self.agent_type == AgentType::Coordinator
    }

    /// Whether the agent is offline.
    pub fn is_offline(&self) -> bool {
        self.status == AgentStatus::Offline
    }
}

/// Structural shape of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// A single unit of work.
    #[default]
    Simple,
    /// Work that may be split further.
    Complex,
    /// Work whose parts run concurrently.
    Parallel,
    /// Work whose parts run in order.
    Sequential,
}

/// Status of a task in the coordinator queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies or an agent.
    Pending,
    /// Dispatched, not yet acknowledged.
    Assigned,
    /// Acknowledged by its agent.
    InProgress,
    /// Finished with a result.
    Completed,
    /// Attempts exhausted or rejected for good.
    Failed,
    /// Stopped because of an upstream failure or a caller request.
    Cancelled,
}

impl TaskStatus {
    /// Completed, failed or cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Caller-facing description of a task; every field but `name` is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Caller-chosen id. A UUID is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Display name.
    pub name: String,
    /// Structural shape.
    #[serde(default, rename = "type")]
    pub kind: TaskKind,
    /// Dispatch urgency.
    #[serde(default)]
    pub priority: Priority,
    /// Any one of these qualifies an agent.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Ids of tasks that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Seconds.
    #[serde(default)]
    pub estimated_duration: Option<u64>,
    /// Free-form input handed to the executor.
    #[serde(default)]
    pub context: serde_json::Value,
}

impl TaskSpec {
    /// A spec with only a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Use a caller-chosen id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Add one capability.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    /// Replace the dependency list.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Estimated duration in seconds.
    pub fn with_duration(mut self, seconds: u64) -> Self {
        self.estimated_duration = Some(seconds);
        self
    }

    /// Set the executor input.
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// A task tracked by the coordinator or carried by an execution node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Structural shape.
    pub kind: TaskKind,
    /// Dispatch urgency.
    pub priority: Priority,
    /// Any one of these qualifies an agent.
    pub required_capabilities: Vec<String>,
    /// Deduplicated, in supplied order.
    pub dependencies: Vec<String>,
    /// Seconds.
    pub estimated_duration: u64,
    /// Free-form input handed to the executor.
    pub context: serde_json::Value,
    /// Queue status.
    pub status: TaskStatus,
    /// Agent holding the current dispatch.
    pub assigned_agent: Option<String>,
    /// Result value once completed.
    pub result: Option<serde_json::Value>,
    /// Last failure or requeue note.
    pub error: Option<String>,
    /// Dispatch attempts made so far.
    pub attempts: u32,
    /// Owning workflow, if any.
    pub workflow_id: Option<String>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// When the agent acknowledged the task.
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal state was reached.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A pending task with a generated id.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_spec(TaskSpec::new(name))
    }

    /// Materialize a spec, filling in the id and duration defaults.
    pub fn from_spec(spec: TaskSpec) -> Self {
        let mut dependencies: Vec<String> = Vec::with_capacity(spec.dependencies.len());
        for dep in spec.dependencies {
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }
        Self {
            id: spec.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: spec.name,
            kind: spec.kind,
            priority: spec.priority,
            required_capabilities: spec.required_capabilities,
            dependencies,
            estimated_duration: spec
                .estimated_duration
                .unwrap_or(DEFAULT_ESTIMATED_DURATION_SECS),
            context: spec.context,
            status: TaskStatus::Pending,
            assigned_agent: None,
            result: None,
            error: None,
            attempts: 0,
            workflow_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Pending with every dependency in `completed_ids`.
    pub fn is_ready(&self, completed_ids: &HashSet<String>) -> bool {
        self.status == TaskStatus::Pending
            && self
                .dependencies
                .iter()
                .all(|dep| completed_ids.contains(dep))
    }
}

/// Lifecycle of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// No member task dispatched yet.
    Pending,
    /// At least one member task dispatched.
    InProgress,
    /// Every member completed.
    Completed,
    /// Some member failed or was cancelled.
    Failed,
    /// Member tasks are held back from dispatch.
    Paused,
}

/// A named group of coordinator tasks tracked to joint completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Member task ids in submission order.
    pub task_ids: Vec<String>,
    /// Lifecycle state.
    pub status: WorkflowStatus,
    /// Member tasks that reached a terminal state.
    pub current_step: usize,
    /// Number of member tasks.
    pub total_steps: usize,
    /// Free-form input handed to the executor.
    pub context: serde_json::Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When a terminal state was reached.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// A pending workflow over `task_ids` with a generated id.
    pub fn new(name: impl Into<String>, task_ids: Vec<String>, context: serde_json::Value) -> Self {
        let total_steps = task_ids.len();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            task_ids,
            status: WorkflowStatus::Pending,
            current_step: 0,
            total_steps,
            context,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Completed or failed.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            WorkflowStatus::Completed | WorkflowStatus::Failed
        )
    }
}
