//! Multi-agent orchestration: agent directory, message bus, task
//! coordinator and dependency-graph execution engine.
//!
//! Agents register with an [`AgentDirectory`] and are mirrored into a
//! [`CommunicationBus`]. Long-running work flows through the
//! [`TaskCoordinator`]; one-shot batches with explicit dependencies run on
//! the [`ExecutionEngine`] in parallel groups under a concurrency limit.
//! An [`Orchestrator`] wires one of each together around a shared
//! [`EventHub`].
//!
//! # Main types
//!
//! - [`Orchestrator`]: Context owning every component and its background loops.
//! - [`AgentDirectory`]: Registry with capability and type indices plus health checks.
//! - [`CommunicationBus`]: Per-agent mailboxes and capability broadcast.
//! - [`TaskCoordinator`]: Priority queue of tasks and workflows with retries.
//! - [`ExecutionEngine`]: DAG plans, parallel groups and critical path.
//! - [`TaskExecutor`]: Seam through which work actually reaches an agent.

/// Point-to-point and broadcast messaging.
pub mod bus;
/// TOML-backed settings for every component.
pub mod config;
/// The orchestration context.
pub mod context;
/// Continuous task and workflow dispatch.
pub mod coordinator;
/// Agent registry and health tracking.
pub mod directory;
/// Plan execution with bounded concurrency.
pub mod engine;
/// Event stream shared by all components.
pub mod events;
/// Execution and tool-hint seams.
pub mod executor;
/// Plan graph analysis.
pub mod plan;
/// Dependency-aware task store.
pub mod task_queue;
/// Agents, tasks and workflows.
pub mod types;

pub use bus::{BusAgent, CommunicationBus};
pub use config::{CoordinatorConfig, DirectoryConfig, EngineConfig, EventsConfig, OrchestratorConfig};
pub use context::Orchestrator;
pub use coordinator::{CoordinatorStats, TaskCoordinator};
pub use directory::{AgentDirectory, AgentQuery, DirectoryStats};
pub use engine::{EngineStats, ExecutionEngine, PlanReport};
pub use events::{EventHub, OrchestratorEvent};
pub use executor::{DefaultToolHints, TaskExecutor, ToolHints};
pub use plan::{ExecutionNode, ExecutionPlan, NodeStatus, PlanOptions, PlanStatus};
pub use task_queue::TaskQueue;
pub use types::{
    Agent, AgentMetadata, AgentStatus, AgentType, Capability, Task, TaskKind, TaskSpec,
    TaskStatus, Workflow, WorkflowStatus,
};
