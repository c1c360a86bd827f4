use crate::bus::CommunicationBus;
use crate::config::OrchestratorConfig;
use crate::coordinator::TaskCoordinator;
use crate::directory::AgentDirectory;
use crate::engine::{ExecutionEngine, PlanReport};
use crate::events::{EventHub, OrchestratorEvent};
use crate::executor::{DefaultToolHints, TaskExecutor, ToolHints};
use crate::plan::PlanOptions;
use crate::types::{Agent, AgentMetadata, AgentStatus, TaskSpec};
use conductor_core::ConductorResult;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// One self-contained orchestration context.
///
/// Owns a directory, a bus, a coordinator, an engine and the event hub they
/// share. Agent registration goes through here so the bus mirror never
/// drifts from the directory. Several contexts can live in one process.
pub struct Orchestrator {
    config: OrchestratorConfig,
    events: EventHub,
    directory: Arc<AgentDirectory>,
    bus: Arc<CommunicationBus>,
    coordinator: TaskCoordinator,
    engine: ExecutionEngine,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build every component from `config` with the default tool hints.
    pub fn new(config: OrchestratorConfig, executor: Arc<dyn TaskExecutor>) -> ConductorResult<Self> {
        Self::with_hints(config, executor, Arc::new(DefaultToolHints))
    }

    /// Like [`Orchestrator::new`] with a caller-supplied hint table.
    pub fn with_hints(
        config: OrchestratorConfig,
        executor: Arc<dyn TaskExecutor>,
        hints: Arc<dyn ToolHints>,
    ) -> ConductorResult<Self> {
        config.validate()?;

        let events = EventHub::new(config.events.capacity);
        let directory = Arc::new(AgentDirectory::new(config.directory.clone(), events.clone()));
        let bus = Arc::new(CommunicationBus::new(events.clone()));
        let coordinator = TaskCoordinator::new(
            config.coordinator.clone(),
            Arc::clone(&directory),
            Arc::clone(&bus),
            events.clone(),
            Some(Arc::clone(&executor)),
            hints,
        );
        let engine = ExecutionEngine::new(
            config.engine.clone(),
            Arc::clone(&directory),
            Arc::clone(&bus),
            executor,
            events.clone(),
        );

        Ok(Self {
            config,
            events,
            directory,
            bus,
            coordinator,
            engine,
            background: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// The validated configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The shared event hub.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// The agent directory.
    pub fn directory(&self) -> &Arc<AgentDirectory> {
        &self.directory
    }

    /// The message bus.
    pub fn bus(&self) -> &Arc<CommunicationBus> {
        &self.bus
    }

    /// The task coordinator.
    pub fn coordinator(&self) -> &TaskCoordinator {
        &self.coordinator
    }

    /// The execution engine.
    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Register with the directory, then mirror into the bus.
    pub async fn register_agent(&self, metadata: AgentMetadata) -> ConductorResult<Agent> {
        let agent = self.directory.register(metadata).await?;
        self.bus.register_agent(&agent);
        Ok(agent)
    }

    /// Remove an agent everywhere; its in-flight coordinator tasks are requeued.
    pub async fn unregister_agent(&self, agent_id: &str) -> bool {
        let known = self.directory.unregister(agent_id).await;
        self.bus.unregister_agent(agent_id);
        if known {
            self.coordinator.handle_agent_offline(agent_id).await;
        }
        known
    }

    /// Refresh liveness in the directory and the bus mirror.
    pub async fn heartbeat(&self, agent_id: &str) -> bool {
        let known = self.directory.update_heartbeat(agent_id).await;
        if known {
            self.bus.update_heartbeat(agent_id);
        }
        known
    }

    /// Create and immediately run an execution plan.
    pub async fn run_plan(
        &self,
        name: impl Into<String>,
        specs: Vec<TaskSpec>,
        options: PlanOptions,
    ) -> ConductorResult<PlanReport> {
        let plan_id = self.engine.create_plan(name, specs, options).await?;
        self.engine.execute_plan(&plan_id).await
    }

    /// Spawn the health monitor, the queue loop and the offline fan-out.
    /// Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut background = self.background.lock();
        if !background.is_empty() {
            return;
        }

        // Subscribe before spawning so no offline event slips through.
        let mut rx = self.events.subscribe();
        let bus = Arc::clone(&self.bus);
        let coordinator = self.coordinator.clone();
        let fan_out = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(OrchestratorEvent::AgentOffline { agent_id }) => {
                        bus.set_status(&agent_id, AgentStatus::Offline);
                        let requeued = coordinator.handle_agent_offline(&agent_id).await;
                        if !requeued.is_empty() {
                            info!(agent_id = %agent_id, tasks = requeued.len(), "Reclaimed tasks from offline agent");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Offline listener lagged behind event stream");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        background.push(self.directory.spawn_health_monitor());
        background.push(self.coordinator.start());
        background.push(fan_out);
        info!("Orchestrator background loops started");
    }

    /// Whether [`Orchestrator::start`] spawned the background loops.
    pub fn is_running(&self) -> bool {
        !self.background.lock().is_empty()
    }

    /// Abort every background loop. In-flight dispatches are abandoned.
    pub fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            handle.abort();
        }
        info!("Orchestrator stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        for handle in self.background.get_mut().drain(..) {
            handle.abort();
        }
    }
}
