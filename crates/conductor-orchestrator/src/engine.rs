use crate::bus::CommunicationBus;
use crate::config::EngineConfig;
use crate::directory::{AgentDirectory, AgentQuery};
use crate::events::{EventHub, OrchestratorEvent};
use crate::executor::TaskExecutor;
use crate::plan::{ExecutionPlan, NodeStatus, PlanOptions, PlanStatus};
use crate::types::{Task, TaskSpec};
use chrono::Utc;
use conductor_core::{ConductorError, ConductorResult, Message};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of [`ExecutionEngine::execute_plan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReport {
    /// Plan id.
    pub plan_id: String,
    /// Display name.
    pub name: String,
    /// Final plan status.
    pub status: PlanStatus,
    /// Task ids in supplied order.
    pub completed: Vec<String>,
    /// Task ids that exhausted their retries.
    pub failed: Vec<String>,
    /// Tasks that never ran because the plan failed first.
    pub skipped: Vec<String>,
    /// Result value per completed task.
    pub results: HashMap<String, serde_json::Value>,
    /// Last error per task that saw one.
    pub errors: HashMap<String, String>,
    /// Why the plan failed, if it did.
    pub error: Option<String>,
    /// Wall-clock time from start to finish.
    pub elapsed_ms: u64,
}

impl PlanReport {
    /// Whether every node completed.
    pub fn succeeded(&self) -> bool {
        self.status == PlanStatus::Completed
    }

    fn from_plan(plan: &ExecutionPlan) -> Self {
        let mut report = Self {
            plan_id: plan.id.clone(),
            name: plan.name.clone(),
            status: plan.status,
            completed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            results: HashMap::new(),
            errors: HashMap::new(),
            error: plan.error.clone(),
            elapsed_ms: plan
                .elapsed()
                .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        };
        for id in &plan.order {
            let Some(node) = plan.node(id) else { continue };
            match node.status {
                NodeStatus::Completed => {
                    report.completed.push(id.clone());
                    if let Some(result) = &node.task.result {
                        report.results.insert(id.clone(), result.clone());
                    }
                }
                NodeStatus::Failed => report.failed.push(id.clone()),
                NodeStatus::Waiting | NodeStatus::Ready | NodeStatus::Executing => {
                    report.skipped.push(id.clone())
                }
            }
            if let Some(err) = &node.error {
                report.errors.insert(id.clone(), err.clone());
            }
        }
        report
    }
}

/// Aggregate counters over every plan the engine knows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    /// Plans ever created.
    pub total_plans: usize,
    /// Count per status.
    pub by_status: HashMap<PlanStatus, usize>,
    /// Plans currently inside [`ExecutionEngine::execute_plan`].
    pub executing: usize,
    /// Mean wall-clock time of completed plans.
    pub average_duration_ms: f64,
}

#[derive(Default)]
struct PlanTable {
    plans: HashMap<String, ExecutionPlan>,
    order: Vec<String>,
}

struct EngineInner {
    config: EngineConfig,
    directory: Arc<AgentDirectory>,
    bus: Arc<CommunicationBus>,
    executor: Arc<dyn TaskExecutor>,
    events: EventHub,
    table: RwLock<PlanTable>,
    limiter: Arc<Semaphore>,
    resume_gates: parking_lot::Mutex<HashMap<String, Arc<Notify>>>,
    executing: AtomicUsize,
}

/// Runs one-shot dependency plans group by group with bounded concurrency.
///
/// Every attempt on a node holds one permit of an engine-wide semaphore,
/// so at most `max_concurrent_tasks` nodes execute at once across all plans.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    /// Wire an engine whose limiter has `config.max_concurrent_tasks` permits.
    pub fn new(
        config: EngineConfig,
        directory: Arc<AgentDirectory>,
        bus: Arc<CommunicationBus>,
        executor: Arc<dyn TaskExecutor>,
        events: EventHub,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        Self {
            inner: Arc::new(EngineInner {
                config,
                directory,
                bus,
                executor,
                events,
                table: RwLock::new(PlanTable::default()),
                limiter,
                resume_gates: parking_lot::Mutex::new(HashMap::new()),
                executing: AtomicUsize::new(0),
            }),
        }
    }

    /// Validate and store a plan. Returns its id.
    ///
    /// A cyclic, duplicate or dangling graph fails here and stores nothing.
    pub async fn create_plan(
        &self,
        name: impl Into<String>,
        specs: Vec<TaskSpec>,
        options: PlanOptions,
    ) -> ConductorResult<String> {
        let name = name.into();
        let max_retries = options
            .max_retries
            .unwrap_or(self.inner.config.default_max_retries);
        let timeout = options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.inner.config.default_timeout());

        let plan = match ExecutionPlan::build(name.clone(), specs, max_retries, timeout) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(plan = %name, error = %e, "Rejected execution plan");
                return Err(e);
            }
        };

        let plan_id = plan.id.clone();
        let groups = plan.parallel_groups.len();
        info!(
            plan_id = %plan_id,
            plan = %name,
            tasks = plan.order.len(),
            groups,
            estimated_duration = plan.estimated_duration,
            "Execution plan created"
        );
        {
            let mut table = self.inner.table.write().await;
            table.order.push(plan_id.clone());
            table.plans.insert(plan_id.clone(), plan);
        }
        self.inner.events.publish(OrchestratorEvent::PlanCreated {
            plan_id: plan_id.clone(),
            groups,
        });
        Ok(plan_id)
    }

    /// Run a pending plan to completion or first permanent failure.
    pub async fn execute_plan(&self, plan_id: &str) -> ConductorResult<PlanReport> {
        let groups = {
            let mut table = self.inner.table.write().await;
            let plan = table
                .plans
                .get_mut(plan_id)
                .ok_or_else(|| ConductorError::NotFound(format!("plan '{plan_id}'")))?;
            if plan.status != PlanStatus::Pending {
                return Err(ConductorError::Validation(format!(
                    "plan '{plan_id}' is {:?}, expected pending",
                    plan.status
                )));
            }
            plan.status = PlanStatus::Executing;
            plan.started_at = Some(Utc::now());
            plan.parallel_groups.clone()
        };

        self.inner.executing.fetch_add(1, Ordering::SeqCst);
        info!(plan_id = %plan_id, groups = groups.len(), "Plan execution started");
        self.inner.events.publish(OrchestratorEvent::PlanStarted {
            plan_id: plan_id.to_string(),
        });

        let outcome = self.run_groups(plan_id, &groups).await;
        self.inner.executing.fetch_sub(1, Ordering::SeqCst);
        self.inner.resume_gates.lock().remove(plan_id);

        let report = {
            let mut table = self.inner.table.write().await;
            let plan = table
                .plans
                .get_mut(plan_id)
                .ok_or_else(|| ConductorError::NotFound(format!("plan '{plan_id}'")))?;
            match &outcome {
                Ok(()) => plan.status = PlanStatus::Completed,
                Err(e) => {
                    plan.status = PlanStatus::Failed;
                    if plan.error.is_none() {
                        plan.error = Some(e.to_string());
                    }
                }
            }
            plan.completed_at = Some(Utc::now());
            PlanReport::from_plan(plan)
        };

        match outcome {
            Ok(()) => {
                info!(plan_id = %plan_id, elapsed_ms = report.elapsed_ms, "Plan completed");
                self.inner.events.publish(OrchestratorEvent::PlanCompleted {
                    plan_id: plan_id.to_string(),
                });
            }
            Err(e) => {
                error!(plan_id = %plan_id, error = %e, "Plan failed");
                self.inner.events.publish(OrchestratorEvent::PlanFailed {
                    plan_id: plan_id.to_string(),
                    error: e.to_string(),
                });
            }
        }
        Ok(report)
    }

    async fn run_groups(&self, plan_id: &str, groups: &[Vec<String>]) -> ConductorResult<()> {
        for (index, group) in groups.iter().enumerate() {
            if index > 0 {
                self.wait_while_paused(plan_id).await;
            }
            debug!(plan_id = %plan_id, group = index, size = group.len(), "Launching group");

            let mut set: JoinSet<ConductorResult<()>> = JoinSet::new();
            let mut failure: Option<ConductorError> = None;
            for task_id in group {
                let permit = Arc::clone(&self.inner.limiter)
                    .acquire_owned()
                    .await
                    .map_err(|_| ConductorError::Validation("engine limiter closed".into()))?;
                if self.plan_status(plan_id).await == Some(PlanStatus::Failed) {
                    break;
                }
                self.set_node_status(plan_id, task_id, NodeStatus::Ready).await;
                let engine = self.clone();
                let (owned_plan, owned_task) = (plan_id.to_string(), task_id.clone());
                set.spawn(async move { engine.run_node(&owned_plan, &owned_task, permit).await });
            }

            // Hard barrier: every launched sibling finishes before moving on.
            while let Some(joined) = set.join_next().await {
                let result = joined.unwrap_or_else(|e| {
                    Err(ConductorError::Executor(format!("node task aborted: {e}")))
                });
                if let Err(e) = result {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }

            if let Some(e) = failure {
                return Err(e);
            }
            if self.plan_status(plan_id).await == Some(PlanStatus::Failed) {
                return Err(ConductorError::Validation(format!(
                    "plan '{plan_id}' failed during group {index}"
                )));
            }
        }
        Ok(())
    }

    /// Execute one node with retries while holding `permit`.
    async fn run_node(
        &self,
        plan_id: &str,
        task_id: &str,
        permit: OwnedSemaphorePermit,
    ) -> ConductorResult<()> {
        let _permit = permit;
        let (task, max_retries, timeout) = {
            let table = self.inner.table.read().await;
            let plan = table
                .plans
                .get(plan_id)
                .ok_or_else(|| ConductorError::NotFound(format!("plan '{plan_id}'")))?;
            let node = plan
                .node(task_id)
                .ok_or_else(|| ConductorError::NotFound(format!("task '{task_id}'")))?;
            (node.task.clone(), node.max_retries, plan.timeout())
        };

        let attempts = max_retries.saturating_add(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            self.update_node(plan_id, task_id, |node| {
                node.status = NodeStatus::Executing;
                node.retry_count = attempt - 1;
                if node.started_at.is_none() {
                    node.started_at = Some(Utc::now());
                }
            })
            .await;

            match self.attempt(plan_id, &task, timeout).await {
                Ok((agent_id, value)) => {
                    self.update_node(plan_id, task_id, |node| {
                        node.status = NodeStatus::Completed;
                        node.agent_id = Some(agent_id.clone());
                        node.task.result = Some(value);
                        node.error = None;
                        node.completed_at = Some(Utc::now());
                    })
                    .await;
                    info!(plan_id = %plan_id, task_id = %task_id, agent_id = %agent_id, attempt, "Node completed");
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < attempts {
                        warn!(plan_id = %plan_id, task_id = %task_id, attempt, error = %e, "Node attempt failed, retrying");
                        self.update_node(plan_id, task_id, |node| {
                            node.status = NodeStatus::Ready;
                            node.error = Some(last_error.clone());
                        })
                        .await;
                        self.inner.events.publish(OrchestratorEvent::NodeRetrying {
                            plan_id: plan_id.to_string(),
                            task_id: task_id.to_string(),
                            attempt: attempt + 1,
                        });
                        tokio::time::sleep(self.inner.config.retry_delay()).await;
                    }
                }
            }
        }

        let err = ConductorError::RetryExhausted {
            task_id: task_id.to_string(),
            attempts,
            last_error,
        };
        error!(plan_id = %plan_id, task_id = %task_id, attempts, error = %err, "Node failed permanently");
        let message = err.to_string();
        {
            let mut table = self.inner.table.write().await;
            if let Some(plan) = table.plans.get_mut(plan_id) {
                if let Some(node) = plan.nodes.get_mut(task_id) {
                    node.status = NodeStatus::Failed;
                    node.error = Some(message.clone());
                    node.completed_at = Some(Utc::now());
                }
                if !plan.status.is_finished() {
                    plan.status = PlanStatus::Failed;
                    plan.error = Some(message);
                }
            }
        }
        // A failure while paused must not leave the runner parked.
        self.wake(plan_id);
        Err(err)
    }

    /// One dispatch: pick an agent, notify it over the bus, await the executor.
    async fn attempt(
        &self,
        plan_id: &str,
        task: &Task,
        timeout: Duration,
    ) -> ConductorResult<(String, serde_json::Value)> {
        let (agent, _) = self
            .inner
            .directory
            .reserve(&task.required_capabilities, &AgentQuery::new())
            .await
            .ok_or_else(|| {
                ConductorError::Capacity(format!("no available agent for task '{}'", task.id))
            })?;

        self.inner.bus.update_task_count(&agent.id, agent.current_tasks);
        self.update_node(plan_id, &task.id, |node| {
            node.agent_id = Some(agent.id.clone());
        })
        .await;

        let dispatch_id = Uuid::new_v4().to_string();
        let request = Message::request(
            self.inner.config.dispatcher_id.clone(),
            agent.id.clone(),
            serde_json::json!({
                "plan_id": plan_id,
                "dispatch_id": dispatch_id,
                "task": task,
            }),
        )
        .with_priority(task.priority)
        .with_correlation_id(dispatch_id);
        if !self.inner.bus.send(request) {
            debug!(task_id = %task.id, agent_id = %agent.id, "Agent has no bus mailbox");
        }

        let outcome = tokio::time::timeout(timeout, self.inner.executor.execute(task, &agent)).await;
        self.shift_load(&agent.id, -1).await;

        match outcome {
            Ok(Ok(value)) => Ok((agent.id, value)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConductorError::Timeout {
                task_id: task.id.clone(),
                after: timeout,
            }),
        }
    }

    async fn shift_load(&self, agent_id: &str, delta: i64) {
        if let Some(count) = self.inner.directory.adjust_task_count(agent_id, delta).await {
            self.inner.bus.update_task_count(agent_id, count);
        }
    }

    /// Ask a running plan to stop before its next group.
    pub async fn pause_plan(&self, plan_id: &str) -> ConductorResult<()> {
        let mut table = self.inner.table.write().await;
        let plan = table
            .plans
            .get_mut(plan_id)
            .ok_or_else(|| ConductorError::NotFound(format!("plan '{plan_id}'")))?;
        match plan.status {
            PlanStatus::Executing => {
                plan.status = PlanStatus::Paused;
                info!(plan_id = %plan_id, "Plan paused");
                Ok(())
            }
            PlanStatus::Paused => Ok(()),
            other => Err(ConductorError::Validation(format!(
                "cannot pause plan '{plan_id}' in state {other:?}"
            ))),
        }
    }

    /// Wake a paused plan so its next group starts.
    pub async fn resume_plan(&self, plan_id: &str) -> ConductorResult<()> {
        {
            let mut table = self.inner.table.write().await;
            let plan = table
                .plans
                .get_mut(plan_id)
                .ok_or_else(|| ConductorError::NotFound(format!("plan '{plan_id}'")))?;
            match plan.status {
                PlanStatus::Paused => plan.status = PlanStatus::Executing,
                PlanStatus::Executing => return Ok(()),
                other => {
                    return Err(ConductorError::Validation(format!(
                        "cannot resume plan '{plan_id}' in state {other:?}"
                    )))
                }
            }
        }
        info!(plan_id = %plan_id, "Plan resumed");
        self.wake(plan_id);
        Ok(())
    }

    async fn wait_while_paused(&self, plan_id: &str) {
        let gate = Arc::clone(
            self.inner
                .resume_gates
                .lock()
                .entry(plan_id.to_string())
                .or_default(),
        );
        let mut logged = false;
        loop {
            // Register interest before checking, so a resume in between is not lost.
            let notified = gate.notified();
            if self.plan_status(plan_id).await != Some(PlanStatus::Paused) {
                return;
            }
            if !logged {
                info!(plan_id = %plan_id, "Plan waiting for resume");
                logged = true;
            }
            notified.await;
        }
    }

    fn wake(&self, plan_id: &str) {
        if let Some(gate) = self.inner.resume_gates.lock().get(plan_id) {
            gate.notify_waiters();
        }
    }

    async fn plan_status(&self, plan_id: &str) -> Option<PlanStatus> {
        self.inner
            .table
            .read()
            .await
            .plans
            .get(plan_id)
            .map(|p| p.status)
    }

    async fn set_node_status(&self, plan_id: &str, task_id: &str, status: NodeStatus) {
        self.update_node(plan_id, task_id, |node| node.status = status)
            .await;
    }

    async fn update_node<F>(&self, plan_id: &str, task_id: &str, apply: F)
    where
        F: FnOnce(&mut crate::plan::ExecutionNode),
    {
        let mut table = self.inner.table.write().await;
        if let Some(node) = table
            .plans
            .get_mut(plan_id)
            .and_then(|p| p.nodes.get_mut(task_id))
        {
            apply(node);
        }
    }

    /// Snapshot of a plan.
    pub async fn get_plan(&self, plan_id: &str) -> Option<ExecutionPlan> {
        self.inner.table.read().await.plans.get(plan_id).cloned()
    }

    /// Every plan in creation order.
    pub async fn list_plans(&self) -> Vec<ExecutionPlan> {
        let table = self.inner.table.read().await;
        table
            .order
            .iter()
            .filter_map(|id| table.plans.get(id).cloned())
            .collect()
    }

    /// Counters over every plan, with the mean duration of completed ones.
    pub async fn statistics(&self) -> EngineStats {
        let table = self.inner.table.read().await;
        let mut stats = EngineStats {
            total_plans: table.plans.len(),
            executing: self.inner.executing.load(Ordering::SeqCst),
            ..EngineStats::default()
        };
        let mut finished_ms = Vec::new();
        for plan in table.plans.values() {
            *stats.by_status.entry(plan.status).or_default() += 1;
            if plan.status == PlanStatus::Completed {
                if let Some(elapsed) = plan.elapsed() {
                    finished_ms.push(elapsed.as_secs_f64() * 1000.0);
                }
            }
        }
        if !finished_ms.is_empty() {
            stats.average_duration_ms = finished_ms.iter().sum::<f64>() / finished_ms.len() as f64;
        }
        stats
    }
}
