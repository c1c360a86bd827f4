use crate::bus::CommunicationBus;
use crate::config::CoordinatorConfig;
use crate::directory::{AgentDirectory, AgentQuery};
use crate::events::{EventHub, OrchestratorEvent};
use crate::executor::{TaskExecutor, ToolHints};
use crate::task_queue::TaskQueue;
use crate::types::{Agent, Task, TaskSpec, TaskStatus, Workflow, WorkflowStatus};
use chrono::Utc;
use conductor_core::{ConductorError, ConductorResult, Message};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Aggregate counters over the coordinator's tasks and workflows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorStats {
    /// Tasks ever submitted.
    pub total_tasks: usize,
    /// Task count per status.
    pub tasks_by_status: HashMap<TaskStatus, usize>,
    /// Workflows ever created.
    pub total_workflows: usize,
    /// Workflow count per status.
    pub workflows_by_status: HashMap<WorkflowStatus, usize>,
    /// Dispatches currently waiting on a result.
    pub in_flight: usize,
}

#[derive(Default)]
struct CoordinatorState {
    queue: TaskQueue,
    workflows: HashMap<String, Workflow>,
    workflow_order: Vec<String>,
    /// Current dispatch id per active task. Results for older dispatches are stale.
    dispatches: HashMap<String, String>,
    /// Earliest instant a requeued task may be dispatched again.
    retry_after: HashMap<String, Instant>,
}

impl CoordinatorState {
    fn workflow_paused(&self, task: &Task) -> bool {
        task.workflow_id
            .as_ref()
            .and_then(|id| self.workflows.get(id))
            .is_some_and(|w| w.status == WorkflowStatus::Paused)
    }

    /// Accept a report only from the agent currently holding the task.
    fn holds(&self, task_id: &str, agent_id: &str) -> bool {
        self.queue.get(task_id).is_some_and(|t| {
            matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress)
                && t.assigned_agent.as_deref() == Some(agent_id)
        })
    }

    /// Like [`Self::holds`], and when `dispatch_id` is given it must be the
    /// task's current dispatch.
    fn reports_current(&self, task_id: &str, agent_id: &str, dispatch_id: Option<&str>) -> bool {
        self.holds(task_id, agent_id)
            && dispatch_id.map_or(true, |id| {
                self.dispatches.get(task_id).is_some_and(|current| current == id)
            })
    }

    /// Ready, out of its retry delay, and not held back by a paused workflow.
    fn dispatchable(&self, task_id: &str, now: Instant) -> bool {
        self.queue.is_ready(task_id)
            && self.retry_after.get(task_id).map_or(true, |at| *at <= now)
            && self
                .queue
                .get(task_id)
                .is_some_and(|t| !self.workflow_paused(t))
    }

    /// Cancel every transitive dependent of `root`. Returns the cancelled ids.
    fn cascade_cancel(&mut self, root: &str) -> Vec<String> {
        let mut cancelled = Vec::new();
        let mut frontier = vec![root.to_string()];
        while let Some(id) = frontier.pop() {
            for dependent in self.queue.dependents_of(&id) {
                let reason = format!("dependency '{id}' did not complete");
                if self.queue.mark_cancelled(&dependent, reason) {
                    self.retry_after.remove(&dependent);
                    frontier.push(dependent.clone());
                    cancelled.push(dependent);
                }
            }
        }
        cancelled
    }

    /// Refresh progress of the workflow owning `task_id`.
    /// Returns `(workflow_id, success)` when this call finished it.
    fn advance_workflow(&mut self, task_id: &str) -> Option<(String, bool)> {
        let workflow_id = self.queue.get(task_id)?.workflow_id.clone()?;
        let queue = &self.queue;
        let workflow = self.workflows.get_mut(&workflow_id)?;
        if workflow.is_finished() {
            return None;
        }

        let members: Vec<&Task> = workflow
            .task_ids
            .iter()
            .filter_map(|id| queue.get(id))
            .collect();
        let terminal = members.iter().filter(|t| t.status.is_terminal()).count();
        workflow.current_step = terminal;
        if terminal < workflow.total_steps {
            return None;
        }

        let success = members.iter().all(|t| t.status == TaskStatus::Completed);
        workflow.status = if success {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };
        workflow.completed_at = Some(Utc::now());
        Some((workflow_id, success))
    }
}

/// What a terminal or retry transition needs to announce after the lock drops.
#[derive(Default)]
struct Outcome {
    finished_workflows: Vec<(String, bool)>,
    cancelled: Vec<String>,
}

struct CoordinatorInner {
    config: CoordinatorConfig,
    directory: Arc<AgentDirectory>,
    bus: Arc<CommunicationBus>,
    events: EventHub,
    executor: Option<Arc<dyn TaskExecutor>>,
    hints: Arc<dyn ToolHints>,
    state: RwLock<CoordinatorState>,
    /// Timeout guard per dispatched task, tagged with its dispatch id.
    timers: parking_lot::Mutex<HashMap<String, (String, JoinHandle<()>)>>,
    /// Serializes queue passes so overlapping ticks do not interleave offers.
    pass: Mutex<()>,
}

/// Long-running task queue with workflow tracking.
///
/// Tasks move `pending → assigned → in_progress → completed | failed |
/// cancelled`. Dispatch picks an agent through the [`AgentDirectory`], sends
/// a request over the [`CommunicationBus`], arms a timeout and, when an
/// executor is attached, drives the work itself. Failures are retried up to
/// `max_attempts` with a fixed delay.
#[derive(Clone)]
pub struct TaskCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl TaskCoordinator {
    /// Wire a coordinator. Without an executor, dispatches wait for agents to report back.
    pub fn new(
        config: CoordinatorConfig,
        directory: Arc<AgentDirectory>,
        bus: Arc<CommunicationBus>,
        events: EventHub,
        executor: Option<Arc<dyn TaskExecutor>>,
        hints: Arc<dyn ToolHints>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                directory,
                bus,
                events,
                executor,
                hints,
                state: RwLock::new(CoordinatorState::default()),
                timers: parking_lot::Mutex::new(HashMap::new()),
                pass: Mutex::new(()),
            }),
        }
    }

    /// Queue a standalone task. Dependencies must name known tasks.
    pub async fn create_task(&self, spec: TaskSpec) -> ConductorResult<String> {
        let task = Task::from_spec(spec);
        let (id, cancelled) = {
            let mut state = self.inner.state.write().await;
            if let Err(e) = validate_task(&state.queue, &task, &HashSet::new()) {
                warn!(task_id = %task.id, error = %e, "Rejected task");
                return Err(e);
            }
            let id = state.queue.add(task)?;
            let cancelled = cancel_if_doomed(&mut state, &id);
            (id, cancelled)
        };

        info!(task_id = %id, "Task created");
        self.inner
            .events
            .publish(OrchestratorEvent::TaskCreated { task_id: id.clone() });
        self.announce(Outcome {
            cancelled,
            ..Outcome::default()
        });
        Ok(id)
    }

    /// Queue a group of tasks tracked to joint completion.
    ///
    /// A member may depend on existing tasks or on members listed before it.
    pub async fn create_workflow(
        &self,
        name: impl Into<String>,
        specs: Vec<TaskSpec>,
        context: serde_json::Value,
    ) -> ConductorResult<String> {
        let name = name.into();
        if specs.is_empty() {
            return Err(ConductorError::Validation(format!(
                "workflow '{name}' has no tasks"
            )));
        }

        let tasks: Vec<Task> = specs.into_iter().map(Task::from_spec).collect();
        let (workflow_id, task_ids, cancelled) = {
            let mut state = self.inner.state.write().await;
            let mut earlier: HashSet<String> = HashSet::new();
            for task in &tasks {
                if let Err(e) = validate_task(&state.queue, task, &earlier) {
                    warn!(workflow = %name, task_id = %task.id, error = %e, "Rejected workflow");
                    return Err(e);
                }
                earlier.insert(task.id.clone());
            }

            let task_ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
            let workflow = Workflow::new(name.clone(), task_ids.clone(), context);
            let workflow_id = workflow.id.clone();
            for mut task in tasks {
                task.workflow_id = Some(workflow_id.clone());
                state.queue.add(task)?;
            }
            state.workflow_order.push(workflow_id.clone());
            state.workflows.insert(workflow_id.clone(), workflow);

            let mut cancelled = Vec::new();
            for id in &task_ids {
                cancelled.extend(cancel_if_doomed(&mut state, id));
            }
            (workflow_id, task_ids, cancelled)
        };

        info!(workflow_id = %workflow_id, workflow = %name, tasks = task_ids.len(), "Workflow created");
        for task_id in task_ids {
            self.inner
                .events
                .publish(OrchestratorEvent::TaskCreated { task_id });
        }
        self.announce(Outcome {
            cancelled,
            ..Outcome::default()
        });
        Ok(workflow_id)
    }

    /// One dispatch pass over ready tasks, most urgent first.
    /// Returns how many tasks were handed to an agent.
    pub async fn process_queue(&self) -> usize {
        let _pass = self.inner.pass.lock().await;
        let candidates: Vec<String> = {
            let state = self.inner.state.read().await;
            let now = Instant::now();
            state
                .queue
                .ready_ids()
                .into_iter()
                .filter(|id| state.dispatchable(id, now))
                .collect()
        };

        let mut dispatched = 0;
        for task_id in candidates {
            match self.distribute_task(&task_id).await {
                Ok(true) => dispatched += 1,
                Ok(false) => {}
                Err(e) => warn!(task_id = %task_id, error = %e, "Dispatch failed"),
            }
        }
        dispatched
    }

    /// Run [`Self::process_queue`] every `processing_interval` until aborted.
    pub fn start(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        let period = self.inner.config.processing_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let dispatched = coordinator.process_queue().await;
                if dispatched > 0 {
                    debug!(dispatched, "Queue pass finished");
                }
            }
        })
    }

    /// Hand a ready task to the best available agent.
    ///
    /// Returns `Ok(false)` when the task is not dispatchable right now
    /// (not pending, dependencies unfinished, waiting out a retry delay,
    /// workflow paused, or no agent free); it stays queued.
    pub async fn distribute_task(&self, task_id: &str) -> ConductorResult<bool> {
        let task = {
            let state = self.inner.state.read().await;
            let task = state
                .queue
                .get(task_id)
                .ok_or_else(|| ConductorError::NotFound(format!("task '{task_id}'")))?;
            if !state.dispatchable(task_id, Instant::now()) {
                return Ok(false);
            }
            task.clone()
        };

        let Some((agent, matched)) = self
            .inner
            .directory
            .reserve(&task.required_capabilities, &AgentQuery::new())
            .await
        else {
            debug!(task_id = %task_id, "No agent available, task stays pending");
            return Ok(false);
        };

        let dispatch_id = Uuid::new_v4().to_string();
        let assigned = {
            let mut state = self.inner.state.write().await;
            if state.dispatchable(task_id, Instant::now())
                && state.queue.mark_assigned(task_id, &agent.id)
            {
                state.retry_after.remove(task_id);
                state
                    .dispatches
                    .insert(task_id.to_string(), dispatch_id.clone());
                if let Some(workflow) = task
                    .workflow_id
                    .as_ref()
                    .and_then(|id| state.workflows.get_mut(id))
                {
                    if workflow.status == WorkflowStatus::Pending {
                        workflow.status = WorkflowStatus::InProgress;
                    }
                }
                state.queue.get(task_id).cloned()
            } else {
                None
            }
        };
        let Some(task) = assigned else {
            // Lost the task to a concurrent transition; give the slot back.
            self.shift_load(&agent.id, -1).await;
            return Ok(false);
        };
        self.inner.bus.update_task_count(&agent.id, agent.current_tasks);

        let hint_caps = match &matched {
            Some(capability) => vec![capability.clone()],
            None => Vec::new(),
        };
        let request = Message::request(
            self.inner.config.dispatcher_id.clone(),
            agent.id.clone(),
            serde_json::json!({
                "dispatch_id": dispatch_id,
                "capability": matched,
                "recommended_tools": self.inner.hints.recommend(&hint_caps),
                "task": task,
            }),
        )
        .with_priority(task.priority)
        .with_correlation_id(dispatch_id.clone());
        if !self.inner.bus.send(request) {
            warn!(task_id = %task_id, agent_id = %agent.id, "Dispatch message undeliverable");
        }

        info!(task_id = %task_id, agent_id = %agent.id, attempt = task.attempts, "Task assigned");
        self.inner.events.publish(OrchestratorEvent::TaskAssigned {
            task_id: task_id.to_string(),
            agent_id: agent.id.clone(),
        });

        self.arm_timer(task_id, &agent.id, &dispatch_id);
        if let Some(executor) = &self.inner.executor {
            self.drive(Arc::clone(executor), task, agent, dispatch_id);
        }
        Ok(true)
    }

    fn arm_timer(&self, task_id: &str, agent_id: &str, dispatch_id: &str) {
        let coordinator = self.clone();
        let timeout = self.inner.config.task_timeout();
        let (task_id, agent_id, dispatch_id) =
            (task_id.to_string(), agent_id.to_string(), dispatch_id.to_string());
        let (key, owner) = (task_id.clone(), dispatch_id.clone());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Detach the own handle first; the failure path must not abort us.
            {
                let mut timers = coordinator.inner.timers.lock();
                if timers.get(&task_id).is_some_and(|(owner, _)| *owner == dispatch_id) {
                    timers.remove(&task_id);
                }
            }
            let err = ConductorError::Timeout {
                task_id: task_id.clone(),
                after: timeout,
            };
            if coordinator
                .fail_dispatch(&task_id, &err.to_string(), &agent_id, Some(&dispatch_id))
                .await
            {
                warn!(task_id = %task_id, agent_id = %agent_id, "Dispatch timed out");
            }
        });
        if let Some((_, previous)) = self.inner.timers.lock().insert(key, (owner, handle)) {
            previous.abort();
        }
    }

    fn cancel_timer(&self, task_id: &str) {
        if let Some((_, handle)) = self.inner.timers.lock().remove(task_id) {
            handle.abort();
        }
    }

    /// Run the executor for one dispatch and report back, unless superseded.
    fn drive(
        &self,
        executor: Arc<dyn TaskExecutor>,
        task: Task,
        agent: Agent,
        dispatch_id: String,
    ) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.handle_task_started(&task.id, &agent.id).await;
            match executor.execute(&task, &agent).await {
                Ok(value) => {
                    coordinator
                        .complete_dispatch(&task.id, value, &agent.id, Some(&dispatch_id))
                        .await;
                }
                Err(e) => {
                    coordinator
                        .fail_dispatch(&task.id, &e.to_string(), &agent.id, Some(&dispatch_id))
                        .await;
                }
            }
        });
    }

    async fn shift_load(&self, agent_id: &str, delta: i64) {
        if let Some(count) = self.inner.directory.adjust_task_count(agent_id, delta).await {
            self.inner.bus.update_task_count(agent_id, count);
        }
    }

    /// The agent reports it began work on an assigned task.
    pub async fn handle_task_started(&self, task_id: &str, agent_id: &str) -> bool {
        let mut state = self.inner.state.write().await;
        if !state.holds(task_id, agent_id) {
            debug!(task_id = %task_id, agent_id = %agent_id, "Ignoring start from non-holder");
            return false;
        }
        state.queue.mark_in_progress(task_id)
    }

    /// Record a successful result. Late or foreign reports are ignored.
    pub async fn handle_task_completion(
        &self,
        task_id: &str,
        result: serde_json::Value,
        agent_id: &str,
    ) -> bool {
        self.complete_dispatch(task_id, result, agent_id, None).await
    }

    /// [`Self::handle_task_completion`], optionally pinned to one dispatch.
    async fn complete_dispatch(
        &self,
        task_id: &str,
        result: serde_json::Value,
        agent_id: &str,
        dispatch_id: Option<&str>,
    ) -> bool {
        let outcome = {
            let mut state = self.inner.state.write().await;
            if !state.reports_current(task_id, agent_id, dispatch_id) {
                debug!(task_id = %task_id, agent_id = %agent_id, "Ignoring late completion");
                return false;
            }
            state.queue.mark_completed(task_id, result);
            state.dispatches.remove(task_id);
            Outcome {
                finished_workflows: state.advance_workflow(task_id).into_iter().collect(),
                cancelled: Vec::new(),
            }
        };

        self.cancel_timer(task_id);
        self.shift_load(agent_id, -1).await;
        info!(task_id = %task_id, agent_id = %agent_id, "Task completed");
        self.inner.events.publish(OrchestratorEvent::TaskCompleted {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
        });
        self.announce(outcome);
        true
    }

    /// Record a failed attempt; requeue while attempts remain.
    pub async fn handle_task_failure(&self, task_id: &str, error: &str, agent_id: &str) -> bool {
        self.fail_dispatch(task_id, error, agent_id, None).await
    }

    /// [`Self::handle_task_failure`], optionally pinned to one dispatch so a
    /// stale timer or executor cannot fail a newer one.
    async fn fail_dispatch(
        &self,
        task_id: &str,
        error: &str,
        agent_id: &str,
        dispatch_id: Option<&str>,
    ) -> bool {
        let max_attempts = self.inner.config.max_attempts;
        let (attempts, permanent, outcome) = {
            let mut state = self.inner.state.write().await;
            if !state.reports_current(task_id, agent_id, dispatch_id) {
                debug!(task_id = %task_id, agent_id = %agent_id, "Ignoring late failure");
                return false;
            }
            state.dispatches.remove(task_id);
            let attempts = state.queue.get(task_id).map_or(0, |t| t.attempts);
            if attempts < max_attempts {
                state.queue.requeue(task_id, Some(error.to_string()));
                state.retry_after.insert(
                    task_id.to_string(),
                    Instant::now() + self.inner.config.retry_delay(),
                );
                (attempts, false, Outcome::default())
            } else {
                let message = ConductorError::RetryExhausted {
                    task_id: task_id.to_string(),
                    attempts,
                    last_error: error.to_string(),
                }
                .to_string();
                state.queue.mark_failed(task_id, message);
                let cancelled = state.cascade_cancel(task_id);
                let mut finished: Vec<(String, bool)> =
                    state.advance_workflow(task_id).into_iter().collect();
                for id in &cancelled {
                    finished.extend(state.advance_workflow(id));
                }
                (
                    attempts,
                    true,
                    Outcome {
                        finished_workflows: finished,
                        cancelled,
                    },
                )
            }
        };

        self.cancel_timer(task_id);
        self.shift_load(agent_id, -1).await;

        if permanent {
            error!(task_id = %task_id, agent_id = %agent_id, attempts, error = %error, "Task failed permanently");
            self.inner.events.publish(OrchestratorEvent::TaskFailed {
                task_id: task_id.to_string(),
                error: error.to_string(),
            });
        } else {
            warn!(task_id = %task_id, agent_id = %agent_id, attempt = attempts, error = %error, "Task attempt failed, requeued");
            self.inner.events.publish(OrchestratorEvent::TaskRequeued {
                task_id: task_id.to_string(),
                attempt: attempts + 1,
            });
        }
        self.announce(outcome);
        true
    }

    /// Put every task held by a vanished agent back in the queue.
    ///
    /// The interrupted attempt is not counted against the task.
    pub async fn handle_agent_offline(&self, agent_id: &str) -> Vec<String> {
        let requeued: Vec<(String, u32)> = {
            let mut state = self.inner.state.write().await;
            let active = state.queue.active_on(agent_id);
            let mut requeued = Vec::with_capacity(active.len());
            for task_id in active {
                if state
                    .queue
                    .requeue(&task_id, Some(format!("agent '{agent_id}' went offline")))
                {
                    state.queue.refund_attempt(&task_id);
                    state.dispatches.remove(&task_id);
                    let attempt = state.queue.get(&task_id).map_or(0, |t| t.attempts) + 1;
                    requeued.push((task_id, attempt));
                }
            }
            requeued
        };

        for (task_id, attempt) in &requeued {
            self.cancel_timer(task_id);
            info!(task_id = %task_id, agent_id = %agent_id, "Requeued task from offline agent");
            self.inner.events.publish(OrchestratorEvent::TaskRequeued {
                task_id: task_id.clone(),
                attempt: *attempt,
            });
        }
        requeued.into_iter().map(|(id, _)| id).collect()
    }

    /// Cancel a task and everything that depends on it.
    ///
    /// Returns `Ok(false)` if the task had already finished.
    pub async fn cancel_task(&self, task_id: &str) -> ConductorResult<bool> {
        let (holder, outcome) = {
            let mut state = self.inner.state.write().await;
            let task = state
                .queue
                .get(task_id)
                .ok_or_else(|| ConductorError::NotFound(format!("task '{task_id}'")))?;
            if task.status.is_terminal() {
                return Ok(false);
            }
            let holder = match task.status {
                TaskStatus::Assigned | TaskStatus::InProgress => task.assigned_agent.clone(),
                _ => None,
            };
            state.queue.mark_cancelled(task_id, "cancelled".to_string());
            state.dispatches.remove(task_id);
            state.retry_after.remove(task_id);
            let cancelled = state.cascade_cancel(task_id);
            let mut finished: Vec<(String, bool)> =
                state.advance_workflow(task_id).into_iter().collect();
            for id in &cancelled {
                finished.extend(state.advance_workflow(id));
            }
            (
                holder,
                Outcome {
                    finished_workflows: finished,
                    cancelled,
                },
            )
        };

        self.cancel_timer(task_id);
        if let Some(agent_id) = holder {
            self.shift_load(&agent_id, -1).await;
        }
        info!(task_id = %task_id, "Task cancelled");
        self.inner.events.publish(OrchestratorEvent::TaskFailed {
            task_id: task_id.to_string(),
            error: "cancelled".to_string(),
        });
        self.announce(outcome);
        Ok(true)
    }

    /// Stop dispatching members of a workflow. Running members finish.
    pub async fn pause_workflow(&self, workflow_id: &str) -> ConductorResult<()> {
        let mut state = self.inner.state.write().await;
        let workflow = state
            .workflows
            .get_mut(workflow_id)
            .ok_or_else(|| ConductorError::NotFound(format!("workflow '{workflow_id}'")))?;
        if workflow.is_finished() {
            return Err(ConductorError::Validation(format!(
                "workflow '{workflow_id}' already finished"
            )));
        }
        workflow.status = WorkflowStatus::Paused;
        info!(workflow_id = %workflow_id, "Workflow paused");
        Ok(())
    }

    /// Let a paused workflow's pending tasks be offered again.
    pub async fn resume_workflow(&self, workflow_id: &str) -> ConductorResult<()> {
        let mut state = self.inner.state.write().await;
        let started = {
            let workflow = state
                .workflows
                .get(workflow_id)
                .ok_or_else(|| ConductorError::NotFound(format!("workflow '{workflow_id}'")))?;
            if workflow.status != WorkflowStatus::Paused {
                return Err(ConductorError::Validation(format!(
                    "workflow '{workflow_id}' is not paused"
                )));
            }
            workflow.task_ids.iter().any(|id| {
                state
                    .queue
                    .get(id)
                    .is_some_and(|t| t.status != TaskStatus::Pending)
            })
        };
        if let Some(workflow) = state.workflows.get_mut(workflow_id) {
            workflow.status = if started {
                WorkflowStatus::InProgress
            } else {
                WorkflowStatus::Pending
            };
        }
        info!(workflow_id = %workflow_id, "Workflow resumed");
        Ok(())
    }

    /// Snapshot of a task.
    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        self.inner.state.read().await.queue.get(task_id).cloned()
    }

    /// Snapshot of a workflow.
    pub async fn get_workflow(&self, workflow_id: &str) -> Option<Workflow> {
        self.inner
            .state
            .read()
            .await
            .workflows
            .get(workflow_id)
            .cloned()
    }

    /// Every workflow in creation order.
    pub async fn list_workflows(&self) -> Vec<Workflow> {
        let state = self.inner.state.read().await;
        state
            .workflow_order
            .iter()
            .filter_map(|id| state.workflows.get(id).cloned())
            .collect()
    }

    /// Counters over tasks, workflows and in-flight dispatches.
    pub async fn statistics(&self) -> CoordinatorStats {
        let state = self.inner.state.read().await;
        let mut stats = CoordinatorStats {
            total_tasks: state.queue.total_count(),
            total_workflows: state.workflows.len(),
            in_flight: state.dispatches.len(),
            ..CoordinatorStats::default()
        };
        for task in state.queue.all_tasks() {
            *stats.tasks_by_status.entry(task.status).or_default() += 1;
        }
        for workflow in state.workflows.values() {
            *stats.workflows_by_status.entry(workflow.status).or_default() += 1;
        }
        stats
    }

    fn announce(&self, outcome: Outcome) {
        for task_id in outcome.cancelled {
            info!(task_id = %task_id, "Task cancelled after upstream failure");
            self.inner.events.publish(OrchestratorEvent::TaskFailed {
                task_id,
                error: "cancelled: dependency did not complete".to_string(),
            });
        }
        for (workflow_id, success) in outcome.finished_workflows {
            info!(workflow_id = %workflow_id, success, "Workflow finished");
            self.inner
                .events
                .publish(OrchestratorEvent::WorkflowCompleted {
                    workflow_id,
                    success,
                });
        }
    }
}

fn validate_task(queue: &TaskQueue, task: &Task, siblings: &HashSet<String>) -> ConductorResult<()> {
    if task.name.trim().is_empty() {
        return Err(ConductorError::Validation("task name is empty".into()));
    }
    if queue.get(&task.id).is_some() || siblings.contains(&task.id) {
        return Err(ConductorError::Duplicate(format!(
            "task '{}' already exists",
            task.id
        )));
    }
    for dep in &task.dependencies {
        if dep == &task.id {
            return Err(ConductorError::CyclicDependency(vec![task.id.clone()]));
        }
        if queue.get(dep).is_none() && !siblings.contains(dep) {
            return Err(ConductorError::Validation(format!(
                "task '{}' depends on unknown task '{dep}'",
                task.id
            )));
        }
    }
    Ok(())
}

/// A new task whose dependency already failed can never run.
fn cancel_if_doomed(state: &mut CoordinatorState, task_id: &str) -> Vec<String> {
    let doomed = state.queue.get(task_id).is_some_and(|task| {
        task.status == TaskStatus::Pending
            && task.dependencies.iter().any(|dep| {
                state
                    .queue
                    .get(dep)
                    .is_some_and(|d| matches!(d.status, TaskStatus::Failed | TaskStatus::Cancelled))
            })
    });
    if !doomed {
        return Vec::new();
    }
    let mut cancelled = Vec::new();
    if state
        .queue
        .mark_cancelled(task_id, "dependency did not complete".to_string())
    {
        cancelled.push(task_id.to_string());
        cancelled.extend(state.cascade_cancel(task_id));
    }
    for id in &cancelled {
        state.advance_workflow(id);
    }
    cancelled
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::DirectoryConfig;
    use crate::executor::DefaultToolHints;
    use crate::types::{AgentMetadata, AgentStatus, AgentType, Capability};
    use async_trait::async_trait;
    use conductor_core::{MessageKind, Priority};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Harness {
        coordinator: TaskCoordinator,
        directory: Arc<AgentDirectory>,
        bus: Arc<CommunicationBus>,
    }

    async fn harness(
        config: CoordinatorConfig,
        executor: Option<Arc<dyn TaskExecutor>>,
        agents: &[(&str, AgentType, &str, u32)],
    ) -> Harness {
        let events = EventHub::new(256);
        let directory = Arc::new(AgentDirectory::new(DirectoryConfig::default(), events.clone()));
        let bus = Arc::new(CommunicationBus::new(events.clone()));
        for (id, agent_type, cap, max) in agents {
            let agent = directory
                .register(
                    AgentMetadata::new(*id, *id, *agent_type)
                        .with_capability(Capability::new(*cap, "test"))
                        .with_max_concurrent_tasks(*max),
                )
                .await
                .unwrap();
            bus.register_agent(&agent);
        }
        let coordinator = TaskCoordinator::new(
            config,
            Arc::clone(&directory),
            Arc::clone(&bus),
            events,
            executor,
            Arc::new(DefaultToolHints),
        );
        Harness {
            coordinator,
            directory,
            bus,
        }
    }

    fn quick_config() -> CoordinatorConfig {
        CoordinatorConfig {
            max_attempts: 2,
            retry_delay_ms: 0,
            task_timeout_ms: 60_000,
            processing_interval_ms: 10,
            ..CoordinatorConfig::default()
        }
    }

    fn spec(id: &str, cap: &str, deps: &[&str]) -> TaskSpec {
        TaskSpec::new(id)
            .with_id(id)
            .with_capability(cap)
            .with_dependencies(deps.iter().copied())
    }

    #[tokio::test]
    async fn test_dispatch_sends_request_with_hints() {
        let h = harness(quick_config(), None, &[("docs", AgentType::Specialist, "document_create", 2)]).await;
        h.coordinator
            .create_task(spec("t1", "document_create", &[]))
            .await
            .unwrap();

        assert_eq!(h.coordinator.process_queue().await, 1);
        let task = h.coordinator.get_task("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_agent.as_deref(), Some("docs"));
        assert_eq!(task.attempts, 1);
        assert_eq!(h.directory.get("docs").await.unwrap().current_tasks, 1);

        let inbox = h.bus.receive("docs");
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].kind, MessageKind::Request);
        assert_eq!(
            inbox[0].correlation_id.as_deref(),
            inbox[0].payload["dispatch_id"].as_str()
        );
        let tools = inbox[0].payload["recommended_tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t == "create_document"));
    }

    #[tokio::test]
    async fn test_no_agent_leaves_task_pending() {
        let h = harness(quick_config(), None, &[("cal", AgentType::Specialist, "calendar", 1)]).await;
        h.coordinator.create_task(spec("t1", "docs", &[])).await.unwrap();
        assert_eq!(h.coordinator.process_queue().await, 0);
        assert!(!h.coordinator.distribute_task("t1").await.unwrap());
        assert_eq!(
            h.coordinator.get_task("t1").await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_priority_order_when_capacity_is_scarce() {
        let h = harness(quick_config(), None, &[("a", AgentType::Specialist, "work", 1)]).await;
        h.coordinator.create_task(spec("slow", "work", &[])).await.unwrap();
        h.coordinator
            .create_task(spec("hot", "work", &[]).with_priority(Priority::Urgent))
            .await
            .unwrap();

        assert_eq!(h.coordinator.process_queue().await, 1);
        assert_eq!(
            h.coordinator.get_task("hot").await.unwrap().status,
            TaskStatus::Assigned
        );
        assert_eq!(
            h.coordinator.get_task("slow").await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_completion_unblocks_dependents_and_finishes_workflow() {
        let h = harness(quick_config(), None, &[("a", AgentType::Specialist, "work", 2)]).await;
        let wf = h
            .coordinator
            .create_workflow(
                "pair",
                vec![spec("first", "work", &[]), spec("second", "work", &["first"])],
                serde_json::json!({"owner": "test"}),
            )
            .await
            .unwrap();

        assert_eq!(h.coordinator.process_queue().await, 1);
        assert_eq!(
            h.coordinator.get_workflow(&wf).await.unwrap().status,
            WorkflowStatus::InProgress
        );
        assert!(h.coordinator.handle_task_started("first", "a").await);
        assert!(
            h.coordinator
                .handle_task_completion("first", serde_json::json!("ok"), "a")
                .await
        );
        assert_eq!(h.directory.get("a").await.unwrap().current_tasks, 0);

        assert_eq!(h.coordinator.process_queue().await, 1);
        h.coordinator
            .handle_task_completion("second", serde_json::json!("ok"), "a")
            .await;

        let workflow = h.coordinator.get_workflow(&wf).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert_eq!(workflow.current_step, 2);
        assert!(workflow.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_direct_dispatch_respects_dependencies_and_retry_delay() {
        let config = CoordinatorConfig {
            retry_delay_ms: 60_000,
            ..quick_config()
        };
        let h = harness(config, None, &[("a", AgentType::Specialist, "work", 2)]).await;
        h.coordinator.create_task(spec("up", "work", &[])).await.unwrap();
        h.coordinator.create_task(spec("down", "work", &["up"])).await.unwrap();

        assert!(!h.coordinator.distribute_task("down").await.unwrap());
        assert_eq!(
            h.coordinator.get_task("down").await.unwrap().status,
            TaskStatus::Pending
        );
        assert_eq!(h.directory.get("a").await.unwrap().current_tasks, 0);

        assert!(h.coordinator.distribute_task("up").await.unwrap());
        assert!(h.coordinator.handle_task_failure("up", "flaky", "a").await);
        assert!(!h.coordinator.distribute_task("up").await.unwrap());
        let up = h.coordinator.get_task("up").await.unwrap();
        assert_eq!(up.status, TaskStatus::Pending);
        assert_eq!(up.attempts, 1);
        assert_eq!(h.directory.get("a").await.unwrap().current_tasks, 0);
    }

    #[tokio::test]
    async fn test_superseded_dispatch_cannot_touch_redispatch() {
        let h = harness(quick_config(), None, &[("a", AgentType::Specialist, "work", 1)]).await;
        h.coordinator.create_task(spec("t", "work", &[])).await.unwrap();
        h.coordinator.process_queue().await;
        let first = h.bus.receive("a")[0].payload["dispatch_id"]
            .as_str()
            .unwrap()
            .to_string();

        assert!(h.coordinator.handle_task_failure("t", "flaky", "a").await);
        assert_eq!(h.coordinator.process_queue().await, 1);
        let second = h.bus.receive("a")[0].payload["dispatch_id"]
            .as_str()
            .unwrap()
            .to_string();
        assert_ne!(first, second);

        assert!(
            !h.coordinator
                .fail_dispatch("t", "timed out", "a", Some(&first))
                .await
        );
        assert!(
            !h.coordinator
                .complete_dispatch("t", serde_json::Value::Null, "a", Some(&first))
                .await
        );
        let task = h.coordinator.get_task("t").await.unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.attempts, 2);

        assert!(
            h.coordinator
                .complete_dispatch("t", serde_json::json!("ok"), "a", Some(&second))
                .await
        );
        assert_eq!(
            h.coordinator.get_task("t").await.unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_late_result_from_other_agent_is_ignored() {
        let h = harness(quick_config(), None, &[("a", AgentType::Specialist, "work", 1)]).await;
        h.coordinator.create_task(spec("t", "work", &[])).await.unwrap();
        h.coordinator.process_queue().await;

        assert!(
            !h.coordinator
                .handle_task_completion("t", serde_json::Value::Null, "intruder")
                .await
        );
        assert!(!h.coordinator.handle_task_failure("t", "nope", "intruder").await);
        assert_eq!(
            h.coordinator.get_task("t").await.unwrap().status,
            TaskStatus::Assigned
        );
    }

    #[tokio::test]
    async fn test_failure_retries_then_fails_and_cancels_dependents() {
        let h = harness(quick_config(), None, &[("a", AgentType::Specialist, "work", 2)]).await;
        let wf = h
            .coordinator
            .create_workflow(
                "doomed",
                vec![spec("root", "work", &[]), spec("leaf", "work", &["root"])],
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        h.coordinator.process_queue().await;
        assert!(h.coordinator.handle_task_failure("root", "boom", "a").await);
        let root = h.coordinator.get_task("root").await.unwrap();
        assert_eq!(root.status, TaskStatus::Pending);
        assert_eq!(root.error.as_deref(), Some("boom"));

        h.coordinator.process_queue().await;
        assert_eq!(h.coordinator.get_task("root").await.unwrap().attempts, 2);
        assert!(h.coordinator.handle_task_failure("root", "boom again", "a").await);

        let root = h.coordinator.get_task("root").await.unwrap();
        assert_eq!(root.status, TaskStatus::Failed);
        assert!(root.error.unwrap().contains("after 2 attempts"));
        assert_eq!(
            h.coordinator.get_task("leaf").await.unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(
            h.coordinator.get_workflow(&wf).await.unwrap().status,
            WorkflowStatus::Failed
        );
        assert_eq!(h.directory.get("a").await.unwrap().current_tasks, 0);
    }

    #[tokio::test]
    async fn test_retry_waits_for_delay() {
        let config = CoordinatorConfig {
            retry_delay_ms: 60_000,
            ..quick_config()
        };
        let h = harness(config, None, &[("a", AgentType::Specialist, "work", 1)]).await;
        h.coordinator.create_task(spec("t", "work", &[])).await.unwrap();
        h.coordinator.process_queue().await;
        h.coordinator.handle_task_failure("t", "flaky", "a").await;
        assert_eq!(h.coordinator.process_queue().await, 0);
        assert_eq!(
            h.coordinator.get_task("t").await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_timeout_requeues_task() {
        let config = CoordinatorConfig {
            task_timeout_ms: 20,
            ..quick_config()
        };
        let h = harness(config, None, &[("a", AgentType::Specialist, "work", 1)]).await;
        h.coordinator.create_task(spec("t", "work", &[])).await.unwrap();
        h.coordinator.process_queue().await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        let task = h.coordinator.get_task("t").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.error.unwrap().contains("timed out"));
        assert_eq!(h.directory.get("a").await.unwrap().current_tasks, 0);
    }

    #[tokio::test]
    async fn test_agent_offline_requeues_without_burning_attempt() {
        let h = harness(
            quick_config(),
            None,
            &[("a", AgentType::Specialist, "work", 1), ("b", AgentType::Specialist, "work", 1)],
        )
        .await;
        h.coordinator.create_task(spec("t", "work", &[])).await.unwrap();
        h.coordinator.process_queue().await;
        assert_eq!(
            h.coordinator.get_task("t").await.unwrap().assigned_agent.as_deref(),
            Some("a")
        );

        h.directory.set_status("a", AgentStatus::Offline).await;
        assert_eq!(h.coordinator.handle_agent_offline("a").await, vec!["t"]);
        let task = h.coordinator.get_task("t").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);

        h.coordinator.process_queue().await;
        assert_eq!(
            h.coordinator.get_task("t").await.unwrap().assigned_agent.as_deref(),
            Some("b")
        );
    }

    #[tokio::test]
    async fn test_cancel_and_pause_resume() {
        let h = harness(quick_config(), None, &[("a", AgentType::Specialist, "work", 4)]).await;
        let wf = h
            .coordinator
            .create_workflow(
                "held",
                vec![spec("x", "work", &[]), spec("y", "work", &["x"])],
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        h.coordinator.pause_workflow(&wf).await.unwrap();
        assert_eq!(h.coordinator.process_queue().await, 0);
        h.coordinator.resume_workflow(&wf).await.unwrap();
        assert_eq!(
            h.coordinator.get_workflow(&wf).await.unwrap().status,
            WorkflowStatus::Pending
        );
        assert_eq!(h.coordinator.process_queue().await, 1);

        assert!(h.coordinator.cancel_task("x").await.unwrap());
        assert!(!h.coordinator.cancel_task("x").await.unwrap());
        assert_eq!(
            h.coordinator.get_task("y").await.unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(h.directory.get("a").await.unwrap().current_tasks, 0);
        assert_eq!(
            h.coordinator.get_workflow(&wf).await.unwrap().status,
            WorkflowStatus::Failed
        );
        assert!(matches!(
            h.coordinator.pause_workflow(&wf).await,
            Err(ConductorError::Validation(_))
        ));
        assert!(matches!(
            h.coordinator.cancel_task("ghost").await,
            Err(ConductorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_creation_validation() {
        let h = harness(quick_config(), None, &[]).await;
        h.coordinator.create_task(spec("a", "work", &[])).await.unwrap();
        assert!(matches!(
            h.coordinator.create_task(spec("a", "work", &[])).await,
            Err(ConductorError::Duplicate(_))
        ));
        assert!(matches!(
            h.coordinator.create_task(spec("b", "work", &["ghost"])).await,
            Err(ConductorError::Validation(_))
        ));
        assert!(matches!(
            h.coordinator
                .create_workflow(
                    "backwards",
                    vec![spec("p", "work", &["q"]), spec("q", "work", &[])],
                    serde_json::Value::Null,
                )
                .await,
            Err(ConductorError::Validation(_))
        ));
        // A rejected workflow stores none of its members.
        assert!(h.coordinator.get_task("q").await.is_none());
        assert_eq!(h.coordinator.statistics().await.total_workflows, 0);
    }

    /// Counts calls; fails the first `failures` of them.
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
    }

    #[async_trait]
    impl TaskExecutor for Flaky {
        async fn execute(&self, task: &Task, _agent: &Agent) -> ConductorResult<serde_json::Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(ConductorError::Executor(format!("call {call} failed")));
            }
            Ok(serde_json::json!({ "done": task.id }))
        }
    }

    #[tokio::test]
    async fn test_attached_executor_drives_tasks_to_completion() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            failures: 1,
        });
        let h = harness(
            quick_config(),
            Some(flaky.clone()),
            &[("a", AgentType::Specialist, "work", 2)],
        )
        .await;
        h.coordinator.create_task(spec("t", "work", &[])).await.unwrap();
        let loop_handle = h.coordinator.start();

        let mut done = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let task = h.coordinator.get_task("t").await.unwrap();
            if task.status.is_terminal() {
                done = Some(task);
                break;
            }
        }
        loop_handle.abort();

        let task = done.expect("task should finish");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.result.unwrap()["done"], "t");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

        let stats = h.coordinator.statistics().await;
        assert_eq!(stats.tasks_by_status[&TaskStatus::Completed], 1);
        assert_eq!(stats.in_flight, 0);
    }
}
