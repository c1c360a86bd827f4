use crate::types::{Task, TaskStatus};
use chrono::Utc;
use conductor_core::{ConductorError, ConductorResult};
use std::collections::{HashMap, HashSet};

/// Task store of the coordinator with dependency-aware readiness.
pub struct TaskQueue {
    tasks: HashMap<String, Task>,
    /// Insertion order, used as the final tie-break.
    order: Vec<String>,
    completed: HashSet<String>,
}

impl TaskQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            order: Vec::new(),
            completed: HashSet::new(),
        }
    }

    /// Add a task to the queue. Task ids must be unique.
    pub fn add(&mut self, task: Task) -> ConductorResult<String> {
        if self.tasks.contains_key(&task.id) {
            return Err(ConductorError::Duplicate(format!(
                "task '{}' already exists",
                task.id
            )));
        }
        let id = task.id.clone();
        self.order.push(id.clone());
        self.tasks.insert(id.clone(), task);
        Ok(id)
    }

    /// Whether `id` is pending with every dependency completed.
    pub fn is_ready(&self, id: &str) -> bool {
        self.tasks
            .get(id)
            .is_some_and(|t| t.is_ready(&self.completed))
    }

    /// Ids of every ready task (pending, all dependencies completed),
    /// most urgent first, then in insertion order.
    pub fn ready_ids(&self) -> Vec<String> {
        let mut ready: Vec<(usize, &Task)> = self
            .order
            .iter()
            .enumerate()
            .filter_map(|(idx, id)| self.tasks.get(id).map(|t| (idx, t)))
            .filter(|(_, t)| t.is_ready(&self.completed))
            .collect();
        ready.sort_by(|(ia, a), (ib, b)| b.priority.cmp(&a.priority).then(ia.cmp(ib)));
        ready.into_iter().map(|(_, t)| t.id.clone()).collect()
    }

    /// Pending to assigned. Counts one attempt.
    pub fn mark_assigned(&mut self, id: &str, agent_id: &str) -> bool {
        match self.tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Assigned;
                task.assigned_agent = Some(agent_id.to_string());
                task.attempts += 1;
                true
            }
            _ => false,
        }
    }

    /// Assigned to in progress.
    pub fn mark_in_progress(&mut self, id: &str) -> bool {
        match self.tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Assigned => {
                task.status = TaskStatus::InProgress;
                task.started_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Complete a non-terminal task, unblocking its dependents.
    pub fn mark_completed(&mut self, id: &str, result: serde_json::Value) -> bool {
        match self.tasks.get_mut(id) {
            Some(task) if !task.status.is_terminal() => {
                task.status = TaskStatus::Completed;
                task.result = Some(result);
                task.error = None;
                task.completed_at = Some(Utc::now());
                self.completed.insert(id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Fail a non-terminal task.
    pub fn mark_failed(&mut self, id: &str, error: String) -> bool {
        match self.tasks.get_mut(id) {
            Some(task) if !task.status.is_terminal() => {
                task.status = TaskStatus::Failed;
                task.error = Some(error);
                task.completed_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Cancel a non-terminal task with `reason`.
    pub fn mark_cancelled(&mut self, id: &str, reason: String) -> bool {
        match self.tasks.get_mut(id) {
            Some(task) if !task.status.is_terminal() => {
                task.status = TaskStatus::Cancelled;
                task.error = Some(reason);
                task.completed_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Put an assigned or in-progress task back to pending.
    pub fn requeue(&mut self, id: &str, note: Option<String>) -> bool {
        match self.tasks.get_mut(id) {
            Some(task) if matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) => {
                task.status = TaskStatus::Pending;
                task.assigned_agent = None;
                task.started_at = None;
                if note.is_some() {
                    task.error = note;
                }
                true
            }
            _ => false,
        }
    }

    /// Give back an attempt that never reached an agent.
    pub fn refund_attempt(&mut self, id: &str) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.attempts = task.attempts.saturating_sub(1);
        }
    }

    /// Task by id.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Mutable task by id.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// All tasks in insertion order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id)).collect()
    }

    /// Ids of active (assigned or in progress) tasks on `agent_id`.
    pub fn active_on(&self, agent_id: &str) -> Vec<String> {
        self.all_tasks()
            .into_iter()
            .filter(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress))
            .filter(|t| t.assigned_agent.as_deref() == Some(agent_id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Non-terminal tasks that list `id` among their dependencies.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        self.all_tasks()
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .filter(|t| t.dependencies.iter().any(|d| d == id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Number of stored tasks, terminal ones included.
    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
