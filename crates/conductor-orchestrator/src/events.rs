use crate::types::AgentType;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Notifications published by every orchestration component.
///
/// Consumers (dashboards, tests, the [`crate::Orchestrator`] offline fan-out)
/// subscribe through [`EventHub::subscribe`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// An agent joined the directory.
    AgentRegistered {
        /// Agent concerned.
        agent_id: String,
        /// Type of the agent.
        agent_type: AgentType,
    },
    /// An agent left the directory.
    AgentUnregistered {
        /// Agent concerned.
        agent_id: String,
    },
    /// A heartbeat went stale.
    AgentOffline {
        /// Agent concerned.
        agent_id: String,
    },
    /// An offline agent sent a heartbeat again.
    AgentOnline {
        /// Agent concerned.
        agent_id: String,
    },
    /// A message was queued for delivery.
    MessageSent {
        /// Id of the message.
        message_id: Uuid,
        /// Sender id.
        from: String,
        /// Recipient id.
        to: String,
    },
    /// A queued message was handed to its recipient.
    MessageReceived {
        /// Id of the message.
        message_id: Uuid,
        /// Agent concerned.
        agent_id: String,
    },
    /// A task entered the coordinator queue.
    TaskCreated {
        /// Task concerned.
        task_id: String,
    },
    /// A task was dispatched to an agent.
    TaskAssigned {
        /// Task concerned.
        task_id: String,
        /// Agent concerned.
        agent_id: String,
    },
    /// A task completed.
    TaskCompleted {
        /// Task concerned.
        task_id: String,
        /// Agent concerned.
        agent_id: String,
    },
    /// A task failed for good or was cancelled.
    TaskFailed {
        /// Task concerned.
        task_id: String,
        /// Failure description.
        error: String,
    },
    /// A task went back to pending for another attempt.
    TaskRequeued {
        /// Task concerned.
        task_id: String,
        /// Number of the attempt that will run next.
        attempt: u32,
    },
    /// Every task of a workflow reached a terminal state.
    WorkflowCompleted {
        /// Workflow concerned.
        workflow_id: String,
        /// Whether every member task completed.
        success: bool,
    },
    /// A plan passed validation.
    PlanCreated {
        /// Plan concerned.
        plan_id: String,
        /// Number of parallel groups.
        groups: usize,
    },
    /// A plan began executing.
    PlanStarted {
        /// Plan concerned.
        plan_id: String,
    },
    /// Every node of a plan completed.
    PlanCompleted {
        /// Plan concerned.
        plan_id: String,
    },
    /// A plan stopped on a failed node.
    PlanFailed {
        /// Plan concerned.
        plan_id: String,
        /// Failure description.
        error: String,
    },
    /// A plan node is about to run another attempt.
    NodeRetrying {
        /// Plan concerned.
        plan_id: String,
        /// Task concerned.
        task_id: String,
        /// Attempt number about to run, starting at 2.
        attempt: u32,
    },
}

/// Fan-out point for [`OrchestratorEvent`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventHub {
    /// A hub buffering up to `capacity` events per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscriber is not an error.
    pub fn publish(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}
