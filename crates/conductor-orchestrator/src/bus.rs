use crate::events::{EventHub, OrchestratorEvent};
use crate::types::{Agent, AgentStatus, AgentType};
use chrono::{DateTime, Utc};
use conductor_core::{Message, MessageKind};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

/// The bus's denormalized view of an agent, used only for delivery decisions.
#[derive(Debug, Clone)]
pub struct BusAgent {
    /// Agent id.
    pub id: String,
    /// Agent type.
    pub agent_type: AgentType,
    /// Capability names, used for broadcast matching.
    pub capabilities: Vec<String>,
    /// Last known status.
    pub status: AgentStatus,
    /// Tasks running on the agent.
    pub current_tasks: u32,
    /// Concurrency ceiling of the agent.
    pub max_concurrent_tasks: u32,
    /// Time of the last heartbeat.
    pub last_heartbeat: DateTime<Utc>,
}

impl From<&Agent> for BusAgent {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id.clone(),
            agent_type: agent.agent_type,
            capabilities: agent.capabilities.iter().map(|c| c.name.clone()).collect(),
            status: agent.status,
            current_tasks: agent.current_tasks,
            max_concurrent_tasks: agent.max_concurrent_tasks,
            last_heartbeat: agent.last_heartbeat,
        }
    }
}

#[derive(Default)]
struct BusState {
    agents: HashMap<String, BusAgent>,
    queues: HashMap<String, VecDeque<Message>>,
}

/// Point-to-point and capability-broadcast messaging between agents.
///
/// Delivery is best effort and in-memory: a message is queued for its
/// recipient and handed out exactly once by [`CommunicationBus::receive`].
/// Nothing is redelivered if the consumer drops it.
pub struct CommunicationBus {
    state: Mutex<BusState>,
    events: EventHub,
}

impl CommunicationBus {
    /// Create an empty bus publishing to `events`.
    pub fn new(events: EventHub) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            events,
        }
    }

    /// Add or refresh the delivery mirror of `agent`. Queued messages survive.
    pub fn register_agent(&self, agent: &Agent) {
        let mut state = self.state.lock();
        state.agents.insert(agent.id.clone(), BusAgent::from(agent));
        state.queues.entry(agent.id.clone()).or_default();
    }

    /// Drop the mirror and any undelivered messages. Returns `false` if unknown.
    pub fn unregister_agent(&self, agent_id: &str) -> bool {
        let mut state = self.state.lock();
        let dropped = state.queues.remove(agent_id).map_or(0, |q| q.len());
        if dropped > 0 {
            debug!(agent_id = %agent_id, dropped, "Discarding undelivered messages");
        }
        state.agents.remove(agent_id).is_some()
    }

    /// Whether a mirror exists for `agent_id`.
    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.state.lock().agents.contains_key(agent_id)
    }

    /// Snapshot of the mirror for `agent_id`.
    pub fn agent(&self, agent_id: &str) -> Option<BusAgent> {
        self.state.lock().agents.get(agent_id).cloned()
    }

    /// Queue `message` for its recipient.
    ///
    /// Returns `false` (and logs) when the recipient is not registered.
    pub fn send(&self, message: Message) -> bool {
        let (id, from, to) = (message.id, message.from.clone(), message.to.clone());
        {
            let mut state = self.state.lock();
            if !state.agents.contains_key(&to) {
                drop(state);
                warn!(to = %to, from = %from, "Dropping message to unregistered agent");
                return false;
            }
            state.queues.entry(to.clone()).or_default().push_back(message);
        }
        debug!(message_id = %id, from = %from, to = %to, "Message queued");
        self.events.publish(OrchestratorEvent::MessageSent {
            message_id: id,
            from,
            to,
        });
        true
    }

    /// Send one broadcast copy of `payload` to every live agent declaring
    /// `capability`, except the sender. Returns the ids that accepted delivery.
    pub fn broadcast_by_capability(
        &self,
        from: &str,
        capability: &str,
        payload: serde_json::Value,
    ) -> Vec<String> {
        let recipients: Vec<String> = {
            let state = self.state.lock();
            let mut ids: Vec<&BusAgent> = state
                .agents
                .values()
                .filter(|a| a.id != from)
                .filter(|a| a.status != AgentStatus::Offline)
                .filter(|a| a.capabilities.iter().any(|c| c == capability))
                .collect();
            ids.sort_by(|a, b| a.id.cmp(&b.id));
            ids.into_iter().map(|a| a.id.clone()).collect()
        };

        recipients
            .into_iter()
            .filter(|to| {
                let message = Message::new(from, to.clone(), MessageKind::Broadcast, payload.clone());
                self.send(message)
            })
            .collect()
    }

    /// Hand out and clear everything queued for `agent_id`.
    ///
    /// Messages whose TTL has elapsed are discarded instead of delivered.
    pub fn receive(&self, agent_id: &str) -> Vec<Message> {
        let now = Utc::now();
        let drained: Vec<Message> = {
            let mut state = self.state.lock();
            match state.queues.get_mut(agent_id) {
                Some(queue) => queue.drain(..).collect(),
                None => return Vec::new(),
            }
        };

        let (expired, delivered): (Vec<Message>, Vec<Message>) =
            drained.into_iter().partition(|m| m.is_expired_at(now));
        if !expired.is_empty() {
            debug!(agent_id = %agent_id, expired = expired.len(), "Discarded expired messages");
        }
        for message in &delivered {
            self.events.publish(OrchestratorEvent::MessageReceived {
                message_id: message.id,
                agent_id: agent_id.to_string(),
            });
        }
        delivered
    }

    /// Number of messages waiting for `agent_id`.
    pub fn pending_count(&self, agent_id: &str) -> usize {
        self.state.lock().queues.get(agent_id).map_or(0, VecDeque::len)
    }

    /// Mirror a heartbeat; an offline mirror returns to idle.
    pub fn update_heartbeat(&self, agent_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.last_heartbeat = Utc::now();
                if agent.status == AgentStatus::Offline {
                    agent.status = AgentStatus::Idle;
                    agent.current_tasks = 0;
                }
                true
            }
            None => false,
        }
    }

    /// Mirror a task-count change.
    pub fn update_task_count(&self, agent_id: &str, count: u32) -> bool {
        let mut state = self.state.lock();
        match state.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.current_tasks = count;
                if agent.status != AgentStatus::Offline {
                    agent.status = if count > 0 {
                        AgentStatus::Busy
                    } else {
                        AgentStatus::Idle
                    };
                }
                true
            }
            None => false,
        }
    }

    /// Mirror a status change decided by the directory.
    pub fn set_status(&self, agent_id: &str, status: AgentStatus) -> bool {
        let mut state = self.state.lock();
        match state.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.status = status;
                if status == AgentStatus::Offline {
                    agent.current_tasks = 0;
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{AgentMetadata, Capability};

    fn agent(id: &str, caps: &[&str]) -> Agent {
        let mut meta = AgentMetadata::new(id, id, AgentType::Specialist).with_max_concurrent_tasks(2);
        for cap in caps {
            meta = meta.with_capability(Capability::new(*cap, "test"));
        }
        Agent::from_metadata(meta, Utc::now())
    }

    fn bus_with(agents: &[Agent]) -> CommunicationBus {
        let bus = CommunicationBus::new(EventHub::new(64));
        for a in agents {
            bus.register_agent(a);
        }
        bus
    }

    #[test]
    fn test_send_and_receive_once() {
        let bus = bus_with(&[agent("a", &["docs"]), agent("b", &["docs"])]);
        assert!(bus.send(Message::request("a", "b", serde_json::json!({"n": 1}))));
        assert!(bus.send(Message::request("a", "b", serde_json::json!({"n": 2}))));
        assert_eq!(bus.pending_count("b"), 2);

        let got = bus.receive("b");
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].payload["n"], 1);
        assert_eq!(got[1].payload["n"], 2);
        assert!(bus.receive("b").is_empty());
    }

    #[test]
    fn test_send_to_unknown_agent_returns_false() {
        let bus = bus_with(&[agent("a", &["docs"])]);
        assert!(!bus.send(Message::request("a", "ghost", serde_json::Value::Null)));
        assert!(bus.receive("ghost").is_empty());
    }

    #[test]
    fn test_broadcast_excludes_sender_and_offline() {
        let bus = bus_with(&[
            agent("a", &["docs"]),
            agent("b", &["docs"]),
            agent("c", &["docs"]),
            agent("d", &["calendar"]),
        ]);
        bus.set_status("c", AgentStatus::Offline);

        let accepted = bus.broadcast_by_capability("a", "docs", serde_json::json!({"hello": true}));
        assert_eq!(accepted, vec!["b".to_string()]);
        let got = bus.receive("b");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, MessageKind::Broadcast);
        assert!(bus.receive("a").is_empty());
        assert!(bus.receive("d").is_empty());
    }

    #[test]
    fn test_expired_messages_not_delivered() {
        let bus = bus_with(&[agent("a", &["docs"])]);
        let mut stale = Message::notification("x", "a", serde_json::Value::Null).with_ttl(1);
        stale.timestamp = Utc::now() - chrono::Duration::seconds(5);
        bus.send(stale);
        bus.send(Message::notification("x", "a", serde_json::Value::Null).with_ttl(60));
        assert_eq!(bus.receive("a").len(), 1);
    }

    #[test]
    fn test_mirror_updates() {
        let bus = bus_with(&[agent("a", &["docs"])]);
        bus.update_task_count("a", 1);
        assert_eq!(bus.agent("a").unwrap().status, AgentStatus::Busy);
        bus.set_status("a", AgentStatus::Offline);
        assert_eq!(bus.agent("a").unwrap().current_tasks, 0);
        bus.update_task_count("a", 1);
        assert_eq!(bus.agent("a").unwrap().status, AgentStatus::Offline);
        bus.update_heartbeat("a");
        assert_eq!(bus.agent("a").unwrap().status, AgentStatus::Idle);
        assert!(!bus.update_heartbeat("ghost"));
    }

    #[test]
    fn test_unregister_drops_queue() {
        let bus = bus_with(&[agent("a", &["docs"])]);
        bus.send(Message::notification("x", "a", serde_json::Value::Null));
        assert!(bus.unregister_agent("a"));
        assert!(!bus.is_registered("a"));
        assert_eq!(bus.pending_count("a"), 0);
        assert!(!bus.unregister_agent("a"));
    }

    #[tokio::test]
    async fn test_send_and_receive_publish_events() {
        let events = EventHub::new(16);
        let mut rx = events.subscribe();
        let bus = CommunicationBus::new(events);
        bus.register_agent(&agent("a", &["docs"]));

        let msg = Message::notification("x", "a", serde_json::Value::Null);
        let id = msg.id;
        bus.send(msg);
        bus.receive("a");

        assert!(matches!(
            rx.recv().await.unwrap(),
            OrchestratorEvent::MessageSent { message_id, .. } if message_id == id
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            OrchestratorEvent::MessageReceived { message_id, .. } if message_id == id
        ));
    }
}
