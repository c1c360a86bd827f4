use crate::config::DirectoryConfig;
use crate::events::{EventHub, OrchestratorEvent};
use crate::types::{Agent, AgentMetadata, AgentStatus, AgentType};
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Filters and preferences for [`AgentDirectory::find_best_agent`].
#[derive(Debug, Clone, Default)]
pub struct AgentQuery {
    /// Ranked ahead of other non-coordinator agents.
    pub preferred_type: Option<AgentType>,
    /// Upper bound (inclusive) on `current_tasks / max_concurrent_tasks`.
    pub max_load: Option<f64>,
    /// Agent ids never returned.
    pub exclude_agents: Vec<String>,
}

impl AgentQuery {
    /// A query with no filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rank agents of `agent_type` first.
    pub fn preferring(mut self, agent_type: AgentType) -> Self {
        self.preferred_type = Some(agent_type);
        self
    }

    /// Skip agents whose load ratio exceeds `max_load`.
    pub fn with_max_load(mut self, max_load: f64) -> Self {
        self.max_load = Some(max_load);
        self
    }

    /// Never return `agent_id`.
    pub fn excluding(mut self, agent_id: impl Into<String>) -> Self {
        self.exclude_agents.push(agent_id.into());
        self
    }
}

/// Aggregate counters over the directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryStats {
    /// Registered agents.
    pub total_agents: usize,
    /// Count per status.
    pub by_status: HashMap<AgentStatus, usize>,
    /// Count per type.
    pub by_type: HashMap<AgentType, usize>,
    /// Sum of `max_concurrent_tasks` over non-offline agents.
    pub total_capacity: u64,
    /// Sum of `current_tasks` over every agent.
    pub active_tasks: u64,
}

#[derive(Default)]
struct DirectoryState {
    agents: HashMap<String, Agent>,
    /// Registration order.
    order: Vec<String>,
    /// Agent ids per type, in registration order.
    by_type: HashMap<AgentType, Vec<String>>,
    /// Agent ids per capability name, in registration order.
    by_capability: HashMap<String, Vec<String>>,
}

impl DirectoryState {
    fn collect_live(&self, ids: Option<&Vec<String>>) -> Vec<Agent> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.agents.get(id))
                .filter(|a| !a.is_offline())
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }
}

/// Registry of agents with type and capability indices.
///
/// The directory is the single owner of agent lifecycle; the
/// [`crate::CommunicationBus`] only mirrors what it needs for delivery.
pub struct AgentDirectory {
    state: RwLock<DirectoryState>,
    config: DirectoryConfig,
    events: EventHub,
}

impl AgentDirectory {
    /// Create an empty directory.
    pub fn new(config: DirectoryConfig, events: EventHub) -> Self {
        Self {
            state: RwLock::new(DirectoryState::default()),
            config,
            events,
        }
    }

    /// Register a new agent.
    ///
    /// Fails with `Validation` on malformed metadata, `Capacity` when the
    /// agent's type is at its configured ceiling, and `Duplicate` when the id
    /// is already taken.
    pub async fn register(&self, metadata: AgentMetadata) -> ConductorResult<Agent> {
        if let Err(e) = validate_metadata(&metadata) {
            warn!(agent_id = %metadata.id, error = %e, "Rejected agent registration");
            return Err(e);
        }

        let agent = {
            let mut state = self.state.write().await;

            if let Some(&max) = self.config.max_agents_per_type.get(&metadata.agent_type) {
                let count = state
                    .by_type
                    .get(&metadata.agent_type)
                    .map_or(0, Vec::len);
                if count >= max {
                    let e = ConductorError::Capacity(format!(
                        "agent type '{}' is limited to {max} agents",
                        metadata.agent_type
                    ));
                    warn!(agent_id = %metadata.id, error = %e, "Rejected agent registration");
                    return Err(e);
                }
            }

            if state.agents.contains_key(&metadata.id) {
                let e = ConductorError::Duplicate(format!(
                    "agent '{}' is already registered",
                    metadata.id
                ));
                warn!(agent_id = %metadata.id, error = %e, "Rejected agent registration");
                return Err(e);
            }

            let agent = Agent::from_metadata(metadata, Utc::now());
            state
                .by_type
                .entry(agent.agent_type)
                .or_default()
                .push(agent.id.clone());
            for capability in &agent.capabilities {
                let ids = state
                    .by_capability
                    .entry(capability.name.clone())
                    .or_default();
                if !ids.contains(&agent.id) {
                    ids.push(agent.id.clone());
                }
            }
            state.order.push(agent.id.clone());
            state.agents.insert(agent.id.clone(), agent.clone());
            agent
        };

        info!(
            agent_id = %agent.id,
            agent_type = %agent.agent_type,
            capabilities = agent.capabilities.len(),
            "Agent registered"
        );
        self.events.publish(OrchestratorEvent::AgentRegistered {
            agent_id: agent.id.clone(),
            agent_type: agent.agent_type,
        });
        Ok(agent)
    }

    /// Remove an agent and all of its index entries. Returns `false` if unknown.
    pub async fn unregister(&self, agent_id: &str) -> bool {
        let removed = {
            let mut state = self.state.write().await;
            match state.agents.remove(agent_id) {
                Some(agent) => {
                    state.order.retain(|id| id != agent_id);
                    if let Some(ids) = state.by_type.get_mut(&agent.agent_type) {
                        ids.retain(|id| id != agent_id);
                    }
                    for capability in &agent.capabilities {
                        if let Some(ids) = state.by_capability.get_mut(&capability.name) {
                            ids.retain(|id| id != agent_id);
                        }
                    }
                    state.by_capability.retain(|_, ids| !ids.is_empty());
                    true
                }
                None => false,
            }
        };

        if removed {
            info!(agent_id = %agent_id, "Agent unregistered");
            self.events.publish(OrchestratorEvent::AgentUnregistered {
                agent_id: agent_id.to_string(),
            });
        } else {
            debug!(agent_id = %agent_id, "Unregister of unknown agent ignored");
        }
        removed
    }

    /// Snapshot of an agent.
    pub async fn get(&self, agent_id: &str) -> Option<Agent> {
        self.state.read().await.agents.get(agent_id).cloned()
    }

    /// All agents, offline included, in registration order.
    pub async fn list(&self) -> Vec<Agent> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|id| state.agents.get(id))
            .cloned()
            .collect()
    }

    /// Non-offline agents declaring `capability`, in registration order.
    pub async fn discover(&self, capability: &str) -> Vec<Agent> {
        let state = self.state.read().await;
        state.collect_live(state.by_capability.get(capability))
    }

    /// Non-offline agents of `agent_type`, in registration order.
    pub async fn discover_by_type(&self, agent_type: AgentType) -> Vec<Agent> {
        let state = self.state.read().await;
        state.collect_live(state.by_type.get(&agent_type))
    }

    /// Pick the most suitable agent for `capability`.
    ///
    /// Only agents with spare capacity qualify. Coordinators always rank
    /// first, then agents of the preferred type, then the least loaded.
    /// Equal candidates keep registration order.
    pub async fn find_best_agent(&self, capability: &str, query: &AgentQuery) -> Option<Agent> {
        let candidates = self.discover(capability).await;
        select_best(candidates, query)
    }

    /// Walk `capabilities` in order; the first one with an eligible agent wins.
    pub async fn find_best_agent_for_any(
        &self,
        capabilities: &[String],
        query: &AgentQuery,
    ) -> Option<(Agent, String)> {
        for capability in capabilities {
            if let Some(agent) = self.find_best_agent(capability, query).await {
                return Some((agent, capability.clone()));
            }
        }
        None
    }

    /// Select an agent and claim one of its task slots under a single lock.
    ///
    /// Capabilities are walked in order as in [`Self::find_best_agent_for_any`];
    /// an empty list ranks every live agent. Returns the agent with its
    /// updated count and the capability that matched, if any. The caller
    /// gives the slot back with [`Self::adjust_task_count`].
    pub async fn reserve(
        &self,
        capabilities: &[String],
        query: &AgentQuery,
    ) -> Option<(Agent, Option<String>)> {
        let mut state = self.state.write().await;
        let (picked, matched) = if capabilities.is_empty() {
            let best = select_best(state.collect_live(Some(&state.order)), query)?;
            (best.id, None)
        } else {
            capabilities.iter().find_map(|capability| {
                select_best(state.collect_live(state.by_capability.get(capability)), query)
                    .map(|best| (best.id, Some(capability.clone())))
            })?
        };

        let agent = state.agents.get_mut(&picked)?;
        apply_task_count(agent, i64::from(agent.current_tasks) + 1);
        Some((agent.clone(), matched))
    }

    /// Refresh an agent's liveness. An offline agent comes back as idle.
    pub async fn update_heartbeat(&self, agent_id: &str) -> bool {
        self.update_heartbeat_at(agent_id, Utc::now()).await
    }

    /// [`AgentDirectory::update_heartbeat`] with an explicit clock.
    pub async fn update_heartbeat_at(&self, agent_id: &str, now: DateTime<Utc>) -> bool {
        let came_back = {
            let mut state = self.state.write().await;
            let Some(agent) = state.agents.get_mut(agent_id) else {
                warn!(agent_id = %agent_id, "Heartbeat from unknown agent");
                return false;
            };
            agent.last_heartbeat = now;
            if agent.status == AgentStatus::Offline {
                agent.status = AgentStatus::Idle;
                agent.current_tasks = 0;
                true
            } else {
                false
            }
        };

        if came_back {
            info!(agent_id = %agent_id, "Agent back online");
            self.events.publish(OrchestratorEvent::AgentOnline {
                agent_id: agent_id.to_string(),
            });
        }
        true
    }

    /// Set the live task count, clamped at zero. Busy if positive, else idle.
    pub async fn update_task_count(&self, agent_id: &str, count: i64) -> bool {
        let mut state = self.state.write().await;
        match state.agents.get_mut(agent_id) {
            Some(agent) => {
                apply_task_count(agent, count);
                true
            }
            None => false,
        }
    }

    /// Shift the live task count by `delta`. Returns the new count.
    pub async fn adjust_task_count(&self, agent_id: &str, delta: i64) -> Option<u32> {
        let mut state = self.state.write().await;
        let agent = state.agents.get_mut(agent_id)?;
        apply_task_count(agent, i64::from(agent.current_tasks) + delta);
        Some(agent.current_tasks)
    }

    /// Force a status, e.g. `Error` after an adapter reports a broken agent.
    pub async fn set_status(&self, agent_id: &str, status: AgentStatus) -> bool {
        let mut state = self.state.write().await;
        match state.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.status = status;
                true
            }
            None => false,
        }
    }

    /// Mark stale agents offline. Returns the ids that transitioned.
    pub async fn check_health(&self) -> Vec<String> {
        self.check_health_at(Utc::now()).await
    }

    /// [`Self::check_health`] against an explicit clock.
    ///
    /// Agents that are already offline are skipped, so each staleness period
    /// produces a single `AgentOffline` event.
    pub async fn check_health_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout())
            .unwrap_or_else(|_| chrono::Duration::days(36_500));

        let stale: Vec<String> = {
            let mut state = self.state.write().await;
            let mut stale = Vec::new();
            for agent in state.agents.values_mut() {
                if agent.is_offline() {
                    continue;
                }
                if now.signed_duration_since(agent.last_heartbeat) > timeout {
                    agent.status = AgentStatus::Offline;
                    agent.current_tasks = 0;
                    stale.push(agent.id.clone());
                }
            }
            stale
        };

        for agent_id in &stale {
            warn!(agent_id = %agent_id, "Agent heartbeat expired, marking offline");
            self.events.publish(OrchestratorEvent::AgentOffline {
                agent_id: agent_id.clone(),
            });
        }
        stale
    }

    /// Run [`Self::check_health`] every `health_check_interval` until aborted.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let directory = Arc::clone(self);
        let period = self.config.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let offline = directory.check_health().await;
                if !offline.is_empty() {
                    debug!(count = offline.len(), "Health check marked agents offline");
                }
            }
        })
    }

    /// Counters over registered agents and their capacity.
    pub async fn statistics(&self) -> DirectoryStats {
        let state = self.state.read().await;
        let mut stats = DirectoryStats {
            total_agents: state.agents.len(),
            ..DirectoryStats::default()
        };
        for agent in state.agents.values() {
            *stats.by_status.entry(agent.status).or_default() += 1;
            *stats.by_type.entry(agent.agent_type).or_default() += 1;
            if !agent.is_offline() {
                stats.total_capacity += u64::from(agent.max_concurrent_tasks);
                stats.active_tasks += u64::from(agent.current_tasks);
            }
        }
        stats
    }
}

fn validate_metadata(metadata: &AgentMetadata) -> ConductorResult<()> {
    if metadata.id.trim().is_empty() {
        return Err(ConductorError::Validation("agent id is required".into()));
    }
    if metadata.name.trim().is_empty() {
        return Err(ConductorError::Validation(format!(
            "agent '{}' has no name",
            metadata.id
        )));
    }
    if metadata.capabilities.is_empty() {
        return Err(ConductorError::Validation(format!(
            "agent '{}' declares no capabilities",
            metadata.id
        )));
    }
    if metadata
        .capabilities
        .iter()
        .any(|c| c.name.trim().is_empty())
    {
        return Err(ConductorError::Validation(format!(
            "agent '{}' declares a capability without a name",
            metadata.id
        )));
    }
    if metadata.max_concurrent_tasks == 0 {
        return Err(ConductorError::Validation(format!(
            "agent '{}' must accept at least one concurrent task",
            metadata.id
        )));
    }
    Ok(())
}

fn apply_task_count(agent: &mut Agent, count: i64) {
    agent.current_tasks = u32::try_from(count.max(0)).unwrap_or(u32::MAX);
    if agent.status == AgentStatus::Offline {
        return;
    }
    agent.status = if agent.current_tasks > 0 {
        AgentStatus::Busy
    } else {
        AgentStatus::Idle
    };
}

/// Rank `candidates` (already in registration order) and take the first.
fn select_best(candidates: Vec<Agent>, query: &AgentQuery) -> Option<Agent> {
    let mut eligible: Vec<Agent> = candidates
        .into_iter()
        .filter(Agent::has_capacity)
        .filter(|a| query.max_load.map_or(true, |max| a.load_ratio() <= max))
        .filter(|a| !query.exclude_agents.contains(&a.id))
        .collect();

    // `sort_by` is stable, so equal candidates keep registration order.
    eligible.sort_by(|a, b| {
        b.is_coordinator()
            .cmp(&a.is_coordinator())
            .then_with(|| {
                let a_pref = query.preferred_type == Some(a.agent_type);
                let b_pref = query.preferred_type == Some(b.agent_type);
                b_pref.cmp(&a_pref)
            })
            .then_with(|| a.load_ratio().total_cmp(&b.load_ratio()))
    });
    eligible.into_iter().next()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::Capability;

    fn meta(id: &str, agent_type: AgentType, cap: &str, max: u32) -> AgentMetadata {
        AgentMetadata::new(id, format!("Agent {id}"), agent_type)
            .with_capability(Capability::new(cap, "test"))
            .with_max_concurrent_tasks(max)
    }

    fn directory() -> AgentDirectory {
        AgentDirectory::new(DirectoryConfig::default(), EventHub::new(64))
    }

    #[tokio::test]
    async fn test_register_and_discover() {
        let dir = directory();
        dir.register(meta("a", AgentType::Specialist, "docs", 2))
            .await
            .unwrap();
        dir.register(meta("b", AgentType::Bridge, "docs", 2))
            .await
            .unwrap();
        dir.register(meta("c", AgentType::Specialist, "calendar", 2))
            .await
            .unwrap();

        let ids: Vec<String> = dir.discover("docs").await.into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(dir.discover_by_type(AgentType::Specialist).await.len(), 2);
        assert!(dir.discover("unknown").await.is_empty());
    }

    #[tokio::test]
    async fn test_register_validation() {
        let dir = directory();

        let err = dir
            .register(meta("", AgentType::Specialist, "docs", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Validation(_)));

        let err = dir
            .register(AgentMetadata::new("x", "X", AgentType::Specialist))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Validation(_)));

        let err = dir
            .register(meta("y", AgentType::Specialist, "docs", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_register_duplicate() {
        let dir = directory();
        dir.register(meta("a", AgentType::Specialist, "docs", 1))
            .await
            .unwrap();
        let err = dir
            .register(meta("a", AgentType::Specialist, "docs", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_register_type_ceiling() {
        let mut config = DirectoryConfig::default();
        config.max_agents_per_type.insert(AgentType::Coordinator, 1);
        let dir = AgentDirectory::new(config, EventHub::new(8));

        dir.register(meta("c1", AgentType::Coordinator, "plan", 1))
            .await
            .unwrap();
        let err = dir
            .register(meta("c2", AgentType::Coordinator, "plan", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Capacity(_)));
        dir.register(meta("s1", AgentType::Specialist, "plan", 1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let dir = directory();
        dir.register(meta("a", AgentType::Specialist, "docs", 1))
            .await
            .unwrap();
        assert!(dir.unregister("a").await);
        assert!(!dir.unregister("a").await);
        assert!(dir.discover("docs").await.is_empty());
        assert!(dir.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_best_agent_prefers_low_load() {
        let dir = directory();
        dir.register(meta("busy", AgentType::Specialist, "docs", 4))
            .await
            .unwrap();
        dir.register(meta("calm", AgentType::Specialist, "docs", 4))
            .await
            .unwrap();
        dir.update_task_count("busy", 3).await;
        dir.update_task_count("calm", 1).await;

        let best = dir.find_best_agent("docs", &AgentQuery::new()).await.unwrap();
        assert_eq!(best.id, "calm");
    }

    #[tokio::test]
    async fn test_best_agent_coordinator_first_regardless_of_load() {
        let dir = directory();
        dir.register(meta("spec", AgentType::Specialist, "docs", 10))
            .await
            .unwrap();
        dir.register(meta("coord", AgentType::Coordinator, "docs", 10))
            .await
            .unwrap();
        dir.update_task_count("coord", 9).await;

        let best = dir.find_best_agent("docs", &AgentQuery::new()).await.unwrap();
        assert_eq!(best.id, "coord");
    }

    #[tokio::test]
    async fn test_best_agent_skips_full_and_excluded() {
        let dir = directory();
        dir.register(meta("full", AgentType::Coordinator, "docs", 1))
            .await
            .unwrap();
        dir.register(meta("other", AgentType::Specialist, "docs", 1))
            .await
            .unwrap();
        dir.update_task_count("full", 1).await;

        let best = dir.find_best_agent("docs", &AgentQuery::new()).await.unwrap();
        assert_eq!(best.id, "other");

        let query = AgentQuery::new().excluding("other");
        assert!(dir.find_best_agent("docs", &query).await.is_none());
    }

    #[tokio::test]
    async fn test_best_agent_max_load_and_preferred_type() {
        let dir = directory();
        dir.register(meta("s", AgentType::Specialist, "docs", 4))
            .await
            .unwrap();
        dir.register(meta("b", AgentType::Bridge, "docs", 4))
            .await
            .unwrap();
        dir.update_task_count("s", 3).await;

        let best = dir
            .find_best_agent("docs", &AgentQuery::new().preferring(AgentType::Specialist))
            .await
            .unwrap();
        assert_eq!(best.id, "s");

        let best = dir
            .find_best_agent(
                "docs",
                &AgentQuery::new()
                    .preferring(AgentType::Specialist)
                    .with_max_load(0.5),
            )
            .await
            .unwrap();
        assert_eq!(best.id, "b");
    }

    #[tokio::test]
    async fn test_find_for_any_uses_declared_order() {
        let dir = directory();
        dir.register(meta("cal", AgentType::Specialist, "calendar", 1))
            .await
            .unwrap();
        dir.register(meta("doc", AgentType::Specialist, "docs", 1))
            .await
            .unwrap();

        let caps = vec!["missing".to_string(), "docs".to_string(), "calendar".to_string()];
        let (agent, cap) = dir
            .find_best_agent_for_any(&caps, &AgentQuery::new())
            .await
            .unwrap();
        assert_eq!(agent.id, "doc");
        assert_eq!(cap, "docs");
    }

    #[tokio::test]
    async fn test_reserve_without_capabilities_ranks_every_agent() {
        let dir = directory();
        dir.register(meta("busy", AgentType::Specialist, "docs", 2))
            .await
            .unwrap();
        dir.register(meta("free", AgentType::Bridge, "calendar", 2))
            .await
            .unwrap();
        dir.update_task_count("busy", 1).await;

        let (best, matched) = dir.reserve(&[], &AgentQuery::new()).await.unwrap();
        assert_eq!(best.id, "free");
        assert!(matched.is_none());
        assert!(dir
            .reserve(&[], &AgentQuery::new().excluding("free").with_max_load(0.4))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_reserve_claims_slot_and_reports_capability() {
        let dir = directory();
        dir.register(meta("doc", AgentType::Specialist, "docs", 1))
            .await
            .unwrap();

        let caps = vec!["missing".to_string(), "docs".to_string()];
        let (agent, matched) = dir.reserve(&caps, &AgentQuery::new()).await.unwrap();
        assert_eq!(agent.id, "doc");
        assert_eq!(agent.current_tasks, 1);
        assert_eq!(agent.status, AgentStatus::Busy);
        assert_eq!(matched.as_deref(), Some("docs"));

        assert!(dir.reserve(&caps, &AgentQuery::new()).await.is_none());
        assert!(dir.reserve(&[], &AgentQuery::new()).await.is_none());
        dir.adjust_task_count("doc", -1).await;
        let (_, matched) = dir.reserve(&[], &AgentQuery::new()).await.unwrap();
        assert!(matched.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reserve_never_oversubscribes() {
        let dir = Arc::new(directory());
        dir.register(meta("solo", AgentType::Specialist, "docs", 1))
            .await
            .unwrap();

        let caps = vec!["docs".to_string()];
        let mut handles = Vec::new();
        for _ in 0..16 {
            let dir = Arc::clone(&dir);
            let caps = caps.clone();
            handles.push(tokio::spawn(async move {
                dir.reserve(&caps, &AgentQuery::new()).await.is_some()
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
        assert_eq!(dir.get("solo").await.unwrap().current_tasks, 1);
    }

    #[tokio::test]
    async fn test_task_count_clamps_and_sets_status() {
        let dir = directory();
        dir.register(meta("a", AgentType::Specialist, "docs", 3))
            .await
            .unwrap();

        dir.update_task_count("a", 2).await;
        assert_eq!(dir.get("a").await.unwrap().status, AgentStatus::Busy);

        dir.update_task_count("a", -5).await;
        let agent = dir.get("a").await.unwrap();
        assert_eq!(agent.current_tasks, 0);
        assert_eq!(agent.status, AgentStatus::Idle);

        assert_eq!(dir.adjust_task_count("a", 1).await, Some(1));
        assert_eq!(dir.adjust_task_count("a", -3).await, Some(0));
        assert!(!dir.update_task_count("ghost", 1).await);
    }

    #[tokio::test]
    async fn test_stale_agent_marked_offline_once() {
        let events = EventHub::new(16);
        let mut rx = events.subscribe();
        let dir = AgentDirectory::new(DirectoryConfig::default(), events);
        dir.register(meta("a", AgentType::Specialist, "docs", 2))
            .await
            .unwrap();
        let _ = rx.recv().await.unwrap(); // registered

        dir.update_task_count("a", 1).await;
        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(dir.check_health_at(later).await, vec!["a".to_string()]);
        assert!(dir.check_health_at(later).await.is_empty());

        let agent = dir.get("a").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);
        assert_eq!(agent.current_tasks, 0);
        assert!(dir.discover("docs").await.is_empty());
        assert_eq!(
            rx.recv().await.unwrap(),
            OrchestratorEvent::AgentOffline {
                agent_id: "a".into()
            }
        );
        assert!(rx.try_recv().is_err());

        // Heartbeat brings it back.
        assert!(dir.update_heartbeat_at("a", later).await);
        assert_eq!(dir.get("a").await.unwrap().status, AgentStatus::Idle);
        assert_eq!(dir.discover("docs").await.len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_agent_stays_online() {
        let dir = directory();
        dir.register(meta("a", AgentType::Specialist, "docs", 1))
            .await
            .unwrap();
        let soon = Utc::now() + chrono::Duration::seconds(30);
        assert!(dir.check_health_at(soon).await.is_empty());
    }

    #[tokio::test]
    async fn test_statistics() {
        let dir = directory();
        dir.register(meta("a", AgentType::Specialist, "docs", 2))
            .await
            .unwrap();
        dir.register(meta("b", AgentType::Monitor, "watch", 3))
            .await
            .unwrap();
        dir.update_task_count("a", 1).await;

        let stats = dir.statistics().await;
        assert_eq!(stats.total_agents, 2);
        assert_eq!(stats.total_capacity, 5);
        assert_eq!(stats.active_tasks, 1);
        assert_eq!(stats.by_status.get(&AgentStatus::Busy), Some(&1));
        assert_eq!(stats.by_type.get(&AgentType::Monitor), Some(&1));
    }
}
