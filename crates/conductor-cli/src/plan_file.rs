use conductor_orchestrator::{AgentMetadata, AgentType, Capability, TaskSpec};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// A plan file: agents to register plus the tasks to run.
///
/// ```toml
/// name = "onboarding"
///
/// [[agents]]
/// id = "docs"
/// type = "specialist"
/// capabilities = ["document_create"]
///
/// [[tasks]]
/// id = "draft"
/// name = "Draft welcome doc"
/// required_capabilities = ["document_create"]
/// estimated_duration = 30
/// ```
#[derive(Debug, Deserialize)]
pub struct PlanFile {
    pub name: String,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

#[derive(Debug, Deserialize)]
pub struct AgentEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default = "default_agent_type")]
    pub agent_type: AgentType,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: u32,
}

#[derive(Debug, Deserialize)]
pub struct TaskEntry {
    #[serde(flatten)]
    pub spec: TaskSpec,
    /// Make the simulated executor fail every attempt.
    #[serde(default)]
    pub fail: bool,
}

fn default_agent_type() -> AgentType {
    AgentType::Specialist
}

fn default_max_concurrent() -> u32 {
    3
}

impl PlanFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read plan file '{}': {}", path.display(), e)
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let file: Self = toml::from_str(raw)?;
        Ok(file)
    }

    pub fn agent_metadata(&self) -> Vec<AgentMetadata> {
        self.agents
            .iter()
            .map(|entry| {
                let name = entry.name.clone().unwrap_or_else(|| entry.id.clone());
                entry.capabilities.iter().fold(
                    AgentMetadata::new(entry.id.clone(), name, entry.agent_type)
                        .with_max_concurrent_tasks(entry.max_concurrent_tasks),
                    |meta, cap| meta.with_capability(Capability::new(cap.clone(), "plan")),
                )
            })
            .collect()
    }

    /// Task specs with ids filled in from names where missing, so plan
    /// output and `fail` flags refer to stable ids.
    pub fn task_specs(&self) -> Vec<TaskSpec> {
        self.tasks
            .iter()
            .map(|entry| {
                let mut spec = entry.spec.clone();
                if spec.id.is_none() {
                    spec.id = Some(spec.name.clone());
                }
                spec
            })
            .collect()
    }

    pub fn failing_ids(&self) -> HashSet<String> {
        self.tasks
            .iter()
            .filter(|entry| entry.fail)
            .map(|entry| entry.spec.id.clone().unwrap_or_else(|| entry.spec.name.clone()))
            .collect()
    }
}
