use crate::types::AgentType;
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level orchestrator configuration, usually loaded from `conductor.toml`.
///
/// Every section and field is optional; missing values fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Agent directory settings.
    #[serde(default)]
    pub directory: DirectoryConfig,
    /// Task coordinator settings.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// Execution engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Event stream settings.
    #[serde(default)]
    pub events: EventsConfig,
}

impl OrchestratorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> ConductorResult<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| ConductorError::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ConductorResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject values that would stall or panic the runtime.
    pub fn validate(&self) -> ConductorResult<()> {
        if self.directory.heartbeat_timeout_secs == 0 {
            return Err(ConductorError::Config(
                "directory.heartbeat_timeout_secs must be > 0".into(),
            ));
        }
        if self.directory.health_check_interval_secs == 0 {
            return Err(ConductorError::Config(
                "directory.health_check_interval_secs must be > 0".into(),
            ));
        }
        if self.coordinator.max_attempts == 0 {
            return Err(ConductorError::Config(
                "coordinator.max_attempts must be > 0".into(),
            ));
        }
        if self.coordinator.task_timeout_ms == 0 || self.engine.default_timeout_ms == 0 {
            return Err(ConductorError::Config("task timeouts must be > 0".into()));
        }
        if self.coordinator.processing_interval_ms == 0 {
            return Err(ConductorError::Config(
                "coordinator.processing_interval_ms must be > 0".into(),
            ));
        }
        if self.engine.max_concurrent_tasks == 0 {
            return Err(ConductorError::Config(
                "engine.max_concurrent_tasks must be > 0".into(),
            ));
        }
        if self.events.capacity == 0 {
            return Err(ConductorError::Config("events.capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// Agent directory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Heartbeat age after which an agent is marked offline.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Seconds between two liveness sweeps.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    /// Optional per-type registration ceilings. Types not listed are unbounded.
    #[serde(default)]
    pub max_agents_per_type: HashMap<AgentType, usize>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            health_check_interval_secs: default_health_check_interval(),
            max_agents_per_type: HashMap::new(),
        }
    }
}

impl DirectoryConfig {
    /// `heartbeat_timeout_secs` as a [`Duration`].
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// `health_check_interval_secs` as a [`Duration`].
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Task coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Total dispatch attempts per task, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wait before a failed task becomes dispatchable again.
    #[serde(default = "default_coordinator_retry_delay")]
    pub retry_delay_ms: u64,
    /// Time an agent has to report a dispatch.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_ms: u64,
    /// Period of the background queue pass.
    #[serde(default = "default_processing_interval")]
    pub processing_interval_ms: u64,
    /// Sender id stamped on dispatch messages.
    #[serde(default = "default_dispatcher_id")]
    pub dispatcher_id: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_coordinator_retry_delay(),
            task_timeout_ms: default_task_timeout(),
            processing_interval_ms: default_processing_interval(),
            dispatcher_id: default_dispatcher_id(),
        }
    }
}

impl CoordinatorConfig {
    /// Retry delay as a [`Duration`].
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Dispatch timeout as a [`Duration`].
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Queue pass period as a [`Duration`].
    pub fn processing_interval(&self) -> Duration {
        Duration::from_millis(self.processing_interval_ms)
    }
}

/// Execution engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Size of the engine-wide concurrency limiter.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    /// Retries per node unless a plan overrides it.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Per-attempt timeout unless a plan overrides it.
    #[serde(default = "default_task_timeout")]
    pub default_timeout_ms: u64,
    /// Pause between two attempts on the same node.
    #[serde(default = "default_engine_retry_delay")]
    pub retry_delay_ms: u64,
    /// Sender id stamped on dispatch messages.
    #[serde(default = "default_dispatcher_id")]
    pub dispatcher_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent(),
            default_max_retries: default_max_retries(),
            default_timeout_ms: default_task_timeout(),
            retry_delay_ms: default_engine_retry_delay(),
            dispatcher_id: default_dispatcher_id(),
        }
    }
}

impl EngineConfig {
    /// Default per-attempt timeout as a [`Duration`].
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Retry pause as a [`Duration`].
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Event stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast buffer; slow subscribers lag past this many events.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

fn default_heartbeat_timeout() -> u64 {
    60
}
fn default_health_check_interval() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_coordinator_retry_delay() -> u64 {
    5_000
}
fn default_task_timeout() -> u64 {
    300_000
}
fn default_processing_interval() -> u64 {
    1_000
}
fn default_dispatcher_id() -> String {
    "conductor".to_string()
}
fn default_max_concurrent() -> usize {
    3
}
fn default_max_retries() -> u32 {
    3
}
fn default_engine_retry_delay() -> u64 {
    1_000
}
fn default_event_capacity() -> usize {
    256
}
