use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult};
use conductor_orchestrator::{Agent, Task, TaskExecutor};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

/// Stands in for real agents: sleeps `estimated_duration × time_scale`
/// and fails the tasks it was told to.
pub struct SimulatedExecutor {
    time_scale: Duration,
    failing: HashSet<String>,
}

impl SimulatedExecutor {
    pub fn new(time_scale: Duration, failing: HashSet<String>) -> Self {
        Self {
            time_scale,
            failing,
        }
    }

    /// How long to sleep for `task`, and that length in whole milliseconds saturated to `u64::MAX`.
    fn nap_for(&self, task: &Task) -> (Duration, u64) {
        let factor = u32::try_from(task.estimated_duration).unwrap_or(u32::MAX);
        let nap = self.time_scale.saturating_mul(factor);
        (nap, u64::try_from(nap.as_millis()).unwrap_or(u64::MAX))
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, task: &Task, agent: &Agent) -> ConductorResult<serde_json::Value> {
        let (nap, sleep_ms) = self.nap_for(task);
        debug!(task_id = %task.id, agent_id = %agent.id, sleep_ms, "Simulating task");
        tokio::time::sleep(nap).await;

        if self.failing.contains(&task.id) {
            return Err(ConductorError::Executor(format!(
                "simulated failure of '{}'",
                task.id
            )));
        }
        Ok(serde_json::json!({
            "task": task.id,
            "agent": agent.id,
            "simulated_ms": sleep_ms,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_orchestrator::{AgentMetadata, AgentType, TaskSpec};

    fn agent() -> Agent {
        Agent::from_metadata(
            AgentMetadata::new("sim", "Simulator", AgentType::Specialist),
            chrono::Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_success_and_scripted_failure() {
        let executor = SimulatedExecutor::new(
            Duration::from_millis(1),
            HashSet::from(["bad".to_string()]),
        );

        let ok = Task::from_spec(TaskSpec::new("good").with_id("good").with_duration(2));
        let value = executor.execute(&ok, &agent()).await.unwrap();
        assert_eq!(value["task"], "good");
        assert_eq!(value["simulated_ms"], 2);

        let bad = Task::from_spec(TaskSpec::new("bad").with_id("bad").with_duration(0));
        assert!(matches!(
            executor.execute(&bad, &agent()).await,
            Err(ConductorError::Executor(_))
        ));
    }

    #[test]
    fn test_huge_time_scale_saturates_reported_millis() {
        let executor = SimulatedExecutor::new(Duration::MAX, HashSet::new());
        let task = Task::from_spec(TaskSpec::new("long").with_id("long").with_duration(3));
        let (nap, sleep_ms) = executor.nap_for(&task);
        assert_eq!(nap, Duration::MAX);
        assert_eq!(sleep_ms, u64::MAX);
    }
}
