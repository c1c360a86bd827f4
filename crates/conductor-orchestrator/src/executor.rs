//! Seams to the collaborators that actually perform work.
//!
//! The core never talks to a remote platform itself. A host application
//! supplies a [`TaskExecutor`] that runs a task on an agent (for example by
//! calling a document or calendar API) and, optionally, a [`ToolHints`]
//! table used to annotate dispatch messages.

use crate::types::{Agent, Task};
use async_trait::async_trait;
use conductor_core::ConductorResult;

/// Performs a task on a chosen agent.
///
/// Implementations may be called again for the same task after a timeout,
/// since the core does not cancel remote work. The dispatch id passed in the
/// bus request (`correlation_id`) can serve as an idempotency key.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run `task` on `agent` and return its result value.
    async fn execute(&self, task: &Task, agent: &Agent) -> ConductorResult<serde_json::Value>;
}

/// Maps required capabilities to suggested low-level operation names.
///
/// Purely advisory; the core forwards the result in dispatch payloads.
pub trait ToolHints: Send + Sync {
    /// Operation names worth suggesting for `capabilities`.
    fn recommend(&self, capabilities: &[String]) -> Vec<String>;
}

/// Keyword table covering the document, calendar and messaging specialists.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultToolHints;

const HINT_TABLE: &[(&str, &[&str])] = &[
    ("document", &["create_document", "get_document", "update_document"]),
    ("doc", &["create_document", "get_document"]),
    ("sheet", &["create_spreadsheet", "update_cells"]),
    ("calendar", &["create_event", "list_events", "update_event"]),
    ("meeting", &["create_event", "find_free_time"]),
    ("message", &["send_message", "list_messages"]),
    ("chat", &["send_message", "create_chat"]),
    ("notify", &["send_message"]),
    ("search", &["search"]),
    ("user", &["get_user", "list_users"]),
];

impl ToolHints for DefaultToolHints {
    fn recommend(&self, capabilities: &[String]) -> Vec<String> {
        let mut tools: Vec<String> = Vec::new();
        for capability in capabilities {
            let lower = capability.to_lowercase();
            for (keyword, names) in HINT_TABLE {
                if lower.contains(keyword) {
                    for name in *names {
                        if !tools.iter().any(|t| t == name) {
                            tools.push((*name).to_string());
                        }
                    }
                }
            }
        }
        tools
    }
}
