//! Step Queue / Dispatcher: classifies emitted atomic steps and answers the
//! agent's `get_next_step` / `step_complete` calls (spec.md §4.E).
//!
//! The dispatcher holds its pending-step slot behind the same per-instance
//! mutex as the Interpreter — they are two facets of one instance-owned
//! object here, mirroring the teacher's single-file `supervisor.rs` holding
//! both command execution and event classification together.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// The wire discriminator of an [`AtomicStep`] — distinct from [`super::definition::Step`],
/// which is the richer, pre-emission step-tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomicStepKind {
    ShellCommand,
    /// Reserved alias carried for wire compatibility; this engine always
    /// emits `ShellCommand` for a client-executed shell step.
    AgentShellCommand,
    StateUpdate,
    McpCall,
    /// Reserved for wire compatibility. This engine resolves `parallel_foreach`
    /// fan-out internally (see `subagent::SubAgentCoordinator`) rather than
    /// delegating child-process spawning to the client, so it is never
    /// currently emitted.
    ParallelTasks,
    UserMessage,
    UserInput,
    Wait,
}

impl AtomicStepKind {
    /// Whether `step_complete` is required to clear this step, per the
    /// classification table in spec.md §4.E.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, AtomicStepKind::Wait)
    }
}

/// What `get_next_step` returns to the agent: spec.md §3, "AtomicStep".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicStep {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AtomicStepKind,
    pub instructions: String,
    pub definition: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_replacements: Option<Value>,
}

/// Holds the current pending step (if any) between a `get_next_step` that
/// produced it and the `step_complete` that clears it, plus an in-progress
/// `user_message` coalescing batch.
#[derive(Debug, Default)]
pub struct Dispatcher {
    pending: Option<AtomicStep>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher::default()
    }

    pub fn pending(&self) -> Option<&AtomicStep> {
        self.pending.as_ref()
    }

    pub fn hold(&mut self, step: AtomicStep) {
        self.pending = Some(step);
    }

    /// `wait` steps are cleared automatically by the next `get_next_step`
    /// rather than by an explicit `step_complete` (spec.md §4.E, "wait").
    pub fn take_if_wait(&mut self) -> Option<AtomicStep> {
        if self.pending.as_ref().map(|s| s.kind) == Some(AtomicStepKind::Wait) {
            self.pending.take()
        } else {
            None
        }
    }

    /// Validate and clear a `step_complete(step_id)` call against the
    /// pending step.
    pub fn complete(&mut self, step_id: &str) -> Result<AtomicStep> {
        match &self.pending {
            Some(p) if p.id == step_id => Ok(self.pending.take().unwrap()),
            Some(p) => Err(EngineError::Protocol(format!(
                "step_complete id '{step_id}' does not match pending step '{}'",
                p.id
            ))),
            None => Err(EngineError::Protocol(format!(
                "step_complete id '{step_id}' but no step is pending"
            ))),
        }
    }
}

/// Coalesce a run of consecutive `user_message` atomic steps from the same
/// emission burst into one, per spec.md §4.E's `batch` classification. The
/// interpreter only ever emits one atomic step per `drive()` call, so the
/// caller supplies the look-ahead buffer it collected itself.
pub fn coalesce_user_messages(messages: Vec<AtomicStep>) -> Option<AtomicStep> {
    if messages.is_empty() {
        return None;
    }
    if messages.len() == 1 {
        return messages.into_iter().next();
    }
    let id = messages[0].id.clone();
    let texts: Vec<Value> = messages.iter().map(|m| Value::String(m.instructions.clone())).collect();
    let instructions = messages.iter().map(|m| m.instructions.as_str()).collect::<Vec<_>>().join("\n");
    Some(AtomicStep {
        id,
        kind: AtomicStepKind::UserMessage,
        instructions,
        definition: serde_json::json!({ "messages": texts }),
        variable_replacements: None,
    })
}
