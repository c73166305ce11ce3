//! In-memory shape of a parsed, validated workflow definition: the step
//! tree, input/state schema, and sub-agent task templates.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{InputFieldSchema, StateSchema, UpdateOperation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    #[default]
    Fail,
    Retry,
    Continue,
    Fallback,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default)]
    pub strategy: ErrorStrategy,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub fallback_value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    #[default]
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Lines,
    Json,
    KeyValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShellOnError {
    #[default]
    Fail,
    Continue,
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserInputType {
    #[default]
    String,
    Number,
    Boolean,
    Choice,
}

/// How a `parallel_foreach` fan-out reacts to a failed child (spec.md §7,
/// "SubAgentError"/"Propagation policy").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnSubAgentError {
    /// Record the failure and let the remaining children's results stand.
    #[default]
    Continue,
    /// Re-run each failed child once before falling back to `continue`'s
    /// behaviour for any that fail again.
    RetryFailed,
    /// Any failed child fails the whole `parallel_foreach` step (and the
    /// instance, via the step's ordinary error propagation).
    FailAll,
}

/// Where a step's result is written — the path expression is parsed with
/// [`crate::state::parse_scope_path`] at validation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateUpdate {
    pub path: String,
    #[serde(default)]
    pub operation: UpdateOperation,
    /// Expression source. Shell commands additionally bind a `result` local
    /// (the parsed stdout) that this expression may reference.
    pub value: String,
}

impl Default for StateUpdate {
    fn default() -> Self {
        StateUpdate { path: String::new(), operation: UpdateOperation::Set, value: "result".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    UserMessage {
        id: String,
        message: String,
    },
    UserInput {
        id: String,
        message: String,
        #[serde(default)]
        input_type: UserInputType,
        #[serde(default)]
        choices: Vec<String>,
        #[serde(default)]
        state_update: Option<StateUpdate>,
    },
    McpCall {
        id: String,
        tool: String,
        #[serde(default)]
        params: Value,
        #[serde(default)]
        state_update: Option<StateUpdate>,
    },
    AgentPrompt {
        id: String,
        prompt: String,
        #[serde(default)]
        state_update: Option<StateUpdate>,
    },
    AgentResponse {
        id: String,
        message: String,
        #[serde(default)]
        state_update: Option<StateUpdate>,
    },
    ShellCommand {
        id: String,
        command: String,
        #[serde(default)]
        working_directory: Option<String>,
        #[serde(default)]
        execution_context: ExecutionContext,
        #[serde(default)]
        output_format: OutputFormat,
        #[serde(default)]
        state_update: Option<StateUpdate>,
        #[serde(default)]
        on_error: ShellOnError,
        #[serde(default)]
        retry_count: u32,
        #[serde(default)]
        timeout_seconds: Option<u64>,
    },
    WaitStep {
        id: String,
        #[serde(default)]
        message: Option<String>,
    },
    ParallelForeach {
        id: String,
        items: String,
        sub_agent_task: String,
        #[serde(default)]
        max_parallel: Option<usize>,
        #[serde(default = "default_true")]
        wait_for_all: bool,
        #[serde(default)]
        timeout_seconds: Option<u64>,
        #[serde(default)]
        on_sub_agent_error: OnSubAgentError,
    },
    Conditional {
        id: String,
        condition: String,
        #[serde(default)]
        then_steps: Vec<Step>,
        #[serde(default)]
        else_steps: Vec<Step>,
        #[serde(default)]
        error_handling: Option<ErrorHandling>,
    },
    WhileLoop {
        id: String,
        condition: String,
        #[serde(default)]
        body: Vec<Step>,
        #[serde(default)]
        max_iterations: Option<u32>,
        #[serde(default)]
        error_handling: Option<ErrorHandling>,
    },
    Foreach {
        id: String,
        items: String,
        #[serde(default = "default_item_var")]
        variable_name: String,
        #[serde(default)]
        body: Vec<Step>,
        #[serde(default)]
        error_handling: Option<ErrorHandling>,
    },
    Break {
        id: String,
    },
    Continue {
        id: String,
    },
}

fn default_true() -> bool {
    true
}

fn default_item_var() -> String {
    "item".to_string()
}

impl Step {
    pub fn id(&self) -> &str {
        match self {
            Step::UserMessage { id, .. }
            | Step::UserInput { id, .. }
            | Step::McpCall { id, .. }
            | Step::AgentPrompt { id, .. }
            | Step::AgentResponse { id, .. }
            | Step::ShellCommand { id, .. }
            | Step::WaitStep { id, .. }
            | Step::ParallelForeach { id, .. }
            | Step::Conditional { id, .. }
            | Step::WhileLoop { id, .. }
            | Step::Foreach { id, .. }
            | Step::Break { id }
            | Step::Continue { id } => id,
        }
    }

    /// Whether this step is a server-internal atomic step (see spec §3:
    /// "Server-internal" variants), i.e. it is dispatched to the Dispatcher
    /// only as the classification `immediate`.
    pub fn is_server_internal(&self) -> bool {
        matches!(
            self,
            Step::Conditional { .. }
                | Step::WhileLoop { .. }
                | Step::Foreach { .. }
                | Step::Break { .. }
                | Step::Continue { .. }
        ) || matches!(self, Step::ShellCommand { execution_context: ExecutionContext::Server, .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentTaskDefinition {
    #[serde(default)]
    pub inputs: Vec<InputFieldSchema>,
    #[serde(default)]
    pub default_state: Value,
    #[serde(default)]
    pub state_schema: StateSchema,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub prompt_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub inputs: Vec<InputFieldSchema>,
    #[serde(default)]
    pub default_state: Value,
    #[serde(default)]
    pub state_schema: StateSchema,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub sub_agent_tasks: HashMap<String, SubAgentTaskDefinition>,
    /// Absolute path this definition was loaded from, if any.
    #[serde(skip)]
    pub source_path: Option<String>,
}
