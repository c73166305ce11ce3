//! One running workflow: the glue between the Interpreter, the Dispatcher,
//! and the State Store, behind a single per-instance lock (spec.md §4.E,
//! "ambient note" — one workflow instance is one serialized stream of
//! `get_next_step`/`step_complete` calls).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use chrono::Utc;

use crate::config::DefaultsConfig;
use crate::error::{EngineError, Result};
use crate::observability::WorkflowErrorRecord;
use crate::state::{StateSnapshot, StateStore, UpdateOp, UpdateOperation};
use crate::subagent::{EchoDriver, SubAgentCoordinator, SubAgentDriver, SubAgentOutcome};

use super::definition::{OnSubAgentError, WorkflowDefinition};
use super::dispatcher::{AtomicStep, Dispatcher};
use super::interpreter::{
    apply_result_state_update, find_state_update, DriveOutcome, FrameCheckpoint, Interpreter, ParallelForeachRequest,
    StepEmission,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

/// Persistable representation of a [`WorkflowInstance`], per spec.md §6
/// `workflow.checkpoint`/`workflow.resume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointV1 {
    pub version: u32,
    pub workflow_name: String,
    pub workflow_version: String,
    pub status: InstanceStatus,
    pub frames: Vec<FrameCheckpoint>,
    pub state: StateSnapshot,
    pub pending: Option<AtomicStep>,
    pub debug_serial: bool,
}

pub struct WorkflowInstance {
    definition: Arc<WorkflowDefinition>,
    interpreter: Interpreter,
    dispatcher: Dispatcher,
    state: StateStore,
    status: InstanceStatus,
    cfg: Arc<DefaultsConfig>,
    debug_serial: bool,
    sub_agent_driver: Arc<dyn SubAgentDriver>,
    errors: Vec<WorkflowErrorRecord>,
}

impl WorkflowInstance {
    /// `debug_serial` is OR'd with the `AROMCP_WORKFLOW_DEBUG=serial`
    /// environment variable, observed once here at instance start (spec.md
    /// §4.F, "observed at instance start") rather than on every drive.
    pub fn start(definition: Arc<WorkflowDefinition>, inputs: Value, cfg: Arc<DefaultsConfig>, debug_serial: bool) -> Result<Self> {
        let debug_serial = debug_serial || std::env::var("AROMCP_WORKFLOW_DEBUG").as_deref() == Ok("serial");
        let state = StateStore::initialise(definition.state_schema.clone(), definition.default_state.clone(), inputs)?;
        let interpreter = Interpreter::new(definition.steps.clone().into());
        Ok(WorkflowInstance {
            definition,
            interpreter,
            dispatcher: Dispatcher::new(),
            state,
            status: InstanceStatus::Pending,
            cfg,
            debug_serial,
            sub_agent_driver: Arc::new(EchoDriver),
            errors: Vec::new(),
        })
    }

    /// Inject a non-default sub-agent driver for real (non-debug-serial)
    /// `parallel_foreach` fan-out — e.g. a harness that re-exposes each
    /// child's atomic steps back out through its own agent protocol instead
    /// of auto-resolving them.
    pub fn with_sub_agent_driver(mut self, driver: Arc<dyn SubAgentDriver>) -> Self {
        self.sub_agent_driver = driver;
        self
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn errors(&self) -> &[WorkflowErrorRecord] {
        &self.errors
    }

    /// `workflow.pause`: freeze advancement. Valid from `Pending` (never
    /// driven yet) or `Running` — a suspended (client-step-pending) instance
    /// is already not advancing on its own, but `get_next_step` still
    /// refuses to drive it further once paused.
    pub fn pause(&mut self) -> Result<()> {
        if !matches!(self.status, InstanceStatus::Pending | InstanceStatus::Running) {
            return Err(EngineError::Protocol(format!(
                "cannot pause instance in status {:?}, expected pending or running",
                self.status
            )));
        }
        self.status = InstanceStatus::Paused;
        Ok(())
    }

    /// `workflow.resume(id)`: unfreeze a paused instance.
    pub fn unpause(&mut self) -> Result<()> {
        if self.status != InstanceStatus::Paused {
            return Err(EngineError::Protocol(format!(
                "cannot resume instance in status {:?}, expected paused",
                self.status
            )));
        }
        self.status = InstanceStatus::Running;
        Ok(())
    }

    /// `workflow.complete(id, status)`: let the caller force a terminal
    /// status (e.g. marking an abandoned instance `Failed`) ahead of
    /// collecting its final state.
    pub fn force_status(&mut self, status: InstanceStatus) {
        self.status = status;
    }

    pub fn workflow_name(&self) -> &str {
        &self.definition.name
    }

    pub fn state_value(&self, paths: Option<&[String]>) -> Value {
        self.state.read(paths)
    }

    pub fn update_state(&mut self, ops: &[UpdateOp]) -> Result<()> {
        self.state.update(ops)
    }

    /// `workflow_state.dependencies`.
    pub fn dependencies(&self, field_name: &str) -> Result<crate::state::DependencyInfo> {
        self.state.dependencies(field_name)
    }

    pub fn pending_step(&self) -> Option<&AtomicStep> {
        self.dispatcher.pending()
    }

    /// `workflow.get_next_step`: drive the interpreter until a client-visible
    /// step is ready, resolving any `parallel_foreach` synchronously first.
    pub async fn get_next_step(&mut self) -> Result<Option<AtomicStep>> {
        if self.status == InstanceStatus::Completed {
            return Ok(None);
        }
        if self.status == InstanceStatus::Paused {
            return Err(EngineError::Protocol("workflow instance is paused".to_string()));
        }
        if self.status == InstanceStatus::Pending {
            self.status = InstanceStatus::Running;
        }
        if let Some(step) = self.dispatcher.take_if_wait() {
            tracing::debug!(step_id = %step.id, "auto-clearing wait step");
        }
        if let Some(pending) = self.dispatcher.pending() {
            return Ok(Some(pending.clone()));
        }

        loop {
            match self.interpreter.drive(&mut self.state, &self.definition.sub_agent_tasks, &self.cfg, self.debug_serial).await {
                Ok(DriveOutcome::Complete) => {
                    self.status = InstanceStatus::Completed;
                    return Ok(None);
                }
                Ok(DriveOutcome::Emit(StepEmission::Atomic(step))) => {
                    self.dispatcher.hold(step.clone());
                    if let Some(w) = self.dispatcher.take_if_wait() {
                        return Ok(Some(w));
                    }
                    return Ok(Some(step));
                }
                Ok(DriveOutcome::Emit(StepEmission::ParallelForeach(req))) => {
                    self.run_parallel_foreach(req).await?;
                    continue;
                }
                Err(e) => {
                    self.status = InstanceStatus::Failed;
                    let step_id = self.dispatcher.pending().map(|s| s.id.clone()).unwrap_or_default();
                    self.errors.push(WorkflowErrorRecord {
                        step_id,
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                        occurred_at: Utc::now(),
                    });
                    return Err(e);
                }
            }
        }
    }

    /// `workflow.step_complete`: apply the reported result to the pending
    /// step's `state_update` (if any) and clear it.
    pub fn step_complete(&mut self, step_id: &str, result: Value) -> Result<()> {
        let pending = self.dispatcher.complete(step_id)?;
        if let Some(su) = find_state_update(&self.definition.steps, &pending.id) {
            apply_result_state_update(su, result, &mut self.state)?;
        }
        Ok(())
    }

    async fn run_parallel_foreach(&mut self, req: ParallelForeachRequest) -> Result<()> {
        let task = self.definition.sub_agent_tasks.get(&req.sub_agent_task).ok_or_else(|| {
            EngineError::InvalidWorkflowDefinition(format!("unknown sub_agent_task '{}'", req.sub_agent_task))
        })?;
        let input_name = task.inputs.first().map(|f| f.name.clone()).unwrap_or_else(|| "item".to_string());
        let max_parallel = req.max_parallel.unwrap_or(self.cfg.max_parallel_default);
        let timeout = req
            .timeout_seconds
            .or(Some(self.cfg.agent_task_timeout_seconds))
            .map(Duration::from_secs);

        let coordinator = SubAgentCoordinator::new(max_parallel);
        let mut outcomes = coordinator
            .run_all(task, &input_name, req.items.clone(), self.sub_agent_driver.clone(), timeout, &self.cfg)
            .await;

        if req.on_sub_agent_error == OnSubAgentError::RetryFailed {
            let retry_indices: Vec<usize> = outcomes
                .iter()
                .enumerate()
                .filter(|(_, o)| matches!(o, SubAgentOutcome::Failed(_)))
                .map(|(i, _)| i)
                .collect();
            if !retry_indices.is_empty() {
                let retry_items: Vec<Value> = retry_indices.iter().map(|&i| req.items[i].clone()).collect();
                let retry_outcomes = coordinator
                    .run_all(task, &input_name, retry_items, self.sub_agent_driver.clone(), timeout, &self.cfg)
                    .await;
                for (idx, outcome) in retry_indices.into_iter().zip(retry_outcomes.into_iter()) {
                    outcomes[idx] = outcome;
                }
            }
        }

        let mut failures: Vec<Value> = Vec::new();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                SubAgentOutcome::Completed(v) => {
                    let path = format!("this.sub_agent_results.{}.{}", req.step_id, index);
                    self.state.update(&[UpdateOp { path, operation: UpdateOperation::Set, value: v }])?;
                }
                SubAgentOutcome::Failed(message) => {
                    failures.push(json!({ "index": index, "message": message }));
                }
            }
        }

        if !failures.is_empty() {
            let failure_count = failures.len();
            // Surfaced regardless of strategy (spec.md §7).
            let path = format!("this.sub_agent_errors.{}", req.sub_agent_task);
            self.state.update(&[UpdateOp { path, operation: UpdateOperation::Set, value: Value::Array(failures) }])?;
            tracing::warn!(step_id = %req.step_id, failures = failure_count, "parallel_foreach had failing children");

            if req.on_sub_agent_error == OnSubAgentError::FailAll {
                return Err(EngineError::SubAgent(format!(
                    "parallel_foreach '{}': {} of {} children failed",
                    req.step_id,
                    failure_count,
                    req.items.len()
                )));
            }
        }
        Ok(())
    }

    pub fn checkpoint(&self) -> CheckpointV1 {
        CheckpointV1 {
            version: 1,
            workflow_name: self.definition.name.clone(),
            workflow_version: self.definition.version.clone(),
            status: self.status,
            frames: self.interpreter.checkpoint(),
            state: self.state.snapshot(),
            pending: self.dispatcher.pending().cloned(),
            debug_serial: self.debug_serial,
        }
    }

    pub fn restore(definition: Arc<WorkflowDefinition>, checkpoint: CheckpointV1, cfg: Arc<DefaultsConfig>) -> Result<Self> {
        if checkpoint.workflow_name != definition.name || checkpoint.workflow_version != definition.version {
            return Err(EngineError::Protocol(format!(
                "checkpoint is for '{}@{}', cannot restore against '{}@{}'",
                checkpoint.workflow_name, checkpoint.workflow_version, definition.name, definition.version
            )));
        }
        let state = StateStore::from_snapshot(definition.state_schema.clone(), checkpoint.state)?;
        let interpreter = Interpreter::restore(checkpoint.frames, &definition.sub_agent_tasks)?;
        let mut dispatcher = Dispatcher::new();
        if let Some(pending) = checkpoint.pending {
            dispatcher.hold(pending);
        }
        Ok(WorkflowInstance {
            definition,
            interpreter,
            dispatcher,
            state,
            status: checkpoint.status,
            cfg,
            debug_serial: checkpoint.debug_serial,
            sub_agent_driver: Arc::new(EchoDriver),
            errors: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateSchema;
    use crate::workflow::definition::{ExecutionContext, OutputFormat, ShellOnError, Step};
    use serde_json::json;

    fn simple_definition() -> Arc<WorkflowDefinition> {
        Arc::new(WorkflowDefinition {
            name: "demo".into(),
            description: String::new(),
            version: "1.0.0".into(),
            inputs: vec![],
            default_state: json!({}),
            state_schema: StateSchema::default(),
            steps: vec![
                Step::UserMessage { id: "hello".into(), message: "hi".into() },
                Step::UserInput {
                    id: "ask".into(),
                    message: "what?".into(),
                    input_type: crate::workflow::definition::UserInputType::String,
                    choices: vec![],
                    state_update: Some(crate::workflow::definition::StateUpdate {
                        path: "this.answer".into(),
                        operation: UpdateOperation::Set,
                        value: "result".into(),
                    }),
                },
            ],
            sub_agent_tasks: HashMap::new(),
            source_path: None,
        })
    }

    #[tokio::test]
    async fn drives_through_two_steps_and_applies_result() {
        let mut instance = WorkflowInstance::start(simple_definition(), json!({}), Arc::new(DefaultsConfig::default()), false).unwrap();

        let first = instance.get_next_step().await.unwrap().unwrap();
        assert_eq!(first.id, "hello");
        instance.step_complete("hello", Value::Null).unwrap();

        let second = instance.get_next_step().await.unwrap().unwrap();
        assert_eq!(second.id, "ask");
        instance.step_complete("ask", json!("42")).unwrap();

        assert!(instance.get_next_step().await.unwrap().is_none());
        assert_eq!(instance.status(), InstanceStatus::Completed);
        assert_eq!(instance.state_value(None)["answer"], json!("42"));
    }

    #[tokio::test]
    async fn step_complete_rejects_wrong_id() {
        let mut instance = WorkflowInstance::start(simple_definition(), json!({}), Arc::new(DefaultsConfig::default()), false).unwrap();
        instance.get_next_step().await.unwrap();
        assert!(instance.step_complete("ask", Value::Null).is_err());
    }

    #[tokio::test]
    async fn checkpoint_and_restore_resumes_mid_execution() {
        let definition = simple_definition();
        let mut instance = WorkflowInstance::start(definition.clone(), json!({}), Arc::new(DefaultsConfig::default()), false).unwrap();
        instance.get_next_step().await.unwrap();
        instance.step_complete("hello", Value::Null).unwrap();
        instance.get_next_step().await.unwrap();

        let checkpoint = instance.checkpoint();
        let mut restored = WorkflowInstance::restore(definition, checkpoint, Arc::new(DefaultsConfig::default())).unwrap();
        assert_eq!(restored.pending_step().unwrap().id, "ask");
        restored.step_complete("ask", json!("7")).unwrap();
        assert!(restored.get_next_step().await.unwrap().is_none());
        assert_eq!(restored.state_value(None)["answer"], json!("7"));
    }

    #[tokio::test]
    async fn server_shell_step_runs_without_client_round_trip() {
        let definition = Arc::new(WorkflowDefinition {
            name: "shell-demo".into(),
            description: String::new(),
            version: "1.0.0".into(),
            inputs: vec![],
            default_state: json!({}),
            state_schema: StateSchema::default(),
            steps: vec![Step::ShellCommand {
                id: "touch".into(),
                command: "true".into(),
                working_directory: None,
                execution_context: ExecutionContext::Server,
                output_format: OutputFormat::Text,
                state_update: None,
                on_error: ShellOnError::Fail,
                retry_count: 0,
                timeout_seconds: Some(5),
            }],
            sub_agent_tasks: HashMap::new(),
            source_path: None,
        });
        let mut instance = WorkflowInstance::start(definition, json!({}), Arc::new(DefaultsConfig::default()), false).unwrap();
        assert!(instance.get_next_step().await.unwrap().is_none());
        assert_eq!(instance.status(), InstanceStatus::Completed);
    }
}
