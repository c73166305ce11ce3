//! The Step Interpreter: a frame-stack machine that walks a workflow's step
//! tree, evaluating control flow and server-internal steps directly and
//! producing client-visible [`AtomicStep`]s for everything else (spec.md
//! §4.D).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::Command;

use crate::config::DefaultsConfig;
use crate::error::{EngineError, Result};
use crate::expr::{self, Scope, StrictMode};
use crate::state::{StateSnapshot, StateStore, UpdateOp, UpdateOperation};

use super::definition::{
    ErrorHandling, ErrorStrategy, ExecutionContext, OnSubAgentError, OutputFormat, ShellOnError, Step, StateUpdate,
    SubAgentTaskDefinition, UserInputType,
};
use super::dispatcher::{AtomicStep, AtomicStepKind};
use super::template::{render, stringify};

/// A loop's current-iteration binding, exposed to the body as `loop.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoopBinding {
    variable_name: String,
    item: Value,
    index: usize,
    iteration: u32,
}

impl LoopBinding {
    fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("item".to_string(), self.item.clone());
        map.insert(self.variable_name.clone(), self.item.clone());
        map.insert("index".to_string(), Value::from(self.index));
        map.insert("iteration".to_string(), Value::from(self.iteration));
        Value::Object(map)
    }
}

#[derive(Debug)]
struct SeqFrame {
    steps: Arc<[Step]>,
    index: usize,
}

#[derive(Debug)]
struct WhileFrame {
    body: Arc<[Step]>,
    condition: String,
    iteration: u32,
    max_iterations: u32,
    error_handling: Option<ErrorHandling>,
}

#[derive(Debug)]
struct ForeachFrame {
    body: Arc<[Step]>,
    variable_name: String,
    items: Vec<Value>,
    next_index: usize,
    current: Option<LoopBinding>,
}

/// A `parallel_foreach` rewritten to run one item at a time, each against its
/// own child interpreter and state store — the same per-item isolation
/// `subagent::SubAgentCoordinator::run_one` gives a real concurrent child,
/// just driven serially so every one of its steps reaches the client instead
/// of being resolved silently.
#[derive(Debug)]
struct DebugSerialForeachFrame {
    task_name: String,
    items: Vec<Value>,
    next_index: usize,
    /// `this.sub_agent_results.<parent_step_id>`; the finished item's flattened
    /// state is written to `<aggregate_root>.<index>`.
    aggregate_root: String,
    current: Option<ChildRun>,
}

#[derive(Debug)]
struct ChildRun {
    interpreter: Interpreter,
    state: StateStore,
    index: usize,
}

#[derive(Debug)]
enum Frame {
    Seq(SeqFrame),
    While(WhileFrame),
    Foreach(ForeachFrame),
    DebugSerialForeach(DebugSerialForeachFrame),
}

/// Serializable form of one stack frame, for workflow checkpointing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FrameCheckpoint {
    Seq { steps: Vec<Step>, index: usize },
    While { body: Vec<Step>, condition: String, iteration: u32, max_iterations: u32, error_handling: Option<ErrorHandling> },
    Foreach {
        body: Vec<Step>,
        variable_name: String,
        items: Vec<Value>,
        next_index: usize,
        current: Option<LoopBindingCheckpoint>,
    },
    DebugSerialForeach {
        task_name: String,
        items: Vec<Value>,
        next_index: usize,
        aggregate_root: String,
        current: Option<ChildRunCheckpoint>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopBindingCheckpoint {
    variable_name: String,
    item: Value,
    index: usize,
    iteration: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildRunCheckpoint {
    frames: Vec<FrameCheckpoint>,
    state: StateSnapshot,
    index: usize,
}

impl FrameCheckpoint {
    fn from_frame(frame: &Frame) -> Self {
        match frame {
            Frame::Seq(s) => FrameCheckpoint::Seq { steps: s.steps.to_vec(), index: s.index },
            Frame::While(w) => FrameCheckpoint::While {
                body: w.body.to_vec(),
                condition: w.condition.clone(),
                iteration: w.iteration,
                max_iterations: w.max_iterations,
                error_handling: w.error_handling.clone(),
            },
            Frame::Foreach(f) => FrameCheckpoint::Foreach {
                body: f.body.to_vec(),
                variable_name: f.variable_name.clone(),
                items: f.items.clone(),
                next_index: f.next_index,
                current: f.current.as_ref().map(|c| LoopBindingCheckpoint {
                    variable_name: c.variable_name.clone(),
                    item: c.item.clone(),
                    index: c.index,
                    iteration: c.iteration,
                }),
            },
            Frame::DebugSerialForeach(df) => FrameCheckpoint::DebugSerialForeach {
                task_name: df.task_name.clone(),
                items: df.items.clone(),
                next_index: df.next_index,
                aggregate_root: df.aggregate_root.clone(),
                current: df.current.as_ref().map(|c| ChildRunCheckpoint {
                    frames: c.interpreter.checkpoint(),
                    state: c.state.snapshot(),
                    index: c.index,
                }),
            },
        }
    }

    fn into_frame(self, sub_agent_tasks: &HashMap<String, SubAgentTaskDefinition>) -> Result<Frame> {
        Ok(match self {
            FrameCheckpoint::Seq { steps, index } => Frame::Seq(SeqFrame { steps: steps.into(), index }),
            FrameCheckpoint::While { body, condition, iteration, max_iterations, error_handling } => {
                Frame::While(WhileFrame { body: body.into(), condition, iteration, max_iterations, error_handling })
            }
            FrameCheckpoint::Foreach { body, variable_name, items, next_index, current } => {
                Frame::Foreach(ForeachFrame {
                    body: body.into(),
                    variable_name,
                    items,
                    next_index,
                    current: current.map(|c| LoopBinding {
                        variable_name: c.variable_name,
                        item: c.item,
                        index: c.index,
                        iteration: c.iteration,
                    }),
                })
            }
            FrameCheckpoint::DebugSerialForeach { task_name, items, next_index, aggregate_root, current } => {
                let current = match current {
                    None => None,
                    Some(c) => {
                        let task = sub_agent_tasks.get(&task_name).ok_or_else(|| {
                            EngineError::StepExecution(format!(
                                "checkpoint references unknown sub_agent_task '{task_name}'"
                            ))
                        })?;
                        let state = StateStore::from_snapshot(task.state_schema.clone(), c.state)?;
                        let interpreter = Interpreter::restore(c.frames, sub_agent_tasks)?;
                        Some(ChildRun { interpreter, state, index: c.index })
                    }
                };
                Frame::DebugSerialForeach(DebugSerialForeachFrame { task_name, items, next_index, aggregate_root, current })
            }
        })
    }
}

/// What `Interpreter::drive` produced.
pub enum StepEmission {
    Atomic(AtomicStep),
    ParallelForeach(ParallelForeachRequest),
}

/// Everything the Dispatcher/Instance layer needs to hand a `parallel_foreach`
/// off to the Sub-Agent Coordinator.
pub struct ParallelForeachRequest {
    pub step_id: String,
    pub sub_agent_task: String,
    pub items: Vec<Value>,
    pub max_parallel: Option<usize>,
    pub wait_for_all: bool,
    pub timeout_seconds: Option<u64>,
    pub on_sub_agent_error: OnSubAgentError,
}

pub enum DriveOutcome {
    Emit(StepEmission),
    Complete,
}

/// Owns the frame stack for one workflow instance (or one sub-agent child).
#[derive(Debug, Default)]
pub struct Interpreter {
    stack: Vec<Frame>,
}

impl Interpreter {
    pub fn new(root_steps: Arc<[Step]>) -> Self {
        Interpreter { stack: vec![Frame::Seq(SeqFrame { steps: root_steps, index: 0 })] }
    }

    pub fn is_complete(&self) -> bool {
        self.stack.is_empty()
    }

    /// Snapshot the frame stack for persistence. Step lists are cloned
    /// inline rather than addressed by path into the root definition —
    /// simpler to restore correctly, at the cost of a larger checkpoint for
    /// deeply nested conditionals.
    pub fn checkpoint(&self) -> Vec<FrameCheckpoint> {
        self.stack.iter().map(FrameCheckpoint::from_frame).collect()
    }

    /// Rebuild an interpreter from a checkpoint produced by the same (or an
    /// unchanged) workflow definition. `sub_agent_tasks` is needed to
    /// recover the schema of any in-flight debug-serial child state.
    pub fn restore(
        frames: Vec<FrameCheckpoint>,
        sub_agent_tasks: &HashMap<String, SubAgentTaskDefinition>,
    ) -> Result<Self> {
        let stack = frames.into_iter().map(|f| f.into_frame(sub_agent_tasks)).collect::<Result<Vec<_>>>()?;
        Ok(Interpreter { stack })
    }

    /// Run until a client-visible step is ready to emit, a `parallel_foreach`
    /// is encountered, or the stack empties.
    pub async fn drive(
        &mut self,
        state: &mut StateStore,
        sub_agent_tasks: &HashMap<String, SubAgentTaskDefinition>,
        cfg: &DefaultsConfig,
        debug_serial: bool,
    ) -> Result<DriveOutcome> {
        loop {
            let Some(top) = self.stack.last() else {
                return Ok(DriveOutcome::Complete);
            };

            match top {
                Frame::Seq(seq) if seq.index >= seq.steps.len() => {
                    self.stack.pop();
                    continue;
                }
                Frame::Seq(_) => {
                    let scope = self.scope_with_loop(state);
                    let (step, stack_len) = {
                        let Some(Frame::Seq(seq)) = self.stack.last_mut() else { unreachable!() };
                        let step = seq.steps[seq.index].clone();
                        seq.index += 1;
                        (step, self.stack.len())
                    };
                    match self.execute_step(&step, state, sub_agent_tasks, cfg, debug_serial, &scope).await? {
                        ExecOutcome::Advance => continue,
                        ExecOutcome::Push(frame) => {
                            self.stack.push(frame);
                            continue;
                        }
                        ExecOutcome::Emit(atomic) => return Ok(DriveOutcome::Emit(StepEmission::Atomic(atomic))),
                        ExecOutcome::ParallelForeach(req) => {
                            return Ok(DriveOutcome::Emit(StepEmission::ParallelForeach(req)))
                        }
                        ExecOutcome::Break => {
                            self.unwind_loop(stack_len, true);
                            continue;
                        }
                        ExecOutcome::Continue => {
                            self.unwind_loop(stack_len, false);
                            continue;
                        }
                    }
                }
                Frame::While(_) => {
                    let scope = state.scope();
                    let Some(Frame::While(wf)) = self.stack.last_mut() else { unreachable!() };
                    let cond = resolve_with_error_handling(&wf.condition, &scope, &wf.error_handling)?;
                    if expr::truthy(&cond) {
                        if wf.iteration >= wf.max_iterations {
                            return Err(EngineError::StepExecution(format!(
                                "while_loop exceeded max_iterations ({})",
                                wf.max_iterations
                            )));
                        }
                        wf.iteration += 1;
                        let body = wf.body.clone();
                        self.stack.push(Frame::Seq(SeqFrame { steps: body, index: 0 }));
                    } else {
                        self.stack.pop();
                    }
                    continue;
                }
                Frame::Foreach(_) => {
                    self.advance_foreach()?;
                    continue;
                }
                Frame::DebugSerialForeach(_) => {
                    let need_new_child = {
                        let Some(Frame::DebugSerialForeach(df)) = self.stack.last() else { unreachable!() };
                        df.current.is_none()
                    };

                    if need_new_child {
                        let Some(Frame::DebugSerialForeach(df)) = self.stack.last_mut() else { unreachable!() };
                        if df.next_index >= df.items.len() {
                            self.stack.pop();
                            continue;
                        }
                        let task = sub_agent_tasks.get(&df.task_name).cloned().ok_or_else(|| {
                            EngineError::InvalidWorkflowDefinition(format!(
                                "unknown sub_agent_task '{}'",
                                df.task_name
                            ))
                        })?;
                        let index = df.next_index;
                        let item = df.items[index].clone();
                        df.next_index += 1;
                        let input_name =
                            task.inputs.first().map(|f| f.name.clone()).unwrap_or_else(|| "item".to_string());
                        let mut inputs = Map::new();
                        inputs.insert(input_name, item);
                        let child_state =
                            StateStore::initialise(task.state_schema.clone(), task.default_state.clone(), Value::Object(inputs))?;
                        let child_interpreter = Interpreter::new(task.steps.clone().into());
                        df.current = Some(ChildRun { interpreter: child_interpreter, state: child_state, index });
                        continue;
                    }

                    let Some(Frame::DebugSerialForeach(df)) = self.stack.last_mut() else { unreachable!() };
                    let mut child = df.current.take().expect("need_new_child false implies current is set");
                    let aggregate_root = df.aggregate_root.clone();
                    let outcome =
                        Box::pin(child.interpreter.drive(&mut child.state, sub_agent_tasks, cfg, debug_serial)).await?;
                    match outcome {
                        DriveOutcome::Complete => {
                            let flattened = child.state.read(None);
                            state.update(&[UpdateOp {
                                path: format!("{aggregate_root}.{}", child.index),
                                operation: UpdateOperation::Set,
                                value: flattened,
                            }])?;
                            continue;
                        }
                        DriveOutcome::Emit(StepEmission::Atomic(step)) => {
                            let Some(Frame::DebugSerialForeach(df)) = self.stack.last_mut() else { unreachable!() };
                            df.current = Some(child);
                            return Ok(DriveOutcome::Emit(StepEmission::Atomic(step)));
                        }
                        DriveOutcome::Emit(StepEmission::ParallelForeach(_)) => {
                            return Err(EngineError::InvalidWorkflowDefinition(
                                "nested parallel_foreach inside a sub_agent_task is not supported".to_string(),
                            ));
                        }
                    }
                }
            }
        }
    }

    fn scope_with_loop(&self, state: &StateStore) -> Scope {
        let base = state.scope();
        for frame in self.stack.iter().rev() {
            match frame {
                Frame::While(wf) => {
                    let mut map = Map::new();
                    map.insert("iteration".to_string(), Value::from(wf.iteration));
                    return base.with_loop(Value::Object(map));
                }
                Frame::Foreach(ff) => {
                    if let Some(cur) = &ff.current {
                        return base.with_loop(cur.to_value());
                    }
                }
                Frame::Seq(_) | Frame::DebugSerialForeach(_) => {}
            }
        }
        base
    }

    fn unwind_loop(&mut self, from_len: usize, pop_loop: bool) {
        self.stack.truncate(from_len);
        while let Some(top) = self.stack.last() {
            match top {
                Frame::Seq(_) => {
                    self.stack.pop();
                }
                Frame::While(_) | Frame::Foreach(_) | Frame::DebugSerialForeach(_) => {
                    if pop_loop {
                        self.stack.pop();
                    }
                    return;
                }
            }
        }
    }

    fn advance_foreach(&mut self) -> Result<()> {
        let Some(Frame::Foreach(ff)) = self.stack.last_mut() else { unreachable!() };

        if ff.next_index >= ff.items.len() {
            self.stack.pop();
            return Ok(());
        }

        let index = ff.next_index;
        let item = ff.items[index].clone();
        ff.next_index += 1;
        ff.current = Some(LoopBinding {
            variable_name: ff.variable_name.clone(),
            item,
            index,
            iteration: index as u32 + 1,
        });
        let body = ff.body.clone();
        self.stack.push(Frame::Seq(SeqFrame { steps: body, index: 0 }));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_step(
        &mut self,
        step: &Step,
        state: &mut StateStore,
        sub_agent_tasks: &HashMap<String, SubAgentTaskDefinition>,
        cfg: &DefaultsConfig,
        debug_serial: bool,
        scope: &Scope,
    ) -> Result<ExecOutcome> {
        match step {
            Step::Break { .. } => Ok(ExecOutcome::Break),
            Step::Continue { .. } => Ok(ExecOutcome::Continue),

            Step::Conditional { condition, then_steps, else_steps, error_handling, .. } => {
                let cond = resolve_with_error_handling(condition, scope, error_handling)?;
                let branch: Arc<[Step]> =
                    if expr::truthy(&cond) { then_steps.clone().into() } else { else_steps.clone().into() };
                Ok(ExecOutcome::Push(Frame::Seq(SeqFrame { steps: branch, index: 0 })))
            }

            Step::WhileLoop { condition, body, max_iterations, error_handling, .. } => {
                Ok(ExecOutcome::Push(Frame::While(WhileFrame {
                    body: body.clone().into(),
                    condition: condition.clone(),
                    iteration: 0,
                    max_iterations: max_iterations.unwrap_or(cfg.while_loop_max_iterations),
                    error_handling: error_handling.clone(),
                })))
            }

            Step::Foreach { items, variable_name, body, error_handling, .. } => {
                let resolved = resolve_with_error_handling(items, scope, error_handling)?;
                let items_vec = resolved.as_array().cloned().unwrap_or_default();
                Ok(ExecOutcome::Push(Frame::Foreach(ForeachFrame {
                    body: body.clone().into(),
                    variable_name: variable_name.clone(),
                    items: items_vec,
                    next_index: 0,
                    current: None,
                })))
            }

            Step::ParallelForeach { id, items, sub_agent_task, max_parallel, wait_for_all, timeout_seconds, on_sub_agent_error } => {
                let resolved = expr::evaluate(items, scope, StrictMode::Strict)?;
                let items_vec = resolved.as_array().cloned().unwrap_or_default();

                if debug_serial {
                    if !sub_agent_tasks.contains_key(sub_agent_task) {
                        return Err(EngineError::InvalidWorkflowDefinition(format!(
                            "unknown sub_agent_task '{sub_agent_task}'"
                        )));
                    }
                    return Ok(ExecOutcome::Push(Frame::DebugSerialForeach(DebugSerialForeachFrame {
                        task_name: sub_agent_task.clone(),
                        items: items_vec,
                        next_index: 0,
                        aggregate_root: format!("this.sub_agent_results.{id}"),
                        current: None,
                    })));
                }

                Ok(ExecOutcome::ParallelForeach(ParallelForeachRequest {
                    step_id: id.clone(),
                    sub_agent_task: sub_agent_task.clone(),
                    items: items_vec,
                    max_parallel: *max_parallel,
                    wait_for_all: *wait_for_all,
                    timeout_seconds: *timeout_seconds,
                    on_sub_agent_error: *on_sub_agent_error,
                }))
            }

            Step::ShellCommand { execution_context: ExecutionContext::Server, .. } => {
                self.run_server_shell(step, state, cfg, scope).await.map(|_| ExecOutcome::Advance)
            }

            Step::UserMessage { id, message } => {
                let rendered = render(message, scope);
                Ok(ExecOutcome::Emit(AtomicStep {
                    id: id.clone(),
                    kind: AtomicStepKind::UserMessage,
                    instructions: rendered.clone(),
                    definition: serde_json::json!({ "messages": [rendered] }),
                    variable_replacements: None,
                }))
            }

            Step::UserInput { id, message, input_type, choices, .. } => Ok(ExecOutcome::Emit(AtomicStep {
                id: id.clone(),
                kind: AtomicStepKind::UserInput,
                instructions: render(message, scope),
                definition: serde_json::json!({
                    "input_type": input_type_str(*input_type),
                    "choices": choices,
                }),
                variable_replacements: None,
            })),

            Step::McpCall { id, tool, params, .. } => {
                let resolved = render_value(params, scope);
                Ok(ExecOutcome::Emit(AtomicStep {
                    id: id.clone(),
                    kind: AtomicStepKind::McpCall,
                    instructions: format!("call tool '{tool}'"),
                    definition: serde_json::json!({ "tool": tool, "params": resolved }),
                    variable_replacements: None,
                }))
            }

            Step::AgentPrompt { id, prompt, .. } => Ok(ExecOutcome::Emit(AtomicStep {
                id: id.clone(),
                kind: AtomicStepKind::UserMessage,
                instructions: render(prompt, scope),
                definition: Value::Null,
                variable_replacements: None,
            })),

            Step::AgentResponse { id, message, .. } => Ok(ExecOutcome::Emit(AtomicStep {
                id: id.clone(),
                kind: AtomicStepKind::UserInput,
                instructions: render(message, scope),
                definition: Value::Null,
                variable_replacements: None,
            })),

            Step::ShellCommand { id, command, working_directory, .. } => Ok(ExecOutcome::Emit(AtomicStep {
                id: id.clone(),
                kind: AtomicStepKind::ShellCommand,
                instructions: render(command, scope),
                definition: serde_json::json!({
                    "command": render(command, scope),
                    "working_directory": working_directory.as_ref().map(|d| render(d, scope)),
                }),
                variable_replacements: None,
            })),

            Step::WaitStep { id, message } => Ok(ExecOutcome::Emit(AtomicStep {
                id: id.clone(),
                kind: AtomicStepKind::Wait,
                instructions: message.as_deref().map(|m| render(m, scope)).unwrap_or_default(),
                definition: Value::Null,
                variable_replacements: None,
            })),
        }
    }

    async fn run_server_shell(
        &self,
        step: &Step,
        state: &mut StateStore,
        cfg: &DefaultsConfig,
        scope: &Scope,
    ) -> Result<()> {
        let Step::ShellCommand {
            id,
            command,
            working_directory,
            output_format,
            state_update,
            on_error,
            retry_count,
            timeout_seconds,
            ..
        } = step
        else {
            unreachable!("run_server_shell called with a non-shell step")
        };

        let rendered_command = render(command, scope);
        let rendered_dir = working_directory.as_ref().map(|d| render(d, scope));
        let timeout = Duration::from_secs(timeout_seconds.unwrap_or(cfg.shell_timeout_seconds));

        let mut attempt = 0u32;
        let mut backoff = Duration::from_millis(100);
        loop {
            let outcome = run_shell_once(&rendered_command, rendered_dir.as_deref(), timeout, cfg.shell_output_cap_bytes).await;
            match outcome {
                Ok(output) => {
                    if let Some(su) = state_update {
                        self.apply_shell_state_update(su, &output, *output_format, state)?;
                    }
                    return Ok(());
                }
                Err(e) => match on_error {
                    ShellOnError::Fail => return Err(e),
                    ShellOnError::Continue => {
                        tracing::warn!(step_id = %id, error = %e, "server shell_command failed, continuing");
                        return Ok(());
                    }
                    ShellOnError::Retry => {
                        if attempt >= *retry_count {
                            return Err(e);
                        }
                        attempt += 1;
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(5));
                    }
                },
            }
        }
    }

    fn apply_shell_state_update(
        &self,
        su: &StateUpdate,
        output: &ShellOutput,
        format: OutputFormat,
        state: &mut StateStore,
    ) -> Result<()> {
        let parsed = match format {
            OutputFormat::Text => Value::String(output.stdout.clone()),
            OutputFormat::Lines => Value::Array(
                output.stdout.lines().filter(|l| !l.trim().is_empty()).map(|l| Value::String(l.to_string())).collect(),
            ),
            OutputFormat::Json => serde_json::from_str(&output.stdout).unwrap_or(Value::Null),
            OutputFormat::KeyValue => {
                let mut map = Map::new();
                for line in output.stdout.lines() {
                    if let Some((k, v)) = line.split_once('=') {
                        map.insert(k.trim().to_string(), Value::String(v.trim().to_string()));
                    }
                }
                Value::Object(map)
            }
        };

        let mut scope = state.scope();
        scope.bind_named("result", parsed);
        let value = expr::evaluate(&su.value, &scope, StrictMode::Strict)?;
        state.update(&[UpdateOp { path: su.path.clone(), operation: su.operation, value }])
    }
}

enum ExecOutcome {
    Advance,
    Push(Frame),
    Emit(AtomicStep),
    ParallelForeach(ParallelForeachRequest),
    Break,
    Continue,
}

struct ShellOutput {
    stdout: String,
}

async fn run_shell_once(command: &str, dir: Option<&str>, timeout: Duration, cap_bytes: usize) -> Result<ShellOutput> {
    let mut parts = command.split_whitespace();
    let program = parts.next().ok_or_else(|| EngineError::StepExecution("empty shell command".to_string()))?;
    let mut cmd = Command::new(program);
    cmd.args(parts).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn().map_err(|e| EngineError::StepExecution(format!("failed to spawn '{command}': {e}")))?;
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| EngineError::StepExecution(format!("shell command '{command}' timed out after {timeout:?}")))?
        .map_err(|e| EngineError::StepExecution(format!("shell command '{command}' failed: {e}")))?;

    if !output.status.success() {
        return Err(EngineError::StepExecution(format!(
            "shell command '{command}' exited with status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let mut stdout_bytes = output.stdout;
    if stdout_bytes.len() > cap_bytes {
        return Err(EngineError::StepExecution(format!(
            "shell command '{command}' exceeded output cap of {cap_bytes} bytes"
        )));
    }
    if !stdout_bytes.is_empty() && stdout_bytes.last() == Some(&b'\n') {
        stdout_bytes.pop();
    }
    Ok(ShellOutput { stdout: String::from_utf8_lossy(&stdout_bytes).into_owned() })
}

/// Evaluate `expr_src`, honouring a step's `error_handling.strategy` on
/// failure (spec.md §4.D, "Failure semantics within the interpreter").
/// `Continue` without an explicit fallback yields `null`, which callers
/// coerce to whatever empty value fits the expression's role (falsy
/// condition, empty array).
fn resolve_with_error_handling(expr_src: &str, scope: &Scope, error_handling: &Option<ErrorHandling>) -> Result<Value> {
    match expr::evaluate(expr_src, scope, StrictMode::Strict) {
        Ok(v) => Ok(v),
        Err(e) => {
            let Some(eh) = error_handling else { return Err(e) };
            match eh.strategy {
                ErrorStrategy::Fail => Err(e),
                ErrorStrategy::Continue => {
                    tracing::warn!(expr = %expr_src, error = %e, "expression evaluation failed, continuing");
                    Ok(Value::Null)
                }
                ErrorStrategy::Retry => Err(e),
                ErrorStrategy::Fallback => Ok(eh.fallback_value.clone().unwrap_or(Value::Null)),
            }
        }
    }
}

/// Find the `state_update` declared on the step with id `id`, searching into
/// conditional branches and loop bodies. Used by callers applying a
/// `step_complete` result after the interpreter has already moved past the
/// step that produced the emission (e.g. a sub-agent coordinator resolving a
/// child's `user_input`/`mcp_call` step).
pub fn find_state_update<'a>(steps: &'a [Step], id: &str) -> Option<&'a StateUpdate> {
    for step in steps {
        match step {
            Step::UserInput { id: sid, state_update, .. }
            | Step::McpCall { id: sid, state_update, .. }
            | Step::AgentPrompt { id: sid, state_update, .. }
            | Step::AgentResponse { id: sid, state_update, .. }
            | Step::ShellCommand { id: sid, state_update, .. }
                if sid == id =>
            {
                return state_update.as_ref();
            }
            Step::Conditional { then_steps, else_steps, .. } => {
                if let Some(su) = find_state_update(then_steps, id) {
                    return Some(su);
                }
                if let Some(su) = find_state_update(else_steps, id) {
                    return Some(su);
                }
            }
            Step::WhileLoop { body, .. } | Step::Foreach { body, .. } => {
                if let Some(su) = find_state_update(body, id) {
                    return Some(su);
                }
            }
            _ => {}
        }
    }
    None
}

/// Bind `result` to a `step_complete` payload and apply the declared
/// `state_update`, the same way [`Interpreter::apply_shell_state_update`]
/// binds a shell command's parsed output.
pub fn apply_result_state_update(su: &StateUpdate, result: Value, state: &mut StateStore) -> Result<()> {
    let mut scope = state.scope();
    scope.bind_named("result", result);
    let value = expr::evaluate(&su.value, &scope, StrictMode::Strict)?;
    state.update(&[UpdateOp { path: su.path.clone(), operation: su.operation, value }])
}

fn input_type_str(t: UserInputType) -> &'static str {
    match t {
        UserInputType::String => "string",
        UserInputType::Number => "number",
        UserInputType::Boolean => "boolean",
        UserInputType::Choice => "choice",
    }
}

/// Render every string leaf of an (already-evaluated) params object against
/// `scope`, leaving non-string leaves untouched.
fn render_value(value: &Value, scope: &Scope) -> Value {
    match value {
        Value::String(s) => Value::String(render(s, scope)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, scope)).collect()),
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), render_value(v, scope))).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateSchema;
    use serde_json::json;

    fn empty_tasks() -> HashMap<String, SubAgentTaskDefinition> {
        HashMap::new()
    }

    #[tokio::test]
    async fn sequence_of_user_messages_emits_in_order() {
        let steps: Arc<[Step]> = vec![
            Step::UserMessage { id: "a".into(), message: "one".into() },
            Step::UserMessage { id: "b".into(), message: "two".into() },
        ]
        .into();
        let mut interp = Interpreter::new(steps);
        let mut state = StateStore::initialise(StateSchema::default(), json!({}), json!({})).unwrap();
        let cfg = DefaultsConfig::default();

        match interp.drive(&mut state, &empty_tasks(), &cfg, false).await.unwrap() {
            DriveOutcome::Emit(StepEmission::Atomic(a)) => assert_eq!(a.instructions, "one"),
            _ => panic!("expected emission"),
        }
        match interp.drive(&mut state, &empty_tasks(), &cfg, false).await.unwrap() {
            DriveOutcome::Emit(StepEmission::Atomic(a)) => assert_eq!(a.instructions, "two"),
            _ => panic!("expected emission"),
        }
        assert!(matches!(interp.drive(&mut state, &empty_tasks(), &cfg, false).await.unwrap(), DriveOutcome::Complete));
    }

    #[tokio::test]
    async fn conditional_with_false_condition_and_no_else_emits_nothing() {
        let steps: Arc<[Step]> = vec![Step::Conditional {
            id: "c".into(),
            condition: "this.flag".into(),
            then_steps: vec![Step::UserMessage { id: "never".into(), message: "x".into() }],
            else_steps: vec![],
            error_handling: None,
        }]
        .into();
        let mut interp = Interpreter::new(steps);
        let mut state = StateStore::initialise(StateSchema::default(), json!({"flag": false}), json!({})).unwrap();
        let cfg = DefaultsConfig::default();
        assert!(matches!(interp.drive(&mut state, &empty_tasks(), &cfg, false).await.unwrap(), DriveOutcome::Complete));
    }

    #[tokio::test]
    async fn while_loop_breaks_at_three() {
        let steps: Arc<[Step]> = vec![Step::WhileLoop {
            id: "loop".into(),
            condition: "this.i < 10".into(),
            body: vec![
                Step::ShellCommand {
                    id: "inc".into(),
                    command: "true".into(),
                    working_directory: None,
                    execution_context: ExecutionContext::Server,
                    output_format: OutputFormat::Text,
                    state_update: Some(StateUpdate {
                        path: "this.i".into(),
                        operation: UpdateOperation::Increment,
                        value: "1".into(),
                    }),
                    on_error: ShellOnError::Fail,
                    retry_count: 0,
                    timeout_seconds: Some(5),
                },
                Step::Conditional {
                    id: "check".into(),
                    condition: "this.i >= 3".into(),
                    then_steps: vec![Step::Break { id: "stop".into() }],
                    else_steps: vec![],
                    error_handling: None,
                },
            ],
            max_iterations: Some(10),
            error_handling: None,
        }]
        .into();
        let mut interp = Interpreter::new(steps);
        let mut state = StateStore::initialise(StateSchema::default(), json!({"i": 0}), json!({})).unwrap();
        let cfg = DefaultsConfig::default();
        assert!(matches!(interp.drive(&mut state, &empty_tasks(), &cfg, false).await.unwrap(), DriveOutcome::Complete));
        assert_eq!(state.read(None)["i"], json!(3));
    }

    #[tokio::test]
    async fn foreach_over_computed_filter_emits_two_messages() {
        use crate::state::{ComputedFieldSchema, InputFieldSchema, InputType, OnErrorPolicy};
        let schema = StateSchema {
            inputs: vec![InputFieldSchema { name: "files".into(), input_type: InputType::Array, required: true, default: None }],
            computed: vec![ComputedFieldSchema {
                name: "keep".into(),
                from: vec!["inputs.files".into()],
                transform: "input.filter(f => !f.includes('.min.'))".into(),
                on_error: OnErrorPolicy::Propagate,
                fallback: None,
            }],
        };
        let steps: Arc<[Step]> = vec![Step::Foreach {
            id: "fe".into(),
            items: "this.keep".into(),
            variable_name: "item".into(),
            body: vec![Step::UserMessage { id: "msg".into(), message: "{{ loop.item }}@{{ loop.index }}".into() }],
            error_handling: None,
        }]
        .into();
        let mut interp = Interpreter::new(steps);
        let mut state =
            StateStore::initialise(schema, json!({}), json!({"files": ["a.ts", "b.min.js", "c.ts"]})).unwrap();
        let cfg = DefaultsConfig::default();

        let mut messages = Vec::new();
        loop {
            match interp.drive(&mut state, &empty_tasks(), &cfg, false).await.unwrap() {
                DriveOutcome::Emit(StepEmission::Atomic(a)) => messages.push(a.instructions),
                DriveOutcome::Complete => break,
                _ => panic!("unexpected emission"),
            }
        }
        assert_eq!(messages, vec!["a.ts@0".to_string(), "c.ts@1".to_string()]);
    }
}
