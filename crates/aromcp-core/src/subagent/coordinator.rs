//! Drives the children of a `parallel_foreach` to completion with bounded
//! concurrency, modeled on the teacher's `ParallelSupervisor` /
//! `ParallelHandle` pair — one child per fan-out item instead of one OS
//! process per agent, gathered the same way: spawn everything, join
//! everything, never let one failure take down its siblings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;

use crate::config::DefaultsConfig;
use crate::error::{EngineError, Result};
use crate::state::StateStore;

use crate::workflow::definition::SubAgentTaskDefinition;
use crate::workflow::dispatcher::AtomicStep;
use crate::workflow::interpreter::{apply_result_state_update, find_state_update, DriveOutcome, Interpreter, StepEmission};

/// Resolves a client-visible atomic step to the value a real agent would
/// eventually report via `step_complete`. Synchronous and non-fallible by
/// design: a driver that cannot answer a step should return `Value::Null`
/// rather than block the coordinator on a live agent round-trip, keeping
/// fan-out self-contained and testable without a running multi-process
/// agent harness.
pub trait SubAgentDriver: Send + Sync {
    fn respond(&self, step: &AtomicStep) -> Value;
}

/// Trivial driver used when no caller-supplied driver is wired up: echoes an
/// empty/affirmative response for every step kind.
#[derive(Debug, Default)]
pub struct EchoDriver;

impl SubAgentDriver for EchoDriver {
    fn respond(&self, _step: &AtomicStep) -> Value {
        Value::Null
    }
}

/// Per-child result: either the child's flattened final state, or the error
/// it failed with (timeout or a propagated `EngineError`).
#[derive(Debug)]
pub enum SubAgentOutcome {
    Completed(Value),
    Failed(String),
}

/// Bounded-concurrency runner for one `parallel_foreach` invocation.
pub struct SubAgentCoordinator {
    semaphore: Arc<Semaphore>,
}

impl SubAgentCoordinator {
    pub fn new(max_parallel: usize) -> Self {
        SubAgentCoordinator { semaphore: Arc::new(Semaphore::new(max_parallel.max(1))) }
    }

    /// Drive one child instance (one `items` element) to completion,
    /// applying `driver`'s responses to any `state_update` the emitting
    /// step declares.
    async fn run_one(
        task: Arc<SubAgentTaskDefinition>,
        item: Value,
        input_name: String,
        driver: Arc<dyn SubAgentDriver>,
        cfg: DefaultsConfig,
    ) -> Result<Value> {
        let mut inputs = serde_json::Map::new();
        inputs.insert(input_name, item);
        let mut state = StateStore::initialise(task.state_schema.clone(), task.default_state.clone(), Value::Object(inputs))?;
        let steps: Arc<[_]> = task.steps.clone().into();
        let mut interp = Interpreter::new(steps);
        let empty_tasks: HashMap<String, SubAgentTaskDefinition> = HashMap::new();

        loop {
            match interp.drive(&mut state, &empty_tasks, &cfg, false).await? {
                DriveOutcome::Complete => return Ok(state.read(None)),
                DriveOutcome::Emit(StepEmission::Atomic(step)) => {
                    let result = driver.respond(&step);
                    if let Some(su) = find_state_update(&task.steps, &step.id) {
                        apply_result_state_update(su, result, &mut state)?;
                    }
                }
                DriveOutcome::Emit(StepEmission::ParallelForeach(_)) => {
                    return Err(EngineError::SubAgent(
                        "nested parallel_foreach inside a sub_agent_task is not supported".to_string(),
                    ));
                }
            }
        }
    }

    /// Run `items.len()` children concurrently (capped by `max_parallel`),
    /// each under `timeout` if given, and return one outcome per item in
    /// the order the items were given.
    pub async fn run_all(
        &self,
        task: &SubAgentTaskDefinition,
        input_name: &str,
        items: Vec<Value>,
        driver: Arc<dyn SubAgentDriver>,
        timeout: Option<Duration>,
        cfg: &DefaultsConfig,
    ) -> Vec<SubAgentOutcome> {
        let task = Arc::new(task.clone());
        let cfg = cfg.clone();
        let mut join_set = Vec::with_capacity(items.len());

        for (index, item) in items.into_iter().enumerate() {
            let permit = self.semaphore.clone();
            let task = task.clone();
            let input_name = input_name.to_string();
            let driver = driver.clone();
            let cfg = cfg.clone();

            let jh = tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore never closed");
                let fut = Self::run_one(task, item, input_name, driver, cfg);
                let outcome = match timeout {
                    Some(d) => match tokio::time::timeout(d, fut).await {
                        Ok(r) => r,
                        Err(_) => Err(EngineError::SubAgent("sub_agent_task timed out".to_string())),
                    },
                    None => fut.await,
                };
                (index, outcome)
            });
            join_set.push(jh);
        }

        let mut results: Vec<Option<SubAgentOutcome>> = (0..join_set.len()).map(|_| None).collect();
        for jh in join_set {
            match jh.await {
                Ok((index, Ok(value))) => results[index] = Some(SubAgentOutcome::Completed(value)),
                Ok((index, Err(e))) => results[index] = Some(SubAgentOutcome::Failed(e.to_string())),
                Err(join_err) => {
                    tracing::error!(error = %join_err, "sub-agent task panicked");
                }
            }
        }

        results.into_iter().map(|r| r.unwrap_or(SubAgentOutcome::Failed("task dropped".to_string()))).collect()
    }
}
