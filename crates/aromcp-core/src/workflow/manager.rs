//! The instance registry: owns every running [`WorkflowInstance`], loads
//! definitions on demand, and fans out `get_next_step`/`step_complete` calls
//! to the right one (spec.md §6, "workflow.*" operations).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::{DefaultsConfig, EngineConfig};
use crate::error::{EngineError, Result};
use crate::state::{DependencyInfo, UpdateOp};

use super::definition::WorkflowDefinition;
use super::dispatcher::AtomicStep;
use super::instance::{CheckpointV1, InstanceStatus, WorkflowInstance};
use super::loader::{parse_workflow, search_paths};

fn new_instance_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("wf_{}", &hex[..8])
}

/// Holds a loaded-definition cache plus the live instance table. One per
/// server process (or per test).
pub struct WorkflowInstanceManager {
    workflows_dir_extra: Vec<PathBuf>,
    cfg: Arc<DefaultsConfig>,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    instances: RwLock<HashMap<String, Arc<Mutex<WorkflowInstance>>>>,
}

impl WorkflowInstanceManager {
    pub fn new(engine_cfg: &EngineConfig) -> Self {
        WorkflowInstanceManager {
            workflows_dir_extra: engine_cfg.workflows_path.clone(),
            cfg: Arc::new(engine_cfg.defaults.clone()),
            definitions: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Register an already-parsed definition directly (used by tests and by
    /// callers that load workflows from something other than the filesystem
    /// search path, e.g. an inline string).
    pub async fn register_definition(&self, def: WorkflowDefinition) {
        self.definitions.write().await.insert(def.name.clone(), Arc::new(def));
    }

    async fn resolve_definition(&self, name: &str) -> Result<Arc<WorkflowDefinition>> {
        if let Some(def) = self.definitions.read().await.get(name) {
            return Ok(def.clone());
        }
        for path in search_paths(name, &self.workflows_dir_extra) {
            if let Ok(source) = std::fs::read_to_string(&path) {
                let def = parse_workflow(&source, Some(&path))?;
                let arc = Arc::new(def);
                self.definitions.write().await.insert(name.to_string(), arc.clone());
                return Ok(arc);
            }
        }
        Err(EngineError::InvalidWorkflowDefinition(format!("workflow '{name}' not found on any search path")))
    }

    /// `workflow.get_info`: the cached definition, loading it if necessary.
    pub async fn get_info(&self, name: &str) -> Result<Arc<WorkflowDefinition>> {
        self.resolve_definition(name).await
    }

    /// `workflow.start`.
    pub async fn start(&self, workflow_name: &str, inputs: Value, debug_serial: bool) -> Result<String> {
        let def = self.resolve_definition(workflow_name).await?;
        let instance = WorkflowInstance::start(def, inputs, self.cfg.clone(), debug_serial)?;
        let id = new_instance_id();
        self.instances.write().await.insert(id.clone(), Arc::new(Mutex::new(instance)));
        Ok(id)
    }

    async fn get(&self, instance_id: &str) -> Result<Arc<Mutex<WorkflowInstance>>> {
        self.instances
            .read()
            .await
            .get(instance_id)
            .cloned()
            .ok_or_else(|| EngineError::Protocol(format!("unknown workflow instance '{instance_id}'")))
    }

    /// `workflow.get_next_step`.
    pub async fn get_next_step(&self, instance_id: &str) -> Result<Option<AtomicStep>> {
        let instance = self.get(instance_id).await?;
        let mut guard = instance.lock().await;
        guard.get_next_step().await
    }

    /// `workflow.step_complete`.
    pub async fn step_complete(&self, instance_id: &str, step_id: &str, result: Value) -> Result<()> {
        let instance = self.get(instance_id).await?;
        let mut guard = instance.lock().await;
        guard.step_complete(step_id, result)
    }

    /// `workflow.list`: every live instance id paired with its status.
    pub async fn list(&self) -> Vec<(String, InstanceStatus)> {
        let mut out = Vec::new();
        for (id, instance) in self.instances.read().await.iter() {
            out.push((id.clone(), instance.lock().await.status()));
        }
        out
    }

    /// `workflow_state.read`.
    pub async fn read_state(&self, instance_id: &str, paths: Option<&[String]>) -> Result<Value> {
        let instance = self.get(instance_id).await?;
        let guard = instance.lock().await;
        Ok(guard.state_value(paths))
    }

    /// `workflow_state.update`.
    pub async fn update_state(&self, instance_id: &str, ops: &[UpdateOp]) -> Result<()> {
        let instance = self.get(instance_id).await?;
        let mut guard = instance.lock().await;
        guard.update_state(ops)
    }

    /// `workflow_state.dependencies`.
    pub async fn dependencies(&self, instance_id: &str, field_name: &str) -> Result<DependencyInfo> {
        let instance = self.get(instance_id).await?;
        let guard = instance.lock().await;
        guard.dependencies(field_name)
    }

    /// `workflow.pause`.
    pub async fn pause(&self, instance_id: &str) -> Result<()> {
        let instance = self.get(instance_id).await?;
        let mut guard = instance.lock().await;
        guard.pause()
    }

    /// `workflow.resume(id)`: unfreeze a paused instance in place. Distinct
    /// from `restore`, which rehydrates a checkpoint under a fresh instance
    /// id (spec.md §4.G's `pause(id)`/`resume(id)` vs. `restore(snapshot)`).
    pub async fn resume(&self, instance_id: &str) -> Result<()> {
        let instance = self.get(instance_id).await?;
        let mut guard = instance.lock().await;
        guard.unpause()
    }

    /// `workflow.checkpoint`.
    pub async fn checkpoint(&self, instance_id: &str) -> Result<CheckpointV1> {
        let instance = self.get(instance_id).await?;
        let guard = instance.lock().await;
        Ok(guard.checkpoint())
    }

    /// `workflow.restore`: rehydrate a checkpoint snapshot under a fresh
    /// instance id.
    pub async fn restore(&self, checkpoint: CheckpointV1) -> Result<String> {
        let def = self.resolve_definition(&checkpoint.workflow_name).await?;
        let instance = WorkflowInstance::restore(def, checkpoint, self.cfg.clone())?;
        let id = new_instance_id();
        self.instances.write().await.insert(id.clone(), Arc::new(Mutex::new(instance)));
        Ok(id)
    }

    /// `workflow.complete(id, status)`: drop a finished (or forcibly
    /// terminated) instance from the registry and return its final
    /// flattened state. `status`, if given, overrides the instance's status
    /// before finalizing (e.g. marking an abandoned instance `Failed`).
    /// A failed instance's returned state carries a `workflow_errors` array
    /// (spec.md §7, "User-visible failure").
    pub async fn complete(&self, instance_id: &str, status: Option<InstanceStatus>) -> Result<Value> {
        let instance = self.get(instance_id).await?;
        let final_state = {
            let mut guard = instance.lock().await;
            if let Some(status) = status {
                guard.force_status(status);
            }
            if matches!(guard.status(), InstanceStatus::Pending | InstanceStatus::Running) {
                return Err(EngineError::Protocol(format!(
                    "workflow instance '{instance_id}' is still running, cannot complete"
                )));
            }
            let mut state = guard.state_value(None);
            if guard.status() == InstanceStatus::Failed {
                if let Value::Object(map) = &mut state {
                    map.insert(
                        "workflow_errors".to_string(),
                        serde_json::to_value(guard.errors()).expect("WorkflowErrorRecord always serializes"),
                    );
                }
            }
            state
        };
        self.instances.write().await.remove(instance_id);
        Ok(final_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml_workflow() -> String {
        "name: demo:manager\nversion: 1.0.0\nsteps:\n  - id: hi\n    type: user_message\n    message: hello\n".to_string()
    }

    #[tokio::test]
    async fn start_drive_and_list() {
        let manager = WorkflowInstanceManager::new(&EngineConfig::default());
        let def = parse_workflow(&yaml_workflow(), None).unwrap();
        manager.register_definition(def).await;

        let id = manager.start("demo:manager", Value::Null, false).await.unwrap();
        let step = manager.get_next_step(&id).await.unwrap().unwrap();
        assert_eq!(step.id, "hi");
        manager.step_complete(&id, "hi", Value::Null).await.unwrap();
        assert!(manager.get_next_step(&id).await.unwrap().is_none());

        let listed = manager.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, id);
        assert_eq!(listed[0].1, InstanceStatus::Completed);

        let final_state = manager.complete(&id, None).await.unwrap();
        assert!(final_state.get("workflow_errors").is_none());
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn checkpoint_restore_round_trip_through_manager() {
        let manager = WorkflowInstanceManager::new(&EngineConfig::default());
        let def = parse_workflow(&yaml_workflow(), None).unwrap();
        manager.register_definition(def).await;

        let id = manager.start("demo:manager", Value::Null, false).await.unwrap();
        manager.get_next_step(&id).await.unwrap();
        let checkpoint = manager.checkpoint(&id).await.unwrap();

        let restored_id = manager.restore(checkpoint).await.unwrap();
        assert_ne!(restored_id, id);
        manager.step_complete(&restored_id, "hi", Value::Null).await.unwrap();
        assert!(manager.get_next_step(&restored_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pause_blocks_advancement_until_resumed() {
        let manager = WorkflowInstanceManager::new(&EngineConfig::default());
        let def = parse_workflow(&yaml_workflow(), None).unwrap();
        manager.register_definition(def).await;

        let id = manager.start("demo:manager", Value::Null, false).await.unwrap();
        manager.pause(&id).await.unwrap();
        assert!(manager.get_next_step(&id).await.is_err());

        manager.resume(&id).await.unwrap();
        let step = manager.get_next_step(&id).await.unwrap().unwrap();
        assert_eq!(step.id, "hi");
    }

    #[tokio::test]
    async fn complete_on_failed_instance_carries_workflow_errors() {
        let manager = WorkflowInstanceManager::new(&EngineConfig::default());
        let def = parse_workflow(&yaml_workflow(), None).unwrap();
        manager.register_definition(def).await;

        let id = manager.start("demo:manager", Value::Null, false).await.unwrap();
        let final_state = manager.complete(&id, Some(InstanceStatus::Failed)).await.unwrap();
        assert!(final_state["workflow_errors"].is_array());
    }

    #[tokio::test]
    async fn unknown_instance_id_is_protocol_error() {
        let manager = WorkflowInstanceManager::new(&EngineConfig::default());
        let err = manager.get_next_step("wf_missing").await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }
}
