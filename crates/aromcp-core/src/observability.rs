//! Observability contract for workflow run events and health metrics.
//!
//! Defines the canonical event schema this engine emits over its lifetime
//! (workflow start/complete/fail, step emission/completion/failure,
//! sub-agent fan-out) and provides health metrics computable from a
//! captured event log, without coupling the engine's core to any specific
//! sink (stdout, a file, an external collector).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema version for events emitted by this crate.
pub const SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    StepEmitted,
    StepCompleted,
    StepFailed,
    SubAgentStarted,
    SubAgentCompleted,
    SubAgentFailed,
}

/// One entry of the `workflow_errors` array a failed instance's final
/// flattened state carries (spec.md §7, "User-visible failure"). Distinct
/// from `EngineError`: this is user-visible data that survives
/// serialization, not the engine's own error type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowErrorRecord {
    pub step_id: String,
    pub kind: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// One emitted event. `step_id` is set for step/sub-agent events and absent
/// for workflow-level ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub timestamp: DateTime<Utc>,
    pub instance_id: String,
    pub event_type: WorkflowEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// Event schema definition, primarily for documenting the wire contract to
/// external log consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSchema {
    pub version: String,
    pub event_types: Vec<EventTypeDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTypeDefinition {
    pub name: String,
    pub description: String,
    pub required_fields: Vec<String>,
}

/// Health metrics computable from one instance's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceHealthMetrics {
    pub success_rate: f64,
    pub dispatch_overhead_ms: u64,
    pub step_failure_count: u32,
    pub total_events: u32,
    pub steps_completed: u32,
    pub steps_failed: u32,
    pub sub_agents_completed: u32,
    pub sub_agents_failed: u32,
}

impl InstanceHealthMetrics {
    pub fn from_events(events: &[WorkflowEvent]) -> Self {
        let total_events = events.len() as u32;

        let steps_completed =
            events.iter().filter(|e| e.event_type == WorkflowEventType::StepCompleted).count() as u32;
        let steps_failed = events.iter().filter(|e| e.event_type == WorkflowEventType::StepFailed).count() as u32;
        let sub_agents_completed =
            events.iter().filter(|e| e.event_type == WorkflowEventType::SubAgentCompleted).count() as u32;
        let sub_agents_failed =
            events.iter().filter(|e| e.event_type == WorkflowEventType::SubAgentFailed).count() as u32;

        let step_failure_count = steps_failed + sub_agents_failed;
        let total_steps = steps_completed + steps_failed;
        let success_rate = if total_steps > 0 { steps_completed as f64 / total_steps as f64 } else { 0.0 };

        let dispatch_overhead_ms = compute_dispatch_overhead(events);

        Self {
            success_rate,
            dispatch_overhead_ms,
            step_failure_count,
            total_events,
            steps_completed,
            steps_failed,
            sub_agents_completed,
            sub_agents_failed,
        }
    }
}

/// Time between `WorkflowStarted` and the first `StepEmitted`, plus time
/// between the last step event and `WorkflowCompleted`/`WorkflowFailed` —
/// the portion of wall-clock time this engine itself consumed, as opposed
/// to time spent waiting on the client to execute an atomic step.
fn compute_dispatch_overhead(events: &[WorkflowEvent]) -> u64 {
    let started = events.iter().find(|e| e.event_type == WorkflowEventType::WorkflowStarted).map(|e| e.timestamp);
    let first_step = events.iter().find(|e| e.event_type == WorkflowEventType::StepEmitted).map(|e| e.timestamp);
    let last_step_done = events
        .iter()
        .filter(|e| matches!(e.event_type, WorkflowEventType::StepCompleted | WorkflowEventType::StepFailed))
        .max_by_key(|e| e.timestamp)
        .map(|e| e.timestamp);
    let ended = events
        .iter()
        .find(|e| matches!(e.event_type, WorkflowEventType::WorkflowCompleted | WorkflowEventType::WorkflowFailed))
        .map(|e| e.timestamp);

    let mut overhead_ms = 0u64;
    if let (Some(start), Some(first)) = (started, first_step) {
        overhead_ms += first.signed_duration_since(start).num_milliseconds().unsigned_abs();
    }
    if let (Some(last), Some(end)) = (last_step_done, ended) {
        overhead_ms += end.signed_duration_since(last).num_milliseconds().unsigned_abs();
    }
    overhead_ms
}

/// The canonical event schema definition.
pub fn event_schema() -> EventSchema {
    EventSchema {
        version: SCHEMA_VERSION.to_string(),
        event_types: vec![
            EventTypeDefinition {
                name: "workflow_started".to_string(),
                description: "Emitted when a workflow instance starts".to_string(),
                required_fields: vec!["instance_id".to_string(), "timestamp".to_string()],
            },
            EventTypeDefinition {
                name: "workflow_completed".to_string(),
                description: "Emitted when a workflow instance's step tree finishes".to_string(),
                required_fields: vec!["instance_id".to_string(), "timestamp".to_string()],
            },
            EventTypeDefinition {
                name: "workflow_failed".to_string(),
                description: "Emitted when a workflow instance fails".to_string(),
                required_fields: vec!["instance_id".to_string(), "timestamp".to_string(), "data".to_string()],
            },
            EventTypeDefinition {
                name: "step_emitted".to_string(),
                description: "Emitted when an atomic step is handed to the client".to_string(),
                required_fields: vec!["instance_id".to_string(), "timestamp".to_string(), "step_id".to_string()],
            },
            EventTypeDefinition {
                name: "step_completed".to_string(),
                description: "Emitted when step_complete is accepted for a step".to_string(),
                required_fields: vec!["instance_id".to_string(), "timestamp".to_string(), "step_id".to_string()],
            },
            EventTypeDefinition {
                name: "step_failed".to_string(),
                description: "Emitted when a step's execution or state_update fails".to_string(),
                required_fields: vec![
                    "instance_id".to_string(),
                    "timestamp".to_string(),
                    "step_id".to_string(),
                    "data".to_string(),
                ],
            },
            EventTypeDefinition {
                name: "sub_agent_started".to_string(),
                description: "Emitted when a parallel_foreach child instance is spawned".to_string(),
                required_fields: vec!["instance_id".to_string(), "timestamp".to_string(), "step_id".to_string()],
            },
            EventTypeDefinition {
                name: "sub_agent_completed".to_string(),
                description: "Emitted when a parallel_foreach child instance finishes".to_string(),
                required_fields: vec!["instance_id".to_string(), "timestamp".to_string(), "step_id".to_string()],
            },
            EventTypeDefinition {
                name: "sub_agent_failed".to_string(),
                description: "Emitted when a parallel_foreach child instance fails or times out".to_string(),
                required_fields: vec![
                    "instance_id".to_string(),
                    "timestamp".to_string(),
                    "step_id".to_string(),
                    "data".to_string(),
                ],
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_event(event_type: WorkflowEventType, step_id: Option<&str>, offset_ms: i64) -> WorkflowEvent {
        WorkflowEvent {
            timestamp: DateTime::<Utc>::from_timestamp(0, 0).unwrap() + Duration::milliseconds(offset_ms),
            instance_id: "wf_test0001".to_string(),
            event_type,
            step_id: step_id.map(|s| s.to_string()),
            data: Value::Null,
        }
    }

    #[test]
    fn schema_version_is_set() {
        assert_eq!(SCHEMA_VERSION, "1.0.0");
    }

    #[test]
    fn event_schema_has_types() {
        let schema = event_schema();
        let names: Vec<&str> = schema.event_types.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"workflow_started"));
        assert!(names.contains(&"step_emitted"));
        assert!(names.contains(&"sub_agent_failed"));
    }

    #[test]
    fn event_types_have_required_fields() {
        for et in &event_schema().event_types {
            assert!(et.required_fields.contains(&"instance_id".to_string()));
            assert!(et.required_fields.contains(&"timestamp".to_string()));
        }
    }

    #[test]
    fn health_metrics_empty_events() {
        let metrics = InstanceHealthMetrics::from_events(&[]);
        assert_eq!(metrics.total_events, 0);
        assert_eq!(metrics.success_rate, 0.0);
    }

    #[test]
    fn health_metrics_all_success() {
        let events = vec![
            make_event(WorkflowEventType::WorkflowStarted, None, 0),
            make_event(WorkflowEventType::StepEmitted, Some("a"), 100),
            make_event(WorkflowEventType::StepCompleted, Some("a"), 200),
            make_event(WorkflowEventType::StepEmitted, Some("b"), 250),
            make_event(WorkflowEventType::StepCompleted, Some("b"), 400),
            make_event(WorkflowEventType::WorkflowCompleted, None, 450),
        ];
        let metrics = InstanceHealthMetrics::from_events(&events);
        assert_eq!(metrics.steps_completed, 2);
        assert_eq!(metrics.steps_failed, 0);
        assert!((metrics.success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(metrics.dispatch_overhead_ms, 150);
    }

    #[test]
    fn health_metrics_partial_failure() {
        let events = vec![
            make_event(WorkflowEventType::WorkflowStarted, None, 0),
            make_event(WorkflowEventType::StepEmitted, Some("a"), 100),
            make_event(WorkflowEventType::StepCompleted, Some("a"), 200),
            make_event(WorkflowEventType::StepEmitted, Some("b"), 250),
            make_event(WorkflowEventType::StepFailed, Some("b"), 300),
            make_event(WorkflowEventType::WorkflowFailed, None, 350),
        ];
        let metrics = InstanceHealthMetrics::from_events(&events);
        assert_eq!(metrics.steps_completed, 1);
        assert_eq!(metrics.steps_failed, 1);
        assert!((metrics.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(metrics.step_failure_count, 1);
    }

    #[test]
    fn sub_agent_failures_count_toward_step_failure_count() {
        let events = vec![
            make_event(WorkflowEventType::SubAgentStarted, Some("fanout"), 0),
            make_event(WorkflowEventType::SubAgentCompleted, Some("fanout"), 100),
            make_event(WorkflowEventType::SubAgentFailed, Some("fanout"), 150),
        ];
        let metrics = InstanceHealthMetrics::from_events(&events);
        assert_eq!(metrics.sub_agents_completed, 1);
        assert_eq!(metrics.sub_agents_failed, 1);
        assert_eq!(metrics.step_failure_count, 1);
    }

    #[test]
    fn schema_serialization_round_trips() {
        let schema = event_schema();
        let json = serde_json::to_string(&schema).expect("serialize");
        let deser: EventSchema = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(deser.event_types.len(), schema.event_types.len());
    }

    #[test]
    fn event_serialization_round_trips() {
        let event = make_event(WorkflowEventType::StepEmitted, Some("a"), 10);
        let json = serde_json::to_string(&event).expect("serialize");
        let deser: WorkflowEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(deser.step_id.as_deref(), Some("a"));
        assert_eq!(deser.event_type, WorkflowEventType::StepEmitted);
    }
}
