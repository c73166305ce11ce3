//! Declarative shape of a workflow's state: input schema and computed-field
//! definitions, plus the dependency-graph ordering used by both the loader
//! (cycle validation) and the State Store (recomputation order).

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl InputType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Number => value.is_number(),
            InputType::Boolean => value.is_boolean(),
            InputType::Object => value.is_object(),
            InputType::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputFieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub input_type: InputType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorPolicy {
    UseFallback,
    Propagate,
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputedFieldSchema {
    pub name: String,
    /// Scoped source paths, e.g. `this.n`, `inputs.files`.
    pub from: Vec<String>,
    pub transform: String,
    #[serde(default = "default_on_error")]
    pub on_error: OnErrorPolicy,
    #[serde(default)]
    pub fallback: Option<Value>,
}

fn default_on_error() -> OnErrorPolicy {
    OnErrorPolicy::Propagate
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSchema {
    #[serde(default)]
    pub inputs: Vec<InputFieldSchema>,
    #[serde(default)]
    pub computed: Vec<ComputedFieldSchema>,
}

/// A source path feeds a dependency edge onto another computed field only
/// when its root is `this`/`global` and its single remaining segment names
/// a declared computed field.
fn source_dependency(path: &str, computed_names: &HashSet<&str>) -> Option<String> {
    let mut parts = path.splitn(2, '.');
    let root = parts.next()?;
    let rest = parts.next()?;
    if (root == "this" || root == "global") && !rest.contains('.') && computed_names.contains(rest) {
        Some(rest.to_string())
    } else {
        None
    }
}

/// Compute a topological order over computed fields via Kahn's algorithm.
/// Returns `InvalidWorkflowDefinition` if the dependency graph has a cycle.
pub fn topological_order(computed: &[ComputedFieldSchema]) -> Result<Vec<String>, EngineError> {
    let names: HashSet<&str> = computed.iter().map(|c| c.name.as_str()).collect();

    let mut in_degree: HashMap<&str, usize> = names.iter().map(|n| (*n, 0usize)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = names.iter().map(|n| (*n, Vec::new())).collect();

    for field in computed {
        for source in &field.from {
            if let Some(dep) = source_dependency(source, &names) {
                *in_degree.get_mut(field.name.as_str()).unwrap() += 1;
                dependents.get_mut(dep.as_str()).unwrap().push(field.name.as_str());
            }
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut ordered_names: Vec<&str> = Vec::with_capacity(queue.len());
    // Stable ordering: process the initial zero-degree set in schema order.
    queue.make_contiguous().sort_by_key(|n| computed.iter().position(|c| c.name == *n).unwrap());

    while let Some(name) = queue.pop_front() {
        ordered_names.push(name);
        let mut newly_ready: Vec<&str> = Vec::new();
        for dependent in &dependents[name] {
            let deg = in_degree.get_mut(dependent).unwrap();
            *deg -= 1;
            if *deg == 0 {
                newly_ready.push(dependent);
            }
        }
        newly_ready.sort_by_key(|n| computed.iter().position(|c| c.name == *n).unwrap());
        queue.extend(newly_ready);
    }

    if ordered_names.len() != computed.len() {
        return Err(EngineError::InvalidWorkflowDefinition(
            "computed-field dependency graph contains a cycle".to_string(),
        ));
    }

    Ok(ordered_names.into_iter().map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, from: &[&str]) -> ComputedFieldSchema {
        ComputedFieldSchema {
            name: name.to_string(),
            from: from.iter().map(|s| s.to_string()).collect(),
            transform: "input".to_string(),
            on_error: OnErrorPolicy::Propagate,
            fallback: None,
        }
    }

    #[test]
    fn orders_chained_dependencies() {
        let fields = vec![field("sqplus", &["this.sq"]), field("sq", &["this.n"])];
        let order = topological_order(&fields).unwrap();
        assert_eq!(order, vec!["sq".to_string(), "sqplus".to_string()]);
    }

    #[test]
    fn independent_fields_keep_schema_order() {
        let fields = vec![field("a", &["inputs.x"]), field("b", &["inputs.y"])];
        let order = topological_order(&fields).unwrap();
        assert_eq!(order, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn detects_cycle() {
        let fields = vec![field("a", &["this.b"]), field("b", &["this.a"])];
        assert!(topological_order(&fields).is_err());
    }

    #[test]
    fn input_type_matching() {
        assert!(InputType::String.matches(&Value::String("x".into())));
        assert!(!InputType::String.matches(&Value::Bool(true)));
    }
}
