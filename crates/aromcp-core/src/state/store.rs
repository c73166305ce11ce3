//! The reactive state store: three tiers (`inputs`, a two-partition `state`
//! tier split into `this`/`global`, and `computed`), atomic batched writes,
//! and dependency-directed recomputation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::path::{is_writable, parse_scope_path, ScopeRoot};
use super::schema::{topological_order, ComputedFieldSchema, OnErrorPolicy, StateSchema};
use crate::error::{EngineError, Result};
use crate::expr::{self, StrictMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOperation {
    #[default]
    Set,
    Increment,
    Decrement,
    Append,
    Multiply,
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateOp {
    pub path: String,
    pub operation: UpdateOperation,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyInfo {
    pub direct: Vec<String>,
    pub transitive: Vec<String>,
    pub dependents: Vec<String>,
}

/// Serializable snapshot of the `inputs`/`state` tiers only — `computed` is
/// rebuilt by a full recomputation pass on restore, per DESIGN.md.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub inputs: Map<String, Value>,
    pub this_state: Map<String, Value>,
    pub global_state: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    schema: StateSchema,
    inputs: Map<String, Value>,
    this_state: Map<String, Value>,
    global_state: Map<String, Value>,
    computed: Map<String, Value>,
    topo_order: Vec<String>,
}

impl StateStore {
    /// `initialise(definition, supplied_inputs)`: merge `default_state`,
    /// validate/apply input defaults, freeze `inputs`, run a full
    /// recomputation pass.
    pub fn initialise(schema: StateSchema, default_state: Value, supplied_inputs: Value) -> Result<Self> {
        let topo_order = topological_order(&schema.computed)?;
        let this_state = default_state.as_object().cloned().unwrap_or_default();
        let supplied = supplied_inputs.as_object().cloned().unwrap_or_default();

        let mut inputs = Map::new();
        for field in &schema.inputs {
            let value = match supplied.get(&field.name) {
                Some(v) => v.clone(),
                None => match &field.default {
                    Some(d) => d.clone(),
                    None => {
                        if field.required {
                            return Err(EngineError::InvalidInput(format!(
                                "missing required input '{}'",
                                field.name
                            )));
                        }
                        Value::Null
                    }
                },
            };
            if !value.is_null() && !field.input_type.matches(&value) {
                return Err(EngineError::InvalidInput(format!(
                    "input '{}' expected type {:?}, got {value}",
                    field.name, field.input_type
                )));
            }
            inputs.insert(field.name.clone(), value);
        }

        let mut store = StateStore {
            schema,
            inputs,
            this_state,
            global_state: Map::new(),
            computed: Map::new(),
            topo_order,
        };
        store.recompute_all()?;
        Ok(store)
    }

    pub fn from_snapshot(schema: StateSchema, snapshot: StateSnapshot) -> Result<Self> {
        let topo_order = topological_order(&schema.computed)?;
        let mut store = StateStore {
            schema,
            inputs: snapshot.inputs,
            this_state: snapshot.this_state,
            global_state: snapshot.global_state,
            computed: Map::new(),
            topo_order,
        };
        store.recompute_all()?;
        Ok(store)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            inputs: self.inputs.clone(),
            this_state: self.this_state.clone(),
            global_state: self.global_state.clone(),
        }
    }

    /// A scope suitable for evaluating conditions/templates against the
    /// current committed state (no `loop` binding — callers that are inside
    /// a loop body attach one with `Scope::with_loop`).
    pub fn scope(&self) -> expr::Scope {
        expr::Scope::new(
            Value::Object(self.this_view(&self.this_state, &self.computed)),
            Value::Object(self.global_state.clone()),
            Value::Object(self.inputs.clone()),
        )
    }

    fn this_view(&self, this_state: &Map<String, Value>, computed: &Map<String, Value>) -> Map<String, Value> {
        let mut view = this_state.clone();
        for (k, v) in computed {
            view.insert(k.clone(), v.clone());
        }
        view
    }

    /// `read(paths?)`: a flattened map; if `paths` is given, only those
    /// named paths (scoped or bare).
    pub fn read(&self, paths: Option<&[String]>) -> Value {
        let flat = self.flattened();
        match paths {
            None => Value::Object(flat),
            Some(list) => {
                let mut out = Map::new();
                for p in list {
                    let bare = p.rsplit('.').next().unwrap_or(p);
                    out.insert(p.clone(), flat.get(bare).cloned().unwrap_or(Value::Null));
                }
                Value::Object(out)
            }
        }
    }

    fn flattened(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for (k, v) in &self.global_state {
            out.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.this_state {
            out.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.inputs {
            out.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.computed {
            out.insert(k.clone(), v.clone());
        }
        out
    }

    /// `update(ops)`: atomic batch. On failure the store is left unchanged.
    pub fn update(&mut self, ops: &[UpdateOp]) -> Result<()> {
        let mut this_work = self.this_state.clone();
        let mut global_work = self.global_state.clone();
        let mut changed: Vec<String> = Vec::new();

        for op in ops {
            let (root, segs, _legacy) = parse_scope_path(&op.path)?;
            if !is_writable(root) {
                return Err(EngineError::StateWrite(format!(
                    "cannot write to '{}': tier is read-only",
                    op.path
                )));
            }
            let map = match root {
                ScopeRoot::This => &mut this_work,
                ScopeRoot::Global => &mut global_work,
                _ => unreachable!("is_writable only accepts This/Global"),
            };
            apply_op(map, &segs, op.operation, &op.value, &op.path)?;
            changed.push(format!("this.{}", segs[0]));
            changed.push(format!("global.{}", segs[0]));
        }

        let mut computed_work = self.computed.clone();
        let mut touched = 0usize;
        for name in self.topo_order.clone() {
            let field = self.schema.computed.iter().find(|c| c.name == name).unwrap().clone();
            if !field.from.iter().any(|src| changed.contains(src)) {
                continue;
            }
            touched += 1;
            match self.evaluate_computed(&field, &this_work, &global_work, &computed_work) {
                Ok(value) => {
                    computed_work.insert(name.clone(), value);
                    changed.push(format!("this.{name}"));
                }
                Err(e) => match field.on_error {
                    OnErrorPolicy::Propagate => return Err(e),
                    OnErrorPolicy::UseFallback => {
                        computed_work.insert(name.clone(), field.fallback.clone().unwrap_or(Value::Null));
                        changed.push(format!("this.{name}"));
                    }
                    OnErrorPolicy::Ignore => {}
                },
            }
        }

        tracing::debug!(touched_paths = ops.len(), recomputed = touched, "state update applied");

        self.this_state = this_work;
        self.global_state = global_work;
        self.computed = computed_work;
        Ok(())
    }

    fn recompute_all(&mut self) -> Result<()> {
        let mut computed_work = Map::new();
        for name in self.topo_order.clone() {
            let field = self.schema.computed.iter().find(|c| c.name == name).unwrap().clone();
            match self.evaluate_computed(&field, &self.this_state, &self.global_state, &computed_work) {
                Ok(v) => {
                    computed_work.insert(name, v);
                }
                Err(e) => match field.on_error {
                    OnErrorPolicy::Propagate => return Err(e),
                    OnErrorPolicy::UseFallback => {
                        computed_work.insert(name, field.fallback.clone().unwrap_or(Value::Null));
                    }
                    OnErrorPolicy::Ignore => {
                        computed_work.insert(name, Value::Null);
                    }
                },
            }
        }
        self.computed = computed_work;
        Ok(())
    }

    fn evaluate_computed(
        &self,
        field: &ComputedFieldSchema,
        this_state: &Map<String, Value>,
        global_state: &Map<String, Value>,
        computed_so_far: &Map<String, Value>,
    ) -> Result<Value> {
        let this_view = self.this_view(this_state, computed_so_far);
        let mut scope = expr::Scope::new(
            Value::Object(this_view),
            Value::Object(global_state.clone()),
            Value::Object(self.inputs.clone()),
        );

        let input_binding = if field.from.len() == 1 {
            self.resolve_source(&field.from[0], this_state, global_state, computed_so_far)?
        } else {
            let mut values = Vec::with_capacity(field.from.len());
            for src in &field.from {
                values.push(self.resolve_source(src, this_state, global_state, computed_so_far)?);
            }
            Value::Array(values)
        };
        scope.bind_input(input_binding);

        expr::evaluate(&field.transform, &scope, StrictMode::Strict)
    }

    fn resolve_source(
        &self,
        path: &str,
        this_state: &Map<String, Value>,
        global_state: &Map<String, Value>,
        computed_so_far: &Map<String, Value>,
    ) -> Result<Value> {
        let (root, segs, _legacy) = parse_scope_path(path)?;
        let base = match root {
            ScopeRoot::This => {
                if segs.len() == 1 {
                    if let Some(v) = computed_so_far.get(&segs[0]) {
                        return Ok(v.clone());
                    }
                }
                Value::Object(this_state.clone())
            }
            ScopeRoot::Global => Value::Object(global_state.clone()),
            ScopeRoot::Inputs => Value::Object(self.inputs.clone()),
            ScopeRoot::Computed => Value::Object(computed_so_far.clone()),
            ScopeRoot::Loop => {
                return Err(EngineError::InvalidWorkflowDefinition(format!(
                    "computed field source '{path}' cannot reference 'loop'"
                )))
            }
        };
        get_path(&base, &segs).ok_or_else(|| {
            EngineError::InvalidWorkflowDefinition(format!("computed field source path '{path}' not found"))
        })
    }

    /// `dependencies(field)`.
    pub fn dependencies(&self, field_name: &str) -> Result<DependencyInfo> {
        let target = self
            .schema
            .computed
            .iter()
            .find(|c| c.name == field_name)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown computed field '{field_name}'")))?;

        let direct = target.from.clone();

        let mut transitive: Vec<String> = Vec::new();
        let mut stack: Vec<String> = target.from.clone();
        while let Some(src) = stack.pop() {
            if transitive.contains(&src) {
                continue;
            }
            transitive.push(src.clone());
            if let Some((_, rest)) = src.split_once('.') {
                if let Some(dep_field) = self.schema.computed.iter().find(|c| c.name == rest) {
                    stack.extend(dep_field.from.clone());
                }
            }
        }

        let mut dependents: Vec<String> = Vec::new();
        let mut frontier = vec![field_name.to_string()];
        while let Some(name) = frontier.pop() {
            for candidate in &self.schema.computed {
                let refers = candidate
                    .from
                    .iter()
                    .any(|src| src.split_once('.').map(|(_, rest)| rest == name).unwrap_or(false));
                if refers && !dependents.contains(&candidate.name) {
                    dependents.push(candidate.name.clone());
                    frontier.push(candidate.name.clone());
                }
            }
        }

        Ok(DependencyInfo { direct, transitive, dependents })
    }
}

fn get_path(value: &Value, segs: &[String]) -> Option<Value> {
    let mut cur = value.clone();
    for seg in segs {
        cur = cur.as_object()?.get(seg)?.clone();
    }
    Some(cur)
}

fn entry_mut<'a>(map: &'a mut Map<String, Value>, segs: &[String], full_path: &str) -> Result<&'a mut Value> {
    let (first, rest) = segs.split_first().expect("segs is non-empty");
    if rest.is_empty() {
        Ok(map.entry(first.clone()).or_insert(Value::Null))
    } else {
        let child = map.entry(first.clone()).or_insert_with(|| Value::Object(Map::new()));
        let child_map = child
            .as_object_mut()
            .ok_or_else(|| EngineError::StateWrite(format!("'{full_path}' traverses a non-object value")))?;
        entry_mut(child_map, rest, full_path)
    }
}

fn as_f64(value: &Value, path: &str) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| EngineError::StateWrite(format!("'{path}' requires a numeric operand")))
}

fn apply_op(
    map: &mut Map<String, Value>,
    segs: &[String],
    op: UpdateOperation,
    value: &Value,
    full_path: &str,
) -> Result<()> {
    let slot = entry_mut(map, segs, full_path)?;
    match op {
        UpdateOperation::Set => *slot = value.clone(),
        UpdateOperation::Increment => {
            let cur = slot.as_f64().unwrap_or(0.0);
            *slot = json_num(cur + as_f64(value, full_path)?);
        }
        UpdateOperation::Decrement => {
            let cur = slot.as_f64().unwrap_or(0.0);
            *slot = json_num(cur - as_f64(value, full_path)?);
        }
        UpdateOperation::Multiply => {
            let cur = slot.as_f64().unwrap_or(0.0);
            *slot = json_num(cur * as_f64(value, full_path)?);
        }
        UpdateOperation::Append => {
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            slot.as_array_mut().unwrap().push(value.clone());
        }
        UpdateOperation::Merge => {
            let incoming = value
                .as_object()
                .ok_or_else(|| EngineError::StateWrite(format!("'{full_path}' merge requires an object value")))?;
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            let target = slot.as_object_mut().unwrap();
            for (k, v) in incoming {
                target.insert(k.clone(), v.clone());
            }
        }
    }
    Ok(())
}

fn json_num(f: f64) -> Value {
    serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::schema::{ComputedFieldSchema, InputFieldSchema, InputType};
    use serde_json::json;

    fn cascading_schema() -> StateSchema {
        StateSchema {
            inputs: vec![],
            computed: vec![
                ComputedFieldSchema {
                    name: "sq".into(),
                    from: vec!["this.n".into()],
                    transform: "input * input".into(),
                    on_error: OnErrorPolicy::Propagate,
                    fallback: None,
                },
                ComputedFieldSchema {
                    name: "sqplus".into(),
                    from: vec!["this.sq".into()],
                    transform: "input + 1".into(),
                    on_error: OnErrorPolicy::Propagate,
                    fallback: None,
                },
            ],
        }
    }

    #[test]
    fn cascading_compute_seed_scenario() {
        let mut store =
            StateStore::initialise(cascading_schema(), json!({"n": 2}), json!({})).unwrap();
        assert_eq!(store.read(Some(&["sqplus".to_string()])), json!({"sqplus": 5}));

        store
            .update(&[UpdateOp { path: "this.n".into(), operation: UpdateOperation::Set, value: json!(5) }])
            .unwrap();
        let flat = store.read(None);
        assert_eq!(flat["sq"], json!(25));
        assert_eq!(flat["sqplus"], json!(26));
    }

    #[test]
    fn invalid_write_to_computed_rejected() {
        let mut store =
            StateStore::initialise(cascading_schema(), json!({"n": 2}), json!({})).unwrap();
        let err = store
            .update(&[UpdateOp { path: "computed.sq".into(), operation: UpdateOperation::Set, value: json!(1) }])
            .unwrap_err();
        assert!(matches!(err, EngineError::StateWrite(_)));
        assert_eq!(store.read(Some(&["sq".to_string()]))["sq"], json!(4));
    }

    #[test]
    fn required_input_missing_rejected() {
        let schema = StateSchema {
            inputs: vec![InputFieldSchema {
                name: "files".into(),
                input_type: InputType::Array,
                required: true,
                default: None,
            }],
            computed: vec![],
        };
        let err = StateStore::initialise(schema, json!({}), json!({})).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn increment_and_append_ops() {
        let mut store = StateStore::initialise(StateSchema::default(), json!({"i": 0, "log": []}), json!({})).unwrap();
        store
            .update(&[
                UpdateOp { path: "this.i".into(), operation: UpdateOperation::Increment, value: json!(1) },
                UpdateOp { path: "this.log".into(), operation: UpdateOperation::Append, value: json!("a") },
            ])
            .unwrap();
        let flat = store.read(None);
        assert_eq!(flat["i"], json!(1));
        assert_eq!(flat["log"], json!(["a"]));
    }

    #[test]
    fn dependency_report() {
        let store = StateStore::initialise(cascading_schema(), json!({"n": 2}), json!({})).unwrap();
        let info = store.dependencies("sqplus").unwrap();
        assert_eq!(info.direct, vec!["this.sq".to_string()]);
        assert!(info.transitive.contains(&"this.n".to_string()));
    }
}
