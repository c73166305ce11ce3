//! Parses a YAML workflow document and validates the structural invariants
//! from spec.md §4.C. Parse and validate are kept as separate passes,
//! mirroring the config loader's `toml::from_str` → `validate()` shape.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::{EngineError, Result};
use crate::state::{parse_scope_path, topological_order, ScopeRoot};

use super::definition::{Step, WorkflowDefinition};

fn name_re() -> Regex {
    Regex::new(r"^[A-Za-z0-9_-]+(:[A-Za-z0-9_-]+)?$").unwrap()
}

fn semver_re() -> Regex {
    Regex::new(r"^\d+\.\d+\.\d+(-[0-9A-Za-z.-]+)?(\+[0-9A-Za-z.-]+)?$").unwrap()
}

fn step_id_re() -> Regex {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap()
}

/// Parse `source` (YAML text) into a [`WorkflowDefinition`] and run
/// structural validation.
pub fn parse_workflow(source: &str, source_path: Option<&Path>) -> Result<WorkflowDefinition> {
    let mut def: WorkflowDefinition = serde_yaml::from_str(source).map_err(|e| {
        EngineError::InvalidWorkflowDefinition(format!(
            "{}: {e}",
            source_path.map(|p| p.display().to_string()).unwrap_or_else(|| "<inline>".to_string())
        ))
    })?;
    def.source_path = source_path.map(|p| p.display().to_string());
    validate(&def)?;
    Ok(def)
}

/// Default search order for `{name}.yaml`: `AROMCP_WORKFLOWS_PATH` first
/// (highest priority, a `PATH`-style list of directories split with the
/// platform separator), then `extra_paths` (`EngineConfig.workflows_path`),
/// then the two hardcoded defaults, per spec.md §6.
pub fn search_paths(name: &str, extra_paths: &[PathBuf]) -> Vec<PathBuf> {
    let file_name = format!("{name}.yaml");
    let mut paths: Vec<PathBuf> = Vec::new();

    if let Ok(env_path) = std::env::var("AROMCP_WORKFLOWS_PATH") {
        paths.extend(std::env::split_paths(&env_path).map(|dir| dir.join(&file_name)));
    }
    paths.extend(extra_paths.iter().map(|dir| dir.join(&file_name)));
    paths.push(PathBuf::from(".aromcp/workflows").join(&file_name));
    if let Ok(home) = std::env::var("HOME") {
        paths.push(PathBuf::from(home).join(".aromcp/workflows").join(&file_name));
    }
    paths
}

fn validate(def: &WorkflowDefinition) -> Result<()> {
    if !name_re().is_match(&def.name) {
        return Err(EngineError::InvalidWorkflowDefinition(format!(
            "workflow name '{}' does not match ^[A-Za-z0-9_-]+(:[A-Za-z0-9_-]+)?$",
            def.name
        )));
    }
    if !semver_re().is_match(&def.version) {
        return Err(EngineError::InvalidWorkflowDefinition(format!(
            "workflow version '{}' is not a valid semver string",
            def.version
        )));
    }
    if def.steps.is_empty() {
        return Err(EngineError::InvalidWorkflowDefinition("workflow has no steps".to_string()));
    }

    // Cycle check for the computed-field dependency graph (also rebuilt by
    // the State Store at `initialise`, but load-time failure is cheaper).
    topological_order(&def.state_schema.computed)?;

    // Collision check: a computed field name must not also appear in
    // `inputs` or in any `default_state` top-level key (spec invariant 2).
    let computed_names: HashSet<&str> = def.state_schema.computed.iter().map(|c| c.name.as_str()).collect();
    for input in &def.inputs {
        if computed_names.contains(input.name.as_str()) {
            return Err(EngineError::InvalidWorkflowDefinition(format!(
                "'{}' is declared both as an input and as a computed field",
                input.name
            )));
        }
    }
    if let Some(state_obj) = def.default_state.as_object() {
        for key in state_obj.keys() {
            if computed_names.contains(key.as_str()) {
                return Err(EngineError::InvalidWorkflowDefinition(format!(
                    "'{key}' is declared both in default_state and as a computed field"
                )));
            }
        }
    }

    let mut seen_ids = HashSet::new();
    validate_steps(&def.steps, false, &mut seen_ids, &def.sub_agent_tasks)?;

    Ok(())
}

fn validate_steps(
    steps: &[Step],
    inside_loop: bool,
    seen_ids: &mut HashSet<String>,
    sub_agent_tasks: &std::collections::HashMap<String, super::definition::SubAgentTaskDefinition>,
) -> Result<()> {
    for step in steps {
        let id = step.id();
        if !step_id_re().is_match(id) {
            return Err(EngineError::InvalidWorkflowDefinition(format!(
                "step id '{id}' does not match ^[A-Za-z_][A-Za-z0-9_]*$"
            )));
        }
        if !seen_ids.insert(id.to_string()) {
            return Err(EngineError::InvalidWorkflowDefinition(format!("duplicate step id '{id}'")));
        }

        match step {
            Step::Break { .. } | Step::Continue { .. } if !inside_loop => {
                return Err(EngineError::InvalidWorkflowDefinition(format!(
                    "'{id}' (break/continue) must appear inside a while_loop or foreach body"
                )));
            }
            Step::Conditional { then_steps, else_steps, .. } => {
                validate_steps(then_steps, inside_loop, seen_ids, sub_agent_tasks)?;
                validate_steps(else_steps, inside_loop, seen_ids, sub_agent_tasks)?;
            }
            Step::WhileLoop { body, .. } | Step::Foreach { body, .. } => {
                validate_steps(body, true, seen_ids, sub_agent_tasks)?;
            }
            Step::ParallelForeach { sub_agent_task, .. } => {
                if !sub_agent_tasks.contains_key(sub_agent_task) {
                    return Err(EngineError::InvalidWorkflowDefinition(format!(
                        "parallel_foreach '{id}' references undefined sub_agent_task '{sub_agent_task}'"
                    )));
                }
            }
            Step::UserInput { state_update: Some(su), .. }
            | Step::McpCall { state_update: Some(su), .. }
            | Step::AgentPrompt { state_update: Some(su), .. }
            | Step::AgentResponse { state_update: Some(su), .. }
            | Step::ShellCommand { state_update: Some(su), .. } => {
                validate_writable_path(&su.path)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_writable_path(path: &str) -> Result<()> {
    let (root, _, _) = parse_scope_path(path)?;
    if !matches!(root, ScopeRoot::This | ScopeRoot::Global) {
        return Err(EngineError::InvalidWorkflowDefinition(format!(
            "state_update path '{path}' must begin with this./global. (or legacy state./raw.)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(steps: &str) -> String {
        format!(
            "name: demo:wf\nversion: 1.0.0\nsteps:\n{steps}\n"
        )
    }

    #[test]
    fn parses_minimal_workflow() {
        let src = yaml("  - id: say_hi\n    type: user_message\n    message: hi\n");
        let def = parse_workflow(&src, None).unwrap();
        assert_eq!(def.steps.len(), 1);
    }

    #[test]
    fn rejects_duplicate_step_id() {
        let src = yaml(
            "  - id: a\n    type: user_message\n    message: hi\n  - id: a\n    type: user_message\n    message: bye\n",
        );
        assert!(parse_workflow(&src, None).is_err());
    }

    #[test]
    fn rejects_break_outside_loop() {
        let src = yaml("  - id: b\n    type: break\n");
        assert!(parse_workflow(&src, None).is_err());
    }

    #[test]
    fn accepts_break_inside_while_loop() {
        let src = yaml(
            "  - id: loop1\n    type: while_loop\n    condition: \"this.i < 3\"\n    body:\n      - id: b\n        type: break\n",
        );
        assert!(parse_workflow(&src, None).is_ok());
    }

    #[test]
    fn rejects_bad_version() {
        let src = "name: demo:wf\nversion: not-semver\nsteps:\n  - id: a\n    type: user_message\n    message: hi\n";
        assert!(parse_workflow(src, None).is_err());
    }

    #[test]
    fn rejects_undefined_sub_agent_task() {
        let src = yaml(
            "  - id: pf\n    type: parallel_foreach\n    items: \"inputs.files\"\n    sub_agent_task: missing\n",
        );
        assert!(parse_workflow(&src, None).is_err());
    }

    #[test]
    fn aromcp_workflows_path_env_var_is_searched_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("from_env.yaml"), yaml("  - id: a\n    type: user_message\n    message: hi\n")).unwrap();

        // Only test in this crate that touches this env var.
        std::env::set_var("AROMCP_WORKFLOWS_PATH", dir.path());
        let found = search_paths("from_env", &[]).into_iter().find(|p| p.exists());
        std::env::remove_var("AROMCP_WORKFLOWS_PATH");

        assert_eq!(found.unwrap(), dir.path().join("from_env.yaml"));
    }
}
