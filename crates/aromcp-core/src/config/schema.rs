use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `aromcp.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Additional workflow search directories, consulted before the two
    /// hardcoded defaults (`./.aromcp/workflows`, `$HOME/.aromcp/workflows`).
    pub workflows_path: Vec<PathBuf>,
    pub defaults: DefaultsConfig,
    /// Re-parse a workflow file if its mtime changes since it was cached.
    pub hot_reload: bool,
}

/// Resource bounds and timeouts applied when a step does not override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DefaultsConfig {
    pub while_loop_max_iterations: u32,
    pub shell_timeout_seconds: u64,
    pub agent_task_timeout_seconds: u64,
    pub shell_output_cap_bytes: usize,
    pub max_parallel_default: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            while_loop_max_iterations: 100,
            shell_timeout_seconds: 60,
            agent_task_timeout_seconds: 300,
            shell_output_cap_bytes: 1024 * 1024,
            max_parallel_default: 5,
        }
    }
}
