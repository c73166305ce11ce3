use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use aromcp_core::config::{load_config, EngineConfig};
use aromcp_core::workflow::{AtomicStepKind, WorkflowInstanceManager};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "aromcp", version, about = "Declarative workflow orchestration engine")]
struct Cli {
    /// Path to an `aromcp.toml` config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List `.yaml` workflow definitions found in a directory.
    List {
        #[arg(default_value = ".aromcp/workflows")]
        dir: PathBuf,
    },
    /// Run a workflow to completion, auto-resolving client-visible steps.
    Run {
        /// Workflow name (without the `.yaml` extension).
        name: String,
        /// `key=value` input pairs, value parsed as JSON if possible.
        #[arg(long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// Run `parallel_foreach` fan-out one item at a time for easier debugging.
        #[arg(long)]
        debug_serial: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    aromcp_core::init_tracing();

    let cli = Cli::parse();
    let engine_cfg = match &cli.config {
        Some(path) => load_config(path).with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Some(Command::List { dir }) => list_workflows(&dir),
        Some(Command::Run { name, inputs, debug_serial }) => run_workflow(&engine_cfg, &name, inputs, debug_serial).await,
        None => {
            println!("aromcp v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn list_workflows(dir: &PathBuf) -> Result<()> {
    let entries = std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                println!("{stem}");
            }
        }
    }
    Ok(())
}

fn parse_inputs(pairs: &[String]) -> Result<Value> {
    let mut map = serde_json::Map::new();
    for pair in pairs {
        let (key, raw) = pair.split_once('=').ok_or_else(|| anyhow!("--input '{pair}' is not KEY=VALUE"))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(Value::Object(map))
}

/// Drive a workflow to completion without a live agent attached, resolving
/// each client-visible step the way a minimal non-interactive harness would:
/// print messages, actually run client-side shell commands locally, and
/// answer everything else with `null`.
async fn run_workflow(engine_cfg: &EngineConfig, name: &str, raw_inputs: Vec<String>, debug_serial: bool) -> Result<()> {
    let manager = WorkflowInstanceManager::new(engine_cfg);
    let inputs = parse_inputs(&raw_inputs)?;
    let instance_id = manager.start(name, inputs, debug_serial).await?;
    println!("started '{name}' as {instance_id}");

    while let Some(step) = manager.get_next_step(&instance_id).await? {
        println!("--- step {} ({:?}) ---", step.id, step.kind);
        println!("{}", step.instructions);

        if !step.kind.is_blocking() {
            // `wait` steps are already cleared by `get_next_step`; nothing
            // pending is left for `step_complete` to clear.
            continue;
        }

        let result = match step.kind {
            AtomicStepKind::ShellCommand => run_client_shell(&step.definition).await?,
            _ => Value::Null,
        };
        manager.step_complete(&instance_id, &step.id, result).await?;
    }

    println!("workflow '{name}' completed");
    let state = manager.complete(&instance_id, None).await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

async fn run_client_shell(definition: &Value) -> Result<Value> {
    let command = definition.get("command").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("shell step missing 'command'"))?;
    let working_directory = definition.get("working_directory").and_then(|v| v.as_str());

    let mut parts = command.split_whitespace();
    let program = parts.next().ok_or_else(|| anyhow!("empty shell command"))?;
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(parts).stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(dir) = working_directory {
        cmd.current_dir(dir);
    }
    let output = cmd.output().await.with_context(|| format!("running '{command}'"))?;
    Ok(json!(String::from_utf8_lossy(&output.stdout).trim_end().to_string()))
}
