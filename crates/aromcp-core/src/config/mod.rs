use std::path::Path;

use thiserror::Error;

mod schema;

pub use schema::{DefaultsConfig, EngineConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    #[error("config validation error: {message}")]
    Validation { message: String },
}

/// Load and validate an `EngineConfig` from a TOML file path.
///
/// Returns the default config if the file does not exist, matching the
/// "missing file is not an error" convention used across this engine's
/// optional configuration surfaces.
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(EngineConfig::default());
    }

    let data = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        source: e,
    })?;

    parse_config(&data)
}

/// Parse and validate an `EngineConfig` from a TOML string.
pub fn parse_config(data: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(data)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
    let d = &config.defaults;

    if d.while_loop_max_iterations == 0 {
        return Err(ConfigError::Validation {
            message: "defaults.while_loop_max_iterations must be > 0".to_string(),
        });
    }

    if d.shell_timeout_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "defaults.shell_timeout_seconds must be > 0".to_string(),
        });
    }

    if d.agent_task_timeout_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "defaults.agent_task_timeout_seconds must be > 0".to_string(),
        });
    }

    if d.shell_output_cap_bytes == 0 {
        return Err(ConfigError::Validation {
            message: "defaults.shell_output_cap_bytes must be > 0".to_string(),
        });
    }

    if d.max_parallel_default == 0 {
        return Err(ConfigError::Validation {
            message: "defaults.max_parallel_default must be > 0".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_validation() {
        let config = EngineConfig::default();
        validate(&config).unwrap();
    }

    #[test]
    fn minimal_toml_parses_to_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.defaults.while_loop_max_iterations, 100);
        assert_eq!(config.defaults.shell_timeout_seconds, 60);
        assert_eq!(config.defaults.agent_task_timeout_seconds, 300);
        assert_eq!(config.defaults.max_parallel_default, 5);
        assert!(!config.hot_reload);
    }

    #[test]
    fn full_example_config_parses() {
        let data = r#"
workflows_path = ["/opt/shared/workflows"]
hot_reload = true

[defaults]
while_loop_max_iterations = 50
shell_timeout_seconds = 30
agent_task_timeout_seconds = 120
shell_output_cap_bytes = 2048
max_parallel_default = 3
"#;

        let config = parse_config(data).unwrap();
        assert_eq!(
            config.workflows_path,
            vec![std::path::PathBuf::from("/opt/shared/workflows")]
        );
        assert!(config.hot_reload);
        assert_eq!(config.defaults.while_loop_max_iterations, 50);
        assert_eq!(config.defaults.max_parallel_default, 3);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let data = r#"
[defaults]
max_parallel_default = 10
"#;
        let config = parse_config(data).unwrap();
        assert_eq!(config.defaults.max_parallel_default, 10);
        assert_eq!(config.defaults.shell_timeout_seconds, 60);
    }

    #[test]
    fn zero_max_iterations_rejected() {
        let data = r#"
[defaults]
while_loop_max_iterations = 0
"#;
        let err = parse_config(data).unwrap_err();
        assert!(err.to_string().contains("while_loop_max_iterations"));
    }

    #[test]
    fn zero_max_parallel_rejected() {
        let data = r#"
[defaults]
max_parallel_default = 0
"#;
        let err = parse_config(data).unwrap_err();
        assert!(err.to_string().contains("max_parallel_default"));
    }

    #[test]
    fn unknown_field_in_toml_returns_parse_error() {
        let data = "nonexistent_field = \"bad\"";
        let err = parse_config(data).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = load_config(Path::new("/tmp/nonexistent-aromcp-test.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
