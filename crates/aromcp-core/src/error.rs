use thiserror::Error;

/// Top-level error type for the aromcp-core library.
///
/// Variants correspond one-to-one with the error kinds named in the
/// orchestration design: loader-time, start-time, and runtime failures are
/// distinct variants so callers can match on the kind that matters to them
/// without parsing messages.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Loader-level: bad YAML, unknown step type, missing required field,
    /// cyclic computed dependency, duplicate step id, invalid scope prefix.
    #[error("workflow definition error: {0}")]
    InvalidWorkflowDefinition(String),

    /// Start-time: missing required input, type mismatch, failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Runtime: unbound identifier, type error, disallowed identifier.
    #[error("expression error in `{expr}`: {cause}")]
    Expression { expr: String, cause: String },

    /// Attempted write to a forbidden tier or an unknown path.
    #[error("state write error: {0}")]
    StateWrite(String),

    /// A client-visible step failed, a server-internal step failed, a
    /// timeout elapsed, or a resource bound (e.g. max_iterations) was hit.
    #[error("step execution error: {0}")]
    StepExecution(String),

    /// A child workflow (sub-agent) failed.
    #[error("sub-agent error: {0}")]
    SubAgent(String),

    /// `step_complete` for a non-matching id, `get_next_step` on a completed
    /// workflow, or an unknown workflow id.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Engine configuration parse or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn expression(expr: impl Into<String>, cause: impl Into<String>) -> Self {
        EngineError::Expression {
            expr: expr.into(),
            cause: cause.into(),
        }
    }

    /// Short, greppable classifier used as `WorkflowErrorRecord::kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidWorkflowDefinition(_) => "invalid_workflow_definition",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Expression { .. } => "expression_error",
            EngineError::StateWrite(_) => "state_write_error",
            EngineError::StepExecution(_) => "step_execution_error",
            EngineError::SubAgent(_) => "sub_agent_error",
            EngineError::Protocol(_) => "protocol_error",
            EngineError::Config(_) => "config_error",
            EngineError::Io(_) => "io_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = EngineError::Config("missing field".into());
        assert_eq!(err.to_string(), "config error: missing field");
    }

    #[test]
    fn expression_error_display() {
        let err = EngineError::expression("this.x +", "unexpected end of input");
        assert_eq!(
            err.to_string(),
            "expression error in `this.x +`: unexpected end of input"
        );
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let engine_err: EngineError = io_err.into();
        assert!(matches!(engine_err, EngineError::Io(_)));
    }
}
