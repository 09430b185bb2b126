//! Error types for the scenario engine
//!
//! Errors are grouped by when they can happen: configuration errors abort a
//! run before any step executes, template errors surface while rendering,
//! execution and extraction errors are attached to individual steps.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the scenario engine
#[derive(Error, Debug)]
pub enum Error {
    // === Configuration Errors ===
    #[error("Circular dependency detected: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("Step '{step}' depends on non-existent step '{missing}'")]
    UnknownStepReference { step: String, missing: String },

    #[error("Step name '{0}' is declared more than once")]
    DuplicateStep(String),

    #[error("Tool '{tool}' not found for step '{step}'")]
    ToolNotFound { step: String, tool: String },

    #[error("Scenario '{0}' not found")]
    ScenarioNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === Template Errors ===
    #[error("Template syntax error in '{expression}': {message}")]
    TemplateSyntax { expression: String, message: String },

    #[error("Unresolved reference '{path}'")]
    UnresolvedReference { path: String },

    #[error("Expression error: {0}")]
    Eval(String),

    // === Execution Errors ===
    #[error("Failed to spawn '{command}': {reason}")]
    ProcessSpawn { command: String, reason: String },

    // === Extraction Errors ===
    #[error("Failed to extract output '{output}': {cause}")]
    OutputExtraction { output: String, cause: String },

    #[error("Function '{0}' is not registered")]
    UnknownFunction(String),

    #[error("{function}: {message}")]
    Function { function: String, message: String },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error in '{path}': {error}")]
    Yaml { path: String, error: String },

    #[error("Failed to load data source '{path}': {error}")]
    DataSource { path: String, error: String },

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a template syntax error
    pub fn template_syntax(expression: &str, message: impl Into<String>) -> Self {
        Self::TemplateSyntax {
            expression: expression.to_string(),
            message: message.into(),
        }
    }

    /// Create an unresolved reference error
    pub fn unresolved(path: impl Into<String>) -> Self {
        Self::UnresolvedReference { path: path.into() }
    }

    /// Create an output extraction error
    pub fn extraction(output: &str, cause: impl ToString) -> Self {
        Self::OutputExtraction {
            output: output.to_string(),
            cause: cause.to_string(),
        }
    }

    /// Create an error raised inside a registered function
    pub fn function(function: &str, message: impl Into<String>) -> Self {
        Self::Function {
            function: function.to_string(),
            message: message.into(),
        }
    }

    /// Create an unknown step reference error
    pub fn unknown_step(step: &str, missing: &str) -> Self {
        Self::UnknownStepReference {
            step: step.to_string(),
            missing: missing.to_string(),
        }
    }

    /// Whether this error is detected before any step runs
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Cycle { .. }
                | Error::UnknownStepReference { .. }
                | Error::DuplicateStep(_)
                | Error::ToolNotFound { .. }
                | Error::ScenarioNotFound(_)
                | Error::TemplateSyntax { .. }
                | Error::Config(_)
                | Error::ConfigParse(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_path() {
        let err = Error::Cycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Circular dependency detected: a -> b -> a");
        assert!(err.is_configuration());
    }

    #[test]
    fn test_runtime_errors_are_not_configuration() {
        let spawn = Error::ProcessSpawn {
            command: "x".into(),
            reason: "not found".into(),
        };
        assert!(!spawn.is_configuration());
        assert!(!Error::unresolved("steps.a.outputs.x").is_configuration());
    }
}
