//! Error types raised by the step runner.

use thiserror::Error;

/// Failure of a step list.
#[derive(Error, Debug)]
pub enum RunError {
    /// No action is registered under the step's type. Fatal for the
    /// whole list.
    #[error("Unknown step type '{step_type}' at step {step_number}")]
    UnknownStepType {
        step_type: String,
        step_number: String,
    },

    /// The raw step could not be turned into a runnable step. Fatal for
    /// the whole list.
    #[error("Invalid step at {step_number}: {source}")]
    InvalidStep {
        step_number: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Step {step_number} ({name}) failed: {source}")]
    StepFailed {
        step_number: String,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// Every failure collected while running one list.
    #[error("{} steps failed: {}", .0.len(), join_messages(.0))]
    Multiple(Vec<RunError>),
}

impl RunError {
    /// Build the error raised for a failed list: the single error
    /// itself, or all of them.
    pub fn collect(mut errors: Vec<RunError>) -> RunError {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            RunError::Multiple(errors)
        }
    }

    /// Whether the error stopped the list early. A collection is fatal
    /// when any of its members is.
    pub fn is_fatal(&self) -> bool {
        match self {
            RunError::UnknownStepType { .. } | RunError::InvalidStep { .. } => true,
            RunError::Multiple(errors) => errors.iter().any(RunError::is_fatal),
            RunError::StepFailed { .. } => false,
        }
    }

    /// Flattened list of individual failure messages.
    pub fn messages(&self) -> Vec<String> {
        match self {
            RunError::Multiple(errors) => errors.iter().flat_map(RunError::messages).collect(),
            other => vec![other.to_string()],
        }
    }
}

fn join_messages(errors: &[RunError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Problems with the evaluated properties handed to an action.
#[derive(Error, Debug, PartialEq)]
pub enum PropertyError {
    #[error("Missing required property '{0}'")]
    Missing(String),

    #[error("Property '{key}' must be {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("Properties must be an object, got {0}")]
    NotAnObject(String),
}
