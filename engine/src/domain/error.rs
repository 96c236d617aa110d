//! Domain-level errors
//! These represent rule violations and probe failures, not action outcomes.
//! A failed start/stop/restart is reported as a boolean result, and a trigger
//! veto is a `TriggerResponse` flag; neither is a `DomainError`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    // Lookup errors
    #[error("No such process: {0}")]
    ProcessNotFound(String),

    #[error("Missing process name")]
    MissingProcessName,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Process '{0}' already exists")]
    DuplicateProcess(String),

    // Validation errors
    #[error("Invalid process name: {0}")]
    InvalidName(String),

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // Execution errors
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Condition probe failed: {0}")]
    ProbeFailed(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DomainError {
    fn from(e: std::io::Error) -> Self {
        DomainError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;
