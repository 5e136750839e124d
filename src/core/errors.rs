use std::time::Duration;
use thiserror::Error;

/// Unified error type for the planboard crate
#[derive(Debug, Error)]
pub enum BoardError {
    /// Seed or input validation errors; raised before any scheduling happens
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Configuration and registry construction errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// A single task exceeded its timeout
    #[error("Task timeout: {task_id} (timeout: {timeout:?})")]
    TaskTimeout { task_id: String, timeout: Duration },

    /// A single task returned an error or panicked
    #[error("Task execution failed: {task_id} - {reason}")]
    TaskExecution { task_id: String, reason: String },

    /// No task can become ready while some remain pending
    #[error("Deadlock: no task ready while {} remain pending", .pending.len())]
    Deadlock { pending: Vec<String> },

    /// Safety valve against preconditions that never stabilize
    #[error("Iteration cap exceeded after {iterations} supersteps ({} pending)", .pending.len())]
    IterationCapExceeded { iterations: u32, pending: Vec<String> },

    /// A batch would overwrite an output or re-finish a task
    #[error("Conflicting batch: {message}")]
    Conflict {
        message: String,
        task_id: Option<String>,
    },

    /// The run already reached a terminal status
    #[error("Run {run_id} is archived with status {status}")]
    Archived { run_id: String, status: String },

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Run already exists: {run_id}")]
    RunAlreadyExists { run_id: String },

    /// Checkpoint store errors
    #[error("Persistence operation failed: {operation}")]
    Persistence {
        operation: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BoardError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error with field
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error with field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn task_timeout<S: Into<String>>(task_id: S, timeout: Duration) -> Self {
        Self::TaskTimeout {
            task_id: task_id.into(),
            timeout,
        }
    }

    pub fn task_execution<S: Into<String>, R: Into<String>>(task_id: S, reason: R) -> Self {
        Self::TaskExecution {
            task_id: task_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a conflict error for a task
    pub fn conflict<S: Into<String>, T: Into<String>>(task_id: T, message: S) -> Self {
        Self::Conflict {
            message: message.into(),
            task_id: Some(task_id.into()),
        }
    }

    /// Create a persistence error with source
    pub fn persistence<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Persistence {
            operation: operation.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a persistence error without an underlying cause
    pub fn persistence_msg<S: Into<String>>(operation: S) -> Self {
        Self::Persistence {
            operation: operation.into(),
            source: None,
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Per-task errors are absorbed into the run; everything else is run-level
    pub fn is_task_level(&self) -> bool {
        matches!(self, Self::TaskTimeout { .. } | Self::TaskExecution { .. })
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::TaskTimeout { .. } | Self::Io { .. } | Self::Persistence { .. } => true,
            Self::Validation { .. } | Self::Configuration { .. } => false,
            Self::Deadlock { .. } | Self::IterationCapExceeded { .. } | Self::Conflict { .. } => {
                false
            }
            _ => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Configuration { .. } => "configuration",
            Self::TaskTimeout { .. } => "task_timeout",
            Self::TaskExecution { .. } => "task_execution",
            Self::Deadlock { .. } => "deadlock",
            Self::IterationCapExceeded { .. } => "iteration_cap_exceeded",
            Self::Conflict { .. } => "conflict",
            Self::Archived { .. } => "archived",
            Self::RunNotFound { .. } | Self::RunAlreadyExists { .. } => "run",
            Self::Persistence { .. } => "persistence",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, BoardError>;

impl From<std::io::Error> for BoardError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            operation: "io_operation".to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for BoardError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for BoardError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<sled::Error> for BoardError {
    fn from(err: sled::Error) -> Self {
        Self::persistence("sled_operation", err)
    }
}
