use std::collections::HashMap;
use thiserror::Error;

/// Unified error type for the orchestration substrate
#[derive(Debug, Error)]
pub enum MaestroError {
    /// Execution-related errors
    #[error("Execution failed in {component}: {message}")]
    Execution {
        component: String,
        message: String,
        context: HashMap<String, String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Database/persistence errors
    #[error("Database operation failed: {operation}")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Task body failures
    #[error("Task error: {task_id} - {message}")]
    Task { task_id: String, message: String },

    /// No handler registered for a task `type` tag
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    /// Step descriptor carries a `type` tag that is neither `workflow` nor `task`
    #[error("Unknown step type: {0}")]
    UnknownStepType(String),

    /// Lookup of an unregistered workflow, process or task
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Illegal lifecycle transition
    #[error("Invalid state for {kind} {id}: {message}")]
    InvalidState {
        kind: &'static str,
        id: String,
        message: String,
    },

    /// Process dependencies would form a cycle
    #[error("Dependency cycle detected involving process {process_id}")]
    DependencyCycle { process_id: String },

    /// Timeout errors
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Cancellation errors
    #[error("Operation was cancelled: {operation}")]
    Cancelled { operation: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl MaestroError {
    /// Create an execution error
    pub fn execution<S: Into<String>, M: Into<String>>(component: S, message: M) -> Self {
        Self::Execution {
            component: component.into(),
            message: message.into(),
            context: HashMap::new(),
            source: None,
        }
    }

    /// Add context to an execution error
    pub fn with_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        if let Self::Execution { ref mut context, .. } = self {
            context.insert(key.into(), value.into());
        }
        self
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn database<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
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

    pub fn task<S: Into<String>, M: Into<String>>(task_id: S, message: M) -> Self {
        Self::Task {
            task_id: task_id.into(),
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(kind: &'static str, id: S) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid_state<S: Into<String>, M: Into<String>>(
        kind: &'static str,
        id: S,
        message: M,
    ) -> Self {
        Self::InvalidState {
            kind,
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Io { .. } | Self::Database { .. } => true,
            Self::Task { .. } | Self::Execution { .. } => true,
            Self::Validation { .. }
            | Self::Configuration { .. }
            | Self::UnknownTaskType(_)
            | Self::UnknownStepType(_)
            | Self::DependencyCycle { .. } => false,
            Self::Cancelled { .. } => false,
            _ => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Execution { .. } => "execution",
            Self::Validation { .. } => "validation",
            Self::Configuration { .. } => "configuration",
            Self::Database { .. } => "database",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Task { .. } => "task",
            Self::UnknownTaskType(_) | Self::UnknownStepType(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::InvalidState { .. } => "state",
            Self::DependencyCycle { .. } => "dependency",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, MaestroError>;

impl From<std::io::Error> for MaestroError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for MaestroError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for MaestroError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<bincode::Error> for MaestroError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization("bincode", err)
    }
}

impl From<sled::Error> for MaestroError {
    fn from(err: sled::Error) -> Self {
        Self::database("sled_operation", err)
    }
}

impl From<anyhow::Error> for MaestroError {
    fn from(err: anyhow::Error) -> Self {
        Self::execution("handler", err.to_string()).with_context("source", "anyhow")
    }
}
