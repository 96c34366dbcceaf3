//! Error types for the lifecycle hooks.

use evalweave_core::ConfigError;

/// Errors returned from hook callbacks.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// The host delivered an event out of order, e.g. `on_sample_end` before
    /// any `on_task_start`. This is a contract violation, not a runtime fault.
    #[error("Hook '{hook}' received {event} with no active {missing}")]
    Precondition {
        hook: &'static str,
        event: &'static str,
        missing: &'static str,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Score formatting error: {0}")]
    Format(#[from] FormatError),
}

impl HookError {
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition { .. })
    }
}

/// Errors reported by a tracing backend or run tracker.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("{operation} failed: {message}")]
    Request {
        operation: &'static str,
        message: String,
    },

    #[error("Unknown {kind} handle: {id}")]
    UnknownHandle { kind: &'static str, id: String },

    #[error("{kind} {id} is already closed")]
    AlreadyClosed { kind: &'static str, id: String },
}

impl BackendError {
    pub fn request(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Request {
            operation,
            message: message.into(),
        }
    }
}

/// Score values the backend cannot ingest.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormatError {
    #[error("Sequence score with {len} elements cannot be logged; expected exactly one")]
    SequenceLength { len: usize },
}

pub type Result<T> = std::result::Result<T, HookError>;
pub type BackendResult<T> = std::result::Result<T, BackendError>;
