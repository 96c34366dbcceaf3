//! Error types for settings resolution.
//!
//! Uses `thiserror` for the public error surface. Every variant is fatal for
//! the group being resolved; soft misses (an absent or unreadable tracking
//! identity file) never surface here.

use std::path::PathBuf;

/// Errors raised while resolving a settings group.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{group} settings: missing required field '{field}'")]
    MissingField { group: &'static str, field: String },

    #[error("{group} settings: field '{field}' must not be blank")]
    BlankField { group: &'static str, field: String },

    #[error("{group} settings: invalid value for field '{field}' from {source_name}: {reason}")]
    InvalidValue {
        group: &'static str,
        field: String,
        source_name: String,
        reason: String,
    },

    #[error("Malformed settings source {path}: {message}")]
    MalformedSource { path: PathBuf, message: String },

    #[error("Failed to read settings source {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot determine working directory: {0}")]
    WorkingDirectory(#[source] std::io::Error),

    #[error("{group} settings: {source}")]
    Extract {
        group: &'static str,
        #[source]
        source: Box<figment::Error>,
    },
}

impl ConfigError {
    /// Translate a figment extraction failure, surfacing missing fields as
    /// [`ConfigError::MissingField`] so callers can match on them.
    pub(crate) fn from_figment(group: &'static str, err: figment::Error) -> Self {
        match &err.kind {
            figment::error::Kind::MissingField(field) => Self::MissingField {
                group,
                field: field.to_string(),
            },
            _ => Self::Extract {
                group,
                source: Box::new(err),
            },
        }
    }

    /// True when the failure means no project identity could be resolved.
    ///
    /// The lifecycle hooks treat this as "integration disabled" rather than
    /// as a startup failure.
    pub fn is_missing_identity(&self) -> bool {
        match self {
            Self::MissingField { field, .. } | Self::BlankField { field, .. } => {
                field == "entity" || field == "project"
            }
            _ => false,
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, ConfigError>;
