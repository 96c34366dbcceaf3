//! Evaluation lifecycle hooks.
//!
//! [`EvaluationHooks`] writes tasks, samples and scores as evaluation records
//! on a [`TracingBackend`]; [`RunUploadHooks`] records run config, metrics and
//! files on a [`RunTracker`]. Both are driven by the host through the
//! [`EvalHooks`] trait, usually via a [`HookRegistry`].

pub mod backend;
pub mod error;
pub mod evaluation;
pub mod events;
pub mod format;
pub mod hooks;
pub mod recording;
pub mod telemetry;
pub mod upload;

use std::sync::Arc;

use evalweave_core::SettingsLoader;

pub use backend::{RunTracker, TracingBackend};
pub use error::{BackendError, FormatError, HookError, Result};
pub use evaluation::EvaluationHooks;
pub use events::HookEvent;
pub use format::{ScoreShape, format_model_name, format_score};
pub use hooks::{DispatchFailure, EvalHooks, HookRegistry};
pub use recording::{RecordingBackend, RecordingRunTracker};
pub use upload::RunUploadHooks;

/// A registry with both integrations, sharing one settings loader.
pub fn default_registry(
    backend: Arc<dyn TracingBackend>,
    tracker: Arc<dyn RunTracker>,
    loader: SettingsLoader,
) -> HookRegistry {
    let mut registry = HookRegistry::new();
    registry.register(
        evaluation::HOOK_NAME,
        evaluation::HOOK_DESCRIPTION,
        Arc::new(EvaluationHooks::new(backend, loader.clone())),
    );
    registry.register(
        upload::HOOK_NAME,
        upload::HOOK_DESCRIPTION,
        Arc::new(RunUploadHooks::new(tracker, loader)),
    );
    registry
}
