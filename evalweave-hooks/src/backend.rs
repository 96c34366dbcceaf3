//! Outbound contracts: the tracing backend and the run tracker.
//!
//! Every open call hands back an opaque handle that later calls refer to.
//! Implementations must be safe to share across tasks; predictions for
//! different samples of one evaluation may be opened concurrently.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use evalweave_core::ProjectIdentity;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BackendResult;
use crate::format::ScoreShape;

macro_rules! handle_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

handle_id!(
    /// An open tracing session, one per run.
    SessionId
);
handle_id!(
    /// An open evaluation record, one per task.
    EvaluationId
);
handle_id!(
    /// An open prediction record, one per sample.
    PredictionId
);
handle_id!(
    /// An open call span.
    CallId
);
handle_id!(
    /// A tracked run on the run tracker.
    TrackedRunId
);

/// Display options for a tracing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Print a link to each traced call on the console.
    pub print_call_link: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            print_call_link: false,
        }
    }
}

/// Everything the backend needs to open an evaluation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSpec {
    pub name: String,
    pub dataset: String,
    pub model: String,
    pub metadata: BTreeMap<String, String>,
}

/// `scorer -> metric -> value`
pub type EvaluationSummary = BTreeMap<String, BTreeMap<String, f64>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationFailure {
    pub message: String,
    pub detail: String,
}

/// How an evaluation record is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EvaluationClose {
    Summary(EvaluationSummary),
    Failure(EvaluationFailure),
    Success,
}

/// The evaluation tracing backend.
#[async_trait]
pub trait TracingBackend: Send + Sync {
    async fn open_session(
        &self,
        identity: &ProjectIdentity,
        options: &SessionOptions,
    ) -> BackendResult<SessionId>;

    async fn close_session(&self, session: &SessionId) -> BackendResult<()>;

    async fn open_evaluation(
        &self,
        session: &SessionId,
        spec: &EvaluationSpec,
    ) -> BackendResult<EvaluationId>;

    /// Attribute calls made from now on to `evaluation`.
    async fn enter_call_context(&self, evaluation: &EvaluationId) -> BackendResult<()>;

    async fn open_call(&self, evaluation: &EvaluationId, op_name: &str) -> BackendResult<CallId>;

    async fn close_call(&self, call: &CallId) -> BackendResult<()>;

    async fn close_evaluation(
        &self,
        evaluation: &EvaluationId,
        close: EvaluationClose,
    ) -> BackendResult<()>;

    async fn open_prediction(
        &self,
        evaluation: &EvaluationId,
        inputs: Value,
        output: Value,
    ) -> BackendResult<PredictionId>;

    async fn log_score(
        &self,
        prediction: &PredictionId,
        scorer: &str,
        score: &ScoreShape,
        attributes: &serde_json::Map<String, Value>,
    ) -> BackendResult<()>;

    /// Attach attributes to the prediction record itself.
    async fn set_prediction_attributes(
        &self,
        prediction: &PredictionId,
        attributes: &serde_json::Map<String, Value>,
    ) -> BackendResult<()>;

    async fn close_prediction(&self, prediction: &PredictionId) -> BackendResult<()>;
}

/// Parameters for a new tracked run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedRunSpec {
    pub entity: String,
    pub project: String,
    pub name: String,
    pub config: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunExit {
    Success,
    Failed,
}

impl RunExit {
    pub fn exit_code(self) -> i32 {
        match self {
            RunExit::Success => 0,
            RunExit::Failed => 1,
        }
    }
}

/// The run-metadata tracker.
#[async_trait]
pub trait RunTracker: Send + Sync {
    async fn init_run(&self, spec: &TrackedRunSpec) -> BackendResult<TrackedRunId>;

    async fn log_metrics(
        &self,
        run: &TrackedRunId,
        metrics: &BTreeMap<String, f64>,
    ) -> BackendResult<()>;

    async fn upload_file(&self, run: &TrackedRunId, path: &Path) -> BackendResult<()>;

    async fn finish_run(&self, run: &TrackedRunId, exit: RunExit) -> BackendResult<()>;
}
