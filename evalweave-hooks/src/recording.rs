//! In-memory backends that record every outbound call.
//!
//! Used by the test suites and by hosts that want a dry run. Both recorders
//! track which handles are open so a test can assert nothing leaked, and
//! both can be told to refuse specific operations.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evalweave_core::ProjectIdentity;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backend::{
    CallId, EvaluationClose, EvaluationId, EvaluationSpec, PredictionId, RunExit, RunTracker,
    SessionId, SessionOptions, TrackedRunId, TrackedRunSpec, TracingBackend,
};
use crate::error::{BackendError, BackendResult};
use crate::format::ScoreShape;

/// A call with the time it was made.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recorded<C> {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub call: C,
}

struct Recorder<C> {
    calls: Vec<Recorded<C>>,
    open: BTreeSet<String>,
    closed: HashSet<String>,
    failing: HashSet<&'static str>,
    refused: Vec<&'static str>,
}

impl<C> Recorder<C> {
    fn new(failing: HashSet<&'static str>) -> Self {
        Self {
            calls: Vec::new(),
            open: BTreeSet::new(),
            closed: HashSet::new(),
            failing,
            refused: Vec::new(),
        }
    }

    fn check(&mut self, operation: &'static str) -> BackendResult<()> {
        if self.failing.contains(operation) {
            self.refused.push(operation);
            return Err(BackendError::request(operation, "injected failure"));
        }
        Ok(())
    }

    fn require_open(&self, kind: &'static str, id: &str) -> BackendResult<()> {
        if self.open.contains(id) {
            Ok(())
        } else if self.closed.contains(id) {
            Err(BackendError::AlreadyClosed {
                kind,
                id: id.to_string(),
            })
        } else {
            Err(BackendError::UnknownHandle {
                kind,
                id: id.to_string(),
            })
        }
    }

    fn open_handle(&mut self, prefix: &str) -> String {
        let id = format!("{prefix}-{}", Uuid::new_v4());
        self.open.insert(id.clone());
        id
    }

    fn close_handle(&mut self, kind: &'static str, id: &str) -> BackendResult<()> {
        self.require_open(kind, id)?;
        self.open.remove(id);
        self.closed.insert(id.to_string());
        Ok(())
    }

    fn record(&mut self, call: C) {
        self.calls.push(Recorded {
            at: Utc::now(),
            call,
        });
    }
}

/// One call made to a [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BackendCall {
    OpenSession {
        session: SessionId,
        identity: ProjectIdentity,
        options: SessionOptions,
    },
    CloseSession {
        session: SessionId,
    },
    OpenEvaluation {
        evaluation: EvaluationId,
        spec: EvaluationSpec,
    },
    EnterCallContext {
        evaluation: EvaluationId,
    },
    OpenCall {
        call: CallId,
        evaluation: EvaluationId,
        op_name: String,
    },
    CloseCall {
        call: CallId,
    },
    CloseEvaluation {
        evaluation: EvaluationId,
        close: EvaluationClose,
    },
    OpenPrediction {
        prediction: PredictionId,
        evaluation: EvaluationId,
        inputs: Value,
        output: Value,
    },
    LogScore {
        prediction: PredictionId,
        scorer: String,
        score: ScoreShape,
        attributes: serde_json::Map<String, Value>,
    },
    SetPredictionAttributes {
        prediction: PredictionId,
        attributes: serde_json::Map<String, Value>,
    },
    ClosePrediction {
        prediction: PredictionId,
    },
}

impl BackendCall {
    pub fn operation(&self) -> &'static str {
        match self {
            BackendCall::OpenSession { .. } => "open_session",
            BackendCall::CloseSession { .. } => "close_session",
            BackendCall::OpenEvaluation { .. } => "open_evaluation",
            BackendCall::EnterCallContext { .. } => "enter_call_context",
            BackendCall::OpenCall { .. } => "open_call",
            BackendCall::CloseCall { .. } => "close_call",
            BackendCall::CloseEvaluation { .. } => "close_evaluation",
            BackendCall::OpenPrediction { .. } => "open_prediction",
            BackendCall::LogScore { .. } => "log_score",
            BackendCall::SetPredictionAttributes { .. } => "set_prediction_attributes",
            BackendCall::ClosePrediction { .. } => "close_prediction",
        }
    }
}

/// A [`TracingBackend`] that keeps every successful call in memory.
pub struct RecordingBackend {
    state: Mutex<Recorder<BackendCall>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::failing(&[])
    }

    /// A backend that refuses the named operations with a request error.
    pub fn failing(operations: &[&'static str]) -> Self {
        Self {
            state: Mutex::new(Recorder::new(operations.iter().copied().collect())),
        }
    }

    pub async fn calls(&self) -> Vec<BackendCall> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .map(|r| r.call.clone())
            .collect()
    }

    pub async fn recorded(&self) -> Vec<Recorded<BackendCall>> {
        self.state.lock().await.calls.clone()
    }

    pub async fn operations(&self) -> Vec<&'static str> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .map(|r| r.call.operation())
            .collect()
    }

    pub async fn count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|r| r.call.operation() == operation)
            .count()
    }

    /// Operations that were refused by failure injection.
    pub async fn refused(&self) -> Vec<&'static str> {
        self.state.lock().await.refused.clone()
    }

    /// Handles opened but never closed.
    pub async fn open_handles(&self) -> Vec<String> {
        self.state.lock().await.open.iter().cloned().collect()
    }
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TracingBackend for RecordingBackend {
    async fn open_session(
        &self,
        identity: &ProjectIdentity,
        options: &SessionOptions,
    ) -> BackendResult<SessionId> {
        let mut state = self.state.lock().await;
        state.check("open_session")?;
        let session = SessionId::new(state.open_handle("session"));
        state.record(BackendCall::OpenSession {
            session: session.clone(),
            identity: identity.clone(),
            options: *options,
        });
        Ok(session)
    }

    async fn close_session(&self, session: &SessionId) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        state.check("close_session")?;
        state.close_handle("session", session.as_str())?;
        state.record(BackendCall::CloseSession {
            session: session.clone(),
        });
        Ok(())
    }

    async fn open_evaluation(
        &self,
        session: &SessionId,
        spec: &EvaluationSpec,
    ) -> BackendResult<EvaluationId> {
        let mut state = self.state.lock().await;
        state.check("open_evaluation")?;
        state.require_open("session", session.as_str())?;
        let evaluation = EvaluationId::new(state.open_handle("evaluation"));
        state.record(BackendCall::OpenEvaluation {
            evaluation: evaluation.clone(),
            spec: spec.clone(),
        });
        Ok(evaluation)
    }

    async fn enter_call_context(&self, evaluation: &EvaluationId) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        state.check("enter_call_context")?;
        state.require_open("evaluation", evaluation.as_str())?;
        state.record(BackendCall::EnterCallContext {
            evaluation: evaluation.clone(),
        });
        Ok(())
    }

    async fn open_call(&self, evaluation: &EvaluationId, op_name: &str) -> BackendResult<CallId> {
        let mut state = self.state.lock().await;
        state.check("open_call")?;
        state.require_open("evaluation", evaluation.as_str())?;
        let call = CallId::new(state.open_handle("call"));
        state.record(BackendCall::OpenCall {
            call: call.clone(),
            evaluation: evaluation.clone(),
            op_name: op_name.to_string(),
        });
        Ok(call)
    }

    async fn close_call(&self, call: &CallId) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        state.check("close_call")?;
        state.close_handle("call", call.as_str())?;
        state.record(BackendCall::CloseCall { call: call.clone() });
        Ok(())
    }

    async fn close_evaluation(
        &self,
        evaluation: &EvaluationId,
        close: EvaluationClose,
    ) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        state.check("close_evaluation")?;
        state.close_handle("evaluation", evaluation.as_str())?;
        state.record(BackendCall::CloseEvaluation {
            evaluation: evaluation.clone(),
            close,
        });
        Ok(())
    }

    async fn open_prediction(
        &self,
        evaluation: &EvaluationId,
        inputs: Value,
        output: Value,
    ) -> BackendResult<PredictionId> {
        let mut state = self.state.lock().await;
        state.check("open_prediction")?;
        state.require_open("evaluation", evaluation.as_str())?;
        let prediction = PredictionId::new(state.open_handle("prediction"));
        state.record(BackendCall::OpenPrediction {
            prediction: prediction.clone(),
            evaluation: evaluation.clone(),
            inputs,
            output,
        });
        Ok(prediction)
    }

    async fn log_score(
        &self,
        prediction: &PredictionId,
        scorer: &str,
        score: &ScoreShape,
        attributes: &serde_json::Map<String, Value>,
    ) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        state.check("log_score")?;
        state.require_open("prediction", prediction.as_str())?;
        state.record(BackendCall::LogScore {
            prediction: prediction.clone(),
            scorer: scorer.to_string(),
            score: score.clone(),
            attributes: attributes.clone(),
        });
        Ok(())
    }

    async fn set_prediction_attributes(
        &self,
        prediction: &PredictionId,
        attributes: &serde_json::Map<String, Value>,
    ) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        state.check("set_prediction_attributes")?;
        state.require_open("prediction", prediction.as_str())?;
        state.record(BackendCall::SetPredictionAttributes {
            prediction: prediction.clone(),
            attributes: attributes.clone(),
        });
        Ok(())
    }

    async fn close_prediction(&self, prediction: &PredictionId) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        state.check("close_prediction")?;
        state.close_handle("prediction", prediction.as_str())?;
        state.record(BackendCall::ClosePrediction {
            prediction: prediction.clone(),
        });
        Ok(())
    }
}

/// One call made to a [`RecordingRunTracker`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TrackerCall {
    InitRun {
        run: TrackedRunId,
        spec: TrackedRunSpec,
    },
    LogMetrics {
        run: TrackedRunId,
        metrics: std::collections::BTreeMap<String, f64>,
    },
    UploadFile {
        run: TrackedRunId,
        path: PathBuf,
    },
    FinishRun {
        run: TrackedRunId,
        exit: RunExit,
    },
}

impl TrackerCall {
    pub fn operation(&self) -> &'static str {
        match self {
            TrackerCall::InitRun { .. } => "init_run",
            TrackerCall::LogMetrics { .. } => "log_metrics",
            TrackerCall::UploadFile { .. } => "upload_file",
            TrackerCall::FinishRun { .. } => "finish_run",
        }
    }
}

/// A [`RunTracker`] that keeps every successful call in memory.
pub struct RecordingRunTracker {
    state: Mutex<Recorder<TrackerCall>>,
}

impl RecordingRunTracker {
    pub fn new() -> Self {
        Self::failing(&[])
    }

    pub fn failing(operations: &[&'static str]) -> Self {
        Self {
            state: Mutex::new(Recorder::new(operations.iter().copied().collect())),
        }
    }

    pub async fn recorded(&self) -> Vec<Recorded<TrackerCall>> {
        self.state.lock().await.calls.clone()
    }

    pub async fn calls(&self) -> Vec<TrackerCall> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .map(|r| r.call.clone())
            .collect()
    }

    pub async fn refused(&self) -> Vec<&'static str> {
        self.state.lock().await.refused.clone()
    }

    pub async fn open_handles(&self) -> Vec<String> {
        self.state.lock().await.open.iter().cloned().collect()
    }
}

impl Default for RecordingRunTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunTracker for RecordingRunTracker {
    async fn init_run(&self, spec: &TrackedRunSpec) -> BackendResult<TrackedRunId> {
        let mut state = self.state.lock().await;
        state.check("init_run")?;
        let run = TrackedRunId::new(state.open_handle("run"));
        state.record(TrackerCall::InitRun {
            run: run.clone(),
            spec: spec.clone(),
        });
        Ok(run)
    }

    async fn log_metrics(
        &self,
        run: &TrackedRunId,
        metrics: &std::collections::BTreeMap<String, f64>,
    ) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        state.check("log_metrics")?;
        state.require_open("run", run.as_str())?;
        state.record(TrackerCall::LogMetrics {
            run: run.clone(),
            metrics: metrics.clone(),
        });
        Ok(())
    }

    async fn upload_file(&self, run: &TrackedRunId, path: &Path) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        state.check("upload_file")?;
        state.require_open("run", run.as_str())?;
        state.record(TrackerCall::UploadFile {
            run: run.clone(),
            path: path.to_path_buf(),
        });
        Ok(())
    }

    async fn finish_run(&self, run: &TrackedRunId, exit: RunExit) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        state.check("finish_run")?;
        state.close_handle("run", run.as_str())?;
        state.record(TrackerCall::FinishRun {
            run: run.clone(),
            exit,
        });
        Ok(())
    }
}
