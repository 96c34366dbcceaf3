//! Lifecycle hooks that write each task as an evaluation record.
//!
//! One run maps to one tracing session, one task to one evaluation record and
//! one sample to one prediction record. The controller holds only the open
//! handles; all payload data flows straight through to the backend.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use evalweave_core::{SettingsGroup, SettingsLoader};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::backend::{
    CallId, EvaluationClose, EvaluationFailure, EvaluationId, EvaluationSpec, EvaluationSummary,
    PredictionId, SessionId, SessionOptions, TracingBackend,
};
use crate::error::{HookError, Result};
use crate::events::{EvalLog, EvalSample, RunEnd, RunStart, SampleEnd, TaskEnd, TaskStart};
use crate::format::{ScoreShape, format_model_name, format_score, stringify};
use crate::hooks::EvalHooks;
use crate::telemetry::{SAMPLE_TELEMETRY, TelemetryEntry};

pub const HOOK_NAME: &str = "weave_evaluation_hooks";
pub const HOOK_DESCRIPTION: &str = "Integration hooks for writing evaluation results to Weave";

/// Dataset label used when a task does not name its dataset.
pub const DEFAULT_DATASET: &str = "test_dataset";
pub const RUN_ID_KEY: &str = "inspect_run_id";
pub const TASK_ID_KEY: &str = "inspect_task_id";
pub const EVAL_ID_KEY: &str = "inspect_eval_id";
/// Name of the call span wrapping each task when autopatch is on.
pub const TASK_OP_NAME: &str = "inspect_task";
pub const RUN_FAILED_MESSAGE: &str = "Inspect run failed";

#[derive(Debug, Default)]
enum RunState {
    /// No run in flight.
    #[default]
    Idle,
    /// A run is in flight but tracing is off for it.
    Inert,
    Active(ActiveRun),
}

#[derive(Debug)]
struct ActiveRun {
    run_id: String,
    session: SessionId,
    autopatch: bool,
    evaluation: Option<ActiveEvaluation>,
}

#[derive(Debug)]
struct ActiveEvaluation {
    id: EvaluationId,
    task: String,
    task_call: Option<CallId>,
    finalized: bool,
}

/// What an event handler needs from the run state.
enum Lookup<T> {
    Skip,
    Found(T),
}

/// Writes evaluation records, predictions and scores to a tracing backend.
pub struct EvaluationHooks {
    backend: Arc<dyn TracingBackend>,
    loader: SettingsLoader,
    state: Mutex<RunState>,
}

impl EvaluationHooks {
    pub fn new(backend: Arc<dyn TracingBackend>, loader: SettingsLoader) -> Self {
        Self {
            backend,
            loader,
            state: Mutex::new(RunState::Idle),
        }
    }

    pub fn loader(&self) -> &SettingsLoader {
        &self.loader
    }

    /// Whether a tracing session is currently open.
    pub fn is_active(&self) -> bool {
        matches!(*self.state(), RunState::Active(_))
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn precondition(&self, event: &'static str, missing: &'static str) -> HookError {
        error!(
            hook = HOOK_NAME,
            event, missing, "Lifecycle event delivered out of order"
        );
        HookError::Precondition {
            hook: HOOK_NAME,
            event,
            missing,
        }
    }

    /// The open evaluation for `event`, or why there is none.
    fn open_evaluation(&self, event: &'static str) -> Result<Lookup<EvaluationId>> {
        match &*self.state() {
            RunState::Inert => Ok(Lookup::Skip),
            RunState::Idle => Err(self.precondition(event, "run")),
            RunState::Active(run) => match &run.evaluation {
                Some(evaluation) if !evaluation.finalized => {
                    Ok(Lookup::Found(evaluation.id.clone()))
                }
                _ => Err(self.precondition(event, "evaluation")),
            },
        }
    }

    fn evaluation_spec(event: &TaskStart) -> EvaluationSpec {
        let mut metadata: BTreeMap<String, String> = event
            .spec
            .metadata
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), stringify(v)))
            .collect();
        metadata.insert(RUN_ID_KEY.to_string(), event.run_id.clone());
        metadata.insert(TASK_ID_KEY.to_string(), event.spec.task_id.clone());
        metadata.insert(EVAL_ID_KEY.to_string(), event.eval_id.clone());

        EvaluationSpec {
            name: event.spec.task.clone(),
            dataset: event
                .spec
                .dataset
                .name
                .clone()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_DATASET.to_string()),
            model: format_model_name(&event.spec.model),
            metadata,
        }
    }

    /// Run every telemetry extractor; failures are logged and dropped.
    async fn record_telemetry(
        &self,
        prediction: &PredictionId,
        sample_id: &str,
        sample: &EvalSample,
    ) {
        for extractor in SAMPLE_TELEMETRY {
            let entry = match (extractor.extract)(sample) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(err) => {
                    error!(
                        extractor = extractor.name,
                        sample_id,
                        error = %err,
                        "Failed to extract sample telemetry"
                    );
                    continue;
                }
            };
            let logged = match entry {
                TelemetryEntry::Score { scorer, value } => {
                    let attributes = serde_json::Map::new();
                    self.backend
                        .log_score(prediction, scorer, &ScoreShape::Scalar(value), &attributes)
                        .await
                }
                TelemetryEntry::Attribute { name, value } => {
                    let mut attributes = serde_json::Map::new();
                    attributes.insert(name.to_string(), Value::String(value));
                    self.backend
                        .set_prediction_attributes(prediction, &attributes)
                        .await
                }
            };
            if let Err(err) = logged {
                error!(
                    extractor = extractor.name,
                    sample_id,
                    error = %err,
                    "Failed to log sample telemetry"
                );
            }
        }
    }

    /// Log every score of the sample. All scores are attempted; the first
    /// failure is returned.
    async fn log_scores(&self, prediction: &PredictionId, sample: &EvalSample) -> Result<()> {
        let mut first_error = None;
        for (scorer, score) in sample.scores.iter().flatten() {
            let mut attributes = score.metadata.clone().unwrap_or_default();
            if let Some(explanation) = &score.explanation {
                attributes.insert("explanation".to_string(), Value::String(explanation.clone()));
            }
            let logged = match format_score(&score.value) {
                Ok(shape) => self
                    .backend
                    .log_score(prediction, scorer, &shape, &attributes)
                    .await
                    .map_err(HookError::from),
                Err(err) => Err(err.into()),
            };
            if let Err(err) = logged {
                warn!(scorer = %scorer, error = %err, "Failed to log score");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Close the task span, if any, then the evaluation.
    async fn close_evaluation(
        &self,
        evaluation: &EvaluationId,
        task_call: Option<CallId>,
        close: EvaluationClose,
    ) -> Result<()> {
        if let Some(call) = task_call
            && let Err(err) = self.backend.close_call(&call).await
        {
            warn!(call = %call, error = %err, "Failed to close task span");
        }
        self.backend.close_evaluation(evaluation, close).await?;
        Ok(())
    }
}

/// `scorer -> metric -> value`, numeric metrics only. Scorers that report
/// no metrics at all are left out.
pub fn summarize(log: &EvalLog) -> EvaluationSummary {
    let mut summary = EvaluationSummary::new();
    let Some(results) = &log.results else {
        return summary;
    };
    for score in &results.scores {
        if score.metrics.is_empty() {
            continue;
        }
        let metrics = score
            .metrics
            .iter()
            .filter_map(|(name, metric)| match &metric.value {
                Value::Number(n) => n.as_f64().map(|v| (name.clone(), v)),
                _ => None,
            })
            .collect();
        summary.insert(score.name.clone(), metrics);
    }
    summary
}

/// How a still-open evaluation is closed when the run ends.
pub fn run_end_close(event: &RunEnd) -> EvaluationClose {
    if let Some(exception) = &event.exception {
        return EvaluationClose::Failure(EvaluationFailure {
            message: exception.kind.clone(),
            detail: exception.message.clone(),
        });
    }
    let errors = event.task_errors();
    if errors.is_empty() {
        EvaluationClose::Success
    } else {
        EvaluationClose::Failure(EvaluationFailure {
            message: RUN_FAILED_MESSAGE.to_string(),
            detail: errors.join("\n"),
        })
    }
}

#[async_trait]
impl EvalHooks for EvaluationHooks {
    fn name(&self) -> &str {
        HOOK_NAME
    }

    fn enabled(&self) -> bool {
        match self.loader.load() {
            Ok(_) => true,
            Err(err) => {
                debug!(error = %err, "Evaluation tracing disabled");
                false
            }
        }
    }

    async fn on_run_start(&self, event: &RunStart) -> Result<()> {
        {
            let mut state = self.state();
            if let RunState::Active(run) = &*state {
                warn!(
                    previous_run = %run.run_id,
                    run_id = %event.run_id,
                    "Run started while another run was still open"
                );
            }
            *state = RunState::Inert;
        }

        let settings = match self.loader.load() {
            Ok(settings) => settings.tracing,
            Err(err) if err.is_missing_identity() => {
                info!(
                    run_id = %event.run_id,
                    error = %err,
                    "No project identity; evaluation tracing off for this run"
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if !settings.enabled {
            info!(run_id = %event.run_id, "Evaluation tracing disabled by settings");
            return Ok(());
        }

        let identity = settings.identity();
        let session = self
            .backend
            .open_session(&identity, &SessionOptions::default())
            .await?;
        info!(
            run_id = %event.run_id,
            project = %identity,
            session = %session,
            "Opened tracing session"
        );

        *self.state() = RunState::Active(ActiveRun {
            run_id: event.run_id.clone(),
            session,
            autopatch: settings.autopatch,
            evaluation: None,
        });
        Ok(())
    }

    async fn on_task_start(&self, event: &TaskStart) -> Result<()> {
        let (session, autopatch) = match &*self.state() {
            RunState::Inert => return Ok(()),
            RunState::Idle => return Err(self.precondition("task_start", "run")),
            RunState::Active(run) => {
                if let Some(previous) = run.evaluation.as_ref().filter(|e| !e.finalized) {
                    warn!(
                        task = %previous.task,
                        evaluation = %previous.id,
                        "Task started before the previous task ended"
                    );
                }
                (run.session.clone(), run.autopatch)
            }
        };

        let spec = Self::evaluation_spec(event);
        let evaluation = self.backend.open_evaluation(&session, &spec).await?;
        debug!(
            task = %spec.name,
            evaluation = %evaluation,
            model = %spec.model,
            "Opened evaluation"
        );

        if let RunState::Active(run) = &mut *self.state() {
            run.evaluation = Some(ActiveEvaluation {
                id: evaluation.clone(),
                task: spec.name.clone(),
                task_call: None,
                finalized: false,
            });
        }

        self.backend.enter_call_context(&evaluation).await?;

        if autopatch {
            let call = self.backend.open_call(&evaluation, TASK_OP_NAME).await?;
            if let RunState::Active(run) = &mut *self.state()
                && let Some(active) = run.evaluation.as_mut()
                && active.id == evaluation
            {
                active.task_call = Some(call);
            }
        }
        Ok(())
    }

    async fn on_sample_end(&self, event: &SampleEnd) -> Result<()> {
        let evaluation = match self.open_evaluation("sample_end")? {
            Lookup::Skip => return Ok(()),
            Lookup::Found(evaluation) => evaluation,
        };

        let sample = &event.sample;
        let prediction = self
            .backend
            .open_prediction(
                &evaluation,
                json!({ "input": sample.input }),
                Value::String(sample.output.completion.clone()),
            )
            .await?;

        self.record_telemetry(&prediction, &event.sample_id, sample)
            .await;
        let scored = self.log_scores(&prediction, sample).await;
        let closed = self.backend.close_prediction(&prediction).await;

        scored?;
        closed?;
        Ok(())
    }

    async fn on_task_end(&self, event: &TaskEnd) -> Result<()> {
        let (evaluation, task_call) = {
            let mut state = self.state();
            match &mut *state {
                RunState::Inert => return Ok(()),
                RunState::Idle => return Err(self.precondition("task_end", "run")),
                RunState::Active(run) => match run.evaluation.as_mut() {
                    Some(active) if !active.finalized => {
                        (active.id.clone(), active.task_call.take())
                    }
                    _ => return Err(self.precondition("task_end", "evaluation")),
                },
            }
        };

        let summary = summarize(&event.log);
        self.close_evaluation(&evaluation, task_call, EvaluationClose::Summary(summary))
            .await?;

        if let RunState::Active(run) = &mut *self.state()
            && let Some(active) = run.evaluation.as_mut()
            && active.id == evaluation
        {
            active.finalized = true;
        }
        debug!(evaluation = %evaluation, "Closed evaluation");
        Ok(())
    }

    async fn on_run_end(&self, event: &RunEnd) -> Result<()> {
        let run = match std::mem::take(&mut *self.state()) {
            RunState::Active(run) => run,
            RunState::Inert | RunState::Idle => return Ok(()),
        };

        let mut first_error = None;
        if let Some(active) = run.evaluation.filter(|e| !e.finalized) {
            let close = run_end_close(event);
            info!(
                evaluation = %active.id,
                task = %active.task,
                "Closing evaluation left open at run end"
            );
            if let Err(err) = self
                .close_evaluation(&active.id, active.task_call, close)
                .await
            {
                error!(evaluation = %active.id, error = %err, "Failed to close evaluation");
                first_error = Some(err);
            }
        }

        if let Err(err) = self.backend.close_session(&run.session).await {
            error!(session = %run.session, error = %err, "Failed to close tracing session");
            first_error.get_or_insert(err.into());
        }
        info!(run_id = %run.run_id, "Closed tracing session");

        first_error.map_or(Ok(()), Err)
    }
}
