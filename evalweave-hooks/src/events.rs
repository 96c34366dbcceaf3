//! Event payloads delivered by the evaluation host.
//!
//! These mirror what the host framework knows at each point of a run. Fields
//! that are open-ended on the host side (sample metadata, score values) are
//! kept as JSON values.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A run is about to start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStart {
    pub run_id: String,
    #[serde(default)]
    pub task_names: Vec<String>,
}

/// A task within the run is about to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStart {
    pub run_id: String,
    pub eval_id: String,
    pub spec: EvalSpec,
}

/// Static description of one task evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalSpec {
    /// Task name, e.g. `hello_world`.
    pub task: String,
    pub task_id: String,
    #[serde(default)]
    pub dataset: EvalDataset,
    /// Model name as given to the host, e.g. `openai/gpt-4o`.
    pub model: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalDataset {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub samples: Option<usize>,
}

/// One sample finished, with its scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleEnd {
    pub run_id: String,
    pub eval_id: String,
    pub sample_id: String,
    pub sample: EvalSample,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalSample {
    pub id: Value,
    #[serde(default)]
    pub epoch: u32,
    /// The sample input: a string or a list of chat messages.
    pub input: Value,
    #[serde(default)]
    pub target: Value,
    #[serde(default)]
    pub output: ModelOutput,
    /// Scores keyed by scorer, in the order the host produced them.
    #[serde(default)]
    pub scores: Option<IndexMap<String, Score>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    /// Token usage keyed by model name, in host order.
    #[serde(default)]
    pub model_usage: IndexMap<String, ModelUsage>,
    /// Wall-clock seconds spent on the sample.
    #[serde(default)]
    pub total_time: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelOutput {
    #[serde(default)]
    pub model: String,
    /// Text of the first completion choice.
    #[serde(default)]
    pub completion: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

/// A scorer's verdict on one sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Score {
    /// String, number, boolean, list or mapping.
    pub value: Value,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, Value>>,
}

impl Score {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }
}

/// A task finished; `log` carries its aggregated results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnd {
    pub run_id: String,
    pub eval_id: String,
    pub log: EvalLog,
}

/// Outcome of one task evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalLog {
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub status: EvalStatus,
    #[serde(default)]
    pub results: Option<EvalResults>,
    #[serde(default)]
    pub error: Option<EvalError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    #[default]
    Started,
    Success,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalResults {
    #[serde(default)]
    pub total_samples: usize,
    #[serde(default)]
    pub completed_samples: usize,
    #[serde(default)]
    pub scores: Vec<EvalScore>,
}

/// Aggregated metrics for one scorer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalScore {
    pub name: String,
    #[serde(default)]
    pub scorer: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, EvalMetric>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalMetric {
    pub name: String,
    pub value: Value,
}

impl EvalMetric {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalError {
    pub message: String,
    #[serde(default)]
    pub traceback: String,
}

/// The run finished, successfully or not.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunEnd {
    pub run_id: String,
    #[serde(default)]
    pub logs: Vec<EvalLog>,
    /// Set when the run itself raised.
    #[serde(default)]
    pub exception: Option<RunException>,
}

impl RunEnd {
    /// Messages of every task that ended in error.
    pub fn task_errors(&self) -> Vec<&str> {
        self.logs
            .iter()
            .filter_map(|log| log.error.as_ref())
            .map(|error| error.message.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunException {
    pub kind: String,
    pub message: String,
}

impl std::fmt::Display for RunException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Any host event, for dispatch through a [`HookRegistry`](crate::hooks::HookRegistry).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HookEvent {
    RunStart(RunStart),
    TaskStart(TaskStart),
    SampleEnd(Box<SampleEnd>),
    TaskEnd(TaskEnd),
    RunEnd(RunEnd),
}

impl HookEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            HookEvent::RunStart(_) => "run_start",
            HookEvent::TaskStart(_) => "task_start",
            HookEvent::SampleEnd(_) => "sample_end",
            HookEvent::TaskEnd(_) => "task_end",
            HookEvent::RunEnd(_) => "run_end",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            HookEvent::RunStart(e) => &e.run_id,
            HookEvent::TaskStart(e) => &e.run_id,
            HookEvent::SampleEnd(e) => &e.run_id,
            HookEvent::TaskEnd(e) => &e.run_id,
            HookEvent::RunEnd(e) => &e.run_id,
        }
    }
}
