//! End-to-end lifecycle tests for the evaluation tracing hooks, driven
//! against the in-memory recording backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use evalweave_core::{Environment, SettingsLoader};
use evalweave_hooks::backend::{EvaluationClose, EvaluationFailure};
use evalweave_hooks::evaluation::{RUN_FAILED_MESSAGE, TASK_OP_NAME};
use evalweave_hooks::events::{
    EvalLog, EvalMetric, EvalResults, EvalSample, EvalScore, EvalSpec, EvalStatus, ModelOutput,
    ModelUsage, RunEnd, RunException, RunStart, SampleEnd, Score, TaskEnd, TaskStart,
};
use evalweave_hooks::recording::BackendCall;
use evalweave_hooks::{EvalHooks, EvaluationHooks, HookError, RecordingBackend, ScoreShape};

struct Harness {
    _dir: tempfile::TempDir,
    backend: Arc<RecordingBackend>,
    hooks: EvaluationHooks,
}

fn identity_env() -> Environment {
    Environment::empty()
        .with("WANDB_ENTITY", "acme")
        .with("WANDB_PROJECT", "evals")
}

fn harness_with(env: Environment, backend: RecordingBackend) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(backend);
    let loader = SettingsLoader::new(dir.path(), env);
    let hooks = EvaluationHooks::new(backend.clone(), loader);
    Harness {
        _dir: dir,
        backend,
        hooks,
    }
}

fn harness() -> Harness {
    harness_with(identity_env(), RecordingBackend::new())
}

fn run_start() -> RunStart {
    RunStart {
        run_id: "run-1".into(),
        task_names: vec!["hello_world".into()],
    }
}

fn task_start() -> TaskStart {
    TaskStart {
        run_id: "run-1".into(),
        eval_id: "eval-1".into(),
        spec: EvalSpec {
            task: "hello_world".into(),
            task_id: "task-1".into(),
            model: "mockllm/model".into(),
            ..Default::default()
        },
    }
}

fn sample_end(sample_id: &str, scores: &[(&str, Value)]) -> SampleEnd {
    SampleEnd {
        run_id: "run-1".into(),
        eval_id: "eval-1".into(),
        sample_id: sample_id.into(),
        sample: EvalSample {
            id: json!(sample_id),
            input: json!("Just reply with Hello World"),
            target: json!("Hello World"),
            output: ModelOutput {
                model: "mockllm/model".into(),
                completion: "Hello World".into(),
            },
            scores: Some(
                scores
                    .iter()
                    .map(|(name, value)| (name.to_string(), Score::new(value.clone())))
                    .collect(),
            ),
            ..Default::default()
        },
    }
}

fn task_end(metrics: &[(&str, &str, f64)]) -> TaskEnd {
    let mut scores: BTreeMap<&str, EvalScore> = BTreeMap::new();
    for &(scorer, metric, value) in metrics {
        scores
            .entry(scorer)
            .or_insert_with(|| EvalScore {
                name: scorer.to_string(),
                scorer: scorer.to_string(),
                ..Default::default()
            })
            .metrics
            .insert(metric.to_string(), EvalMetric::new(metric, value));
    }
    TaskEnd {
        run_id: "run-1".into(),
        eval_id: "eval-1".into(),
        log: EvalLog {
            task: "hello_world".into(),
            status: EvalStatus::Success,
            results: Some(EvalResults {
                total_samples: 1,
                completed_samples: 1,
                scores: scores.into_values().collect(),
            }),
            error: None,
        },
    }
}

fn run_end() -> RunEnd {
    RunEnd {
        run_id: "run-1".into(),
        ..Default::default()
    }
}

fn closes(calls: &[BackendCall]) -> Vec<EvaluationClose> {
    calls
        .iter()
        .filter_map(|call| match call {
            BackendCall::CloseEvaluation { close, .. } => Some(close.clone()),
            _ => None,
        })
        .collect()
}

fn scores(calls: &[BackendCall]) -> Vec<(String, ScoreShape)> {
    calls
        .iter()
        .filter_map(|call| match call {
            BackendCall::LogScore { scorer, score, .. } => Some((scorer.clone(), score.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_single_sample_run_end_to_end() {
    let h = harness();
    assert!(h.hooks.enabled());

    h.hooks.on_run_start(&run_start()).await.unwrap();
    h.hooks.on_task_start(&task_start()).await.unwrap();
    h.hooks
        .on_sample_end(&sample_end("1", &[("exact", json!(1.0))]))
        .await
        .unwrap();
    h.hooks
        .on_task_end(&task_end(&[("exact", "accuracy", 1.0)]))
        .await
        .unwrap();
    h.hooks.on_run_end(&run_end()).await.unwrap();

    let calls = h.backend.calls().await;
    assert_eq!(
        h.backend.operations().await,
        vec![
            "open_session",
            "open_evaluation",
            "enter_call_context",
            "open_prediction",
            "log_score",
            "close_prediction",
            "close_evaluation",
            "close_session",
        ]
    );
    assert_eq!(
        scores(&calls),
        vec![("exact".to_string(), ScoreShape::Scalar(json!(1.0)))]
    );
    assert_eq!(
        closes(&calls),
        vec![EvaluationClose::Summary(BTreeMap::from([(
            "exact".to_string(),
            BTreeMap::from([("accuracy".to_string(), 1.0)])
        )]))]
    );
    assert!(h.backend.open_handles().await.is_empty());
}

#[tokio::test]
async fn test_scores_are_logged_in_host_order() {
    let h = harness();
    h.hooks.on_run_start(&run_start()).await.unwrap();
    h.hooks.on_task_start(&task_start()).await.unwrap();

    let event: SampleEnd = serde_json::from_value(json!({
        "run_id": "run-1",
        "eval_id": "eval-1",
        "sample_id": "1",
        "sample": {
            "id": 1,
            "input": "Just reply with Hello World",
            "scores": {
                "word_match": {"value": true},
                "choice": {"value": "C"},
                "accuracy": {"value": 2}
            }
        }
    }))
    .unwrap();
    h.hooks.on_sample_end(&event).await.unwrap();

    let mut choice = serde_json::Map::new();
    choice.insert("score".into(), json!("C"));
    assert_eq!(
        scores(&h.backend.calls().await),
        vec![
            ("word_match".to_string(), ScoreShape::Scalar(json!(1.0))),
            ("choice".to_string(), ScoreShape::Mapping(choice)),
            ("accuracy".to_string(), ScoreShape::Scalar(json!(2.0))),
        ]
    );
}

#[tokio::test]
async fn test_session_and_evaluation_arguments() {
    let h = harness();
    h.hooks.on_run_start(&run_start()).await.unwrap();
    h.hooks.on_task_start(&task_start()).await.unwrap();

    let calls = h.backend.calls().await;
    match &calls[0] {
        BackendCall::OpenSession {
            identity, options, ..
        } => {
            assert_eq!(identity.to_string(), "acme/evals");
            assert!(!options.print_call_link);
        }
        other => panic!("unexpected first call: {other:?}"),
    }
    match &calls[1] {
        BackendCall::OpenEvaluation { spec, .. } => {
            assert_eq!(spec.name, "hello_world");
            assert_eq!(spec.dataset, "test_dataset");
            assert_eq!(spec.model, "mockllm__model");
            assert_eq!(spec.metadata["inspect_run_id"], "run-1");
            assert_eq!(spec.metadata["inspect_task_id"], "task-1");
            assert_eq!(spec.metadata["inspect_eval_id"], "eval-1");
        }
        other => panic!("unexpected second call: {other:?}"),
    }
}

#[tokio::test]
async fn test_prediction_inputs_and_score_attributes() {
    let h = harness();
    h.hooks.on_run_start(&run_start()).await.unwrap();
    h.hooks.on_task_start(&task_start()).await.unwrap();

    let mut event = sample_end("1", &[]);
    let mut metadata = serde_json::Map::new();
    metadata.insert("grader".into(), json!("strict"));
    event.sample.scores = Some(IndexMap::from([(
        "match".to_string(),
        Score {
            value: json!("C"),
            answer: Some("Hello World".into()),
            explanation: Some("exact match".into()),
            metadata: Some(metadata),
        },
    )]));
    h.hooks.on_sample_end(&event).await.unwrap();

    let calls = h.backend.calls().await;
    let prediction = calls
        .iter()
        .find_map(|call| match call {
            BackendCall::OpenPrediction { inputs, output, .. } => Some((inputs, output)),
            _ => None,
        })
        .unwrap();
    assert_eq!(prediction.0, &json!({"input": "Just reply with Hello World"}));
    assert_eq!(prediction.1, &json!("Hello World"));

    let logged = calls
        .iter()
        .find_map(|call| match call {
            BackendCall::LogScore {
                scorer,
                score,
                attributes,
                ..
            } => Some((scorer, score, attributes)),
            _ => None,
        })
        .unwrap();
    assert_eq!(logged.0, "match");
    assert_eq!(logged.1.clone().into_value(), json!({"score": "C"}));
    assert_eq!(logged.2["grader"], "strict");
    assert_eq!(logged.2["explanation"], "exact match");
}

#[tokio::test]
async fn test_exception_mid_task_closes_evaluation_then_session() {
    let h = harness();
    h.hooks.on_run_start(&run_start()).await.unwrap();
    h.hooks.on_task_start(&task_start()).await.unwrap();
    h.hooks
        .on_sample_end(&sample_end("1", &[("exact", json!(1.0))]))
        .await
        .unwrap();

    let event = RunEnd {
        run_id: "run-1".into(),
        logs: vec![],
        exception: Some(RunException {
            kind: "RuntimeError".into(),
            message: "model provider went away".into(),
        }),
    };
    h.hooks.on_run_end(&event).await.unwrap();

    let calls = h.backend.calls().await;
    assert_eq!(
        closes(&calls),
        vec![EvaluationClose::Failure(EvaluationFailure {
            message: "RuntimeError".into(),
            detail: "model provider went away".into(),
        })]
    );
    let ops = h.backend.operations().await;
    assert_eq!(&ops[ops.len() - 2..], &["close_evaluation", "close_session"]);
    assert!(h.backend.open_handles().await.is_empty());
}

#[tokio::test]
async fn test_task_errors_become_synthesized_failure() {
    let h = harness();
    h.hooks.on_run_start(&run_start()).await.unwrap();
    h.hooks.on_task_start(&task_start()).await.unwrap();

    let event = RunEnd {
        run_id: "run-1".into(),
        logs: vec![
            EvalLog {
                error: Some(evalweave_hooks::events::EvalError {
                    message: "sample limit exceeded".into(),
                    traceback: String::new(),
                }),
                ..Default::default()
            },
            EvalLog {
                error: Some(evalweave_hooks::events::EvalError {
                    message: "sandbox crashed".into(),
                    traceback: String::new(),
                }),
                ..Default::default()
            },
        ],
        exception: None,
    };
    h.hooks.on_run_end(&event).await.unwrap();

    assert_eq!(
        closes(&h.backend.calls().await),
        vec![EvaluationClose::Failure(EvaluationFailure {
            message: RUN_FAILED_MESSAGE.into(),
            detail: "sample limit exceeded\nsandbox crashed".into(),
        })]
    );
}

#[tokio::test]
async fn test_finalized_evaluation_is_not_closed_twice() {
    let h = harness();
    h.hooks.on_run_start(&run_start()).await.unwrap();
    h.hooks.on_task_start(&task_start()).await.unwrap();
    h.hooks.on_task_end(&task_end(&[])).await.unwrap();
    h.hooks.on_run_end(&run_end()).await.unwrap();

    assert_eq!(h.backend.count("close_evaluation").await, 1);
    assert_eq!(h.backend.count("close_session").await, 1);
}

#[tokio::test]
async fn test_open_evaluation_closed_with_success_at_run_end() {
    let h = harness();
    h.hooks.on_run_start(&run_start()).await.unwrap();
    h.hooks.on_task_start(&task_start()).await.unwrap();
    h.hooks.on_run_end(&run_end()).await.unwrap();

    assert_eq!(
        closes(&h.backend.calls().await),
        vec![EvaluationClose::Success]
    );
}

#[tokio::test]
async fn test_sample_end_without_task_start_is_a_precondition_violation() {
    let h = harness();
    h.hooks.on_run_start(&run_start()).await.unwrap();

    let err = h
        .hooks
        .on_sample_end(&sample_end("1", &[("exact", json!(1.0))]))
        .await
        .unwrap_err();
    assert!(err.is_precondition());
    assert!(matches!(
        err,
        HookError::Precondition {
            event: "sample_end",
            missing: "evaluation",
            ..
        }
    ));
    assert_eq!(h.backend.count("open_prediction").await, 0);
}

#[tokio::test]
async fn test_task_end_without_task_start_is_a_precondition_violation() {
    let h = harness();
    h.hooks.on_run_start(&run_start()).await.unwrap();
    let err = h.hooks.on_task_end(&task_end(&[])).await.unwrap_err();
    assert!(err.is_precondition());
}

#[tokio::test]
async fn test_events_before_run_start_are_precondition_violations() {
    let h = harness();
    let err = h.hooks.on_task_start(&task_start()).await.unwrap_err();
    assert!(matches!(err, HookError::Precondition { missing: "run", .. }));
    assert!(h.backend.calls().await.is_empty());
}

#[tokio::test]
async fn test_task_end_after_finalize_is_a_precondition_violation() {
    let h = harness();
    h.hooks.on_run_start(&run_start()).await.unwrap();
    h.hooks.on_task_start(&task_start()).await.unwrap();
    h.hooks.on_task_end(&task_end(&[])).await.unwrap();
    let err = h.hooks.on_task_end(&task_end(&[])).await.unwrap_err();
    assert!(err.is_precondition());
}

#[tokio::test]
async fn test_missing_identity_disables_hooks() {
    let h = harness_with(Environment::empty(), RecordingBackend::new());
    assert!(!h.hooks.enabled());

    h.hooks.on_run_start(&run_start()).await.unwrap();
    h.hooks.on_task_start(&task_start()).await.unwrap();
    h.hooks
        .on_sample_end(&sample_end("1", &[("exact", json!(1.0))]))
        .await
        .unwrap();
    h.hooks.on_task_end(&task_end(&[])).await.unwrap();
    h.hooks.on_run_end(&run_end()).await.unwrap();

    assert!(h.backend.calls().await.is_empty());
    assert!(!h.hooks.is_active());
}

#[tokio::test]
async fn test_disabled_flag_makes_run_inert() {
    let env = identity_env().with("EVALWEAVE_TRACING_ENABLED", "false");
    let h = harness_with(env, RecordingBackend::new());

    h.hooks.on_run_start(&run_start()).await.unwrap();
    h.hooks.on_task_start(&task_start()).await.unwrap();
    h.hooks.on_run_end(&run_end()).await.unwrap();

    assert!(h.backend.calls().await.is_empty());
}

#[tokio::test]
async fn test_invalid_setting_fails_run_start() {
    let env = identity_env().with("EVALWEAVE_TRACING_ENABLED", "sometimes");
    let h = harness_with(env, RecordingBackend::new());

    assert!(!h.hooks.enabled());
    let err = h.hooks.on_run_start(&run_start()).await.unwrap_err();
    assert!(matches!(err, HookError::Config(_)));
    // Later events are no-ops rather than precondition errors.
    h.hooks.on_task_start(&task_start()).await.unwrap();
    assert!(h.backend.calls().await.is_empty());
}

#[tokio::test]
async fn test_autopatch_wraps_task_in_call_span() {
    let env = identity_env().with("EVALWEAVE_TRACING_AUTOPATCH", "true");
    let h = harness_with(env, RecordingBackend::new());

    h.hooks.on_run_start(&run_start()).await.unwrap();
    h.hooks.on_task_start(&task_start()).await.unwrap();
    h.hooks
        .on_task_end(&task_end(&[("exact", "accuracy", 1.0)]))
        .await
        .unwrap();
    h.hooks.on_run_end(&run_end()).await.unwrap();

    let calls = h.backend.calls().await;
    assert!(calls.iter().any(|call| matches!(
        call,
        BackendCall::OpenCall { op_name, .. } if op_name == TASK_OP_NAME
    )));
    assert_eq!(
        h.backend.operations().await,
        vec![
            "open_session",
            "open_evaluation",
            "enter_call_context",
            "open_call",
            "close_call",
            "close_evaluation",
            "close_session",
        ]
    );
    assert!(h.backend.open_handles().await.is_empty());
}

#[tokio::test]
async fn test_autopatch_span_closed_by_run_end_safety_net() {
    let env = identity_env().with("EVALWEAVE_TRACING_AUTOPATCH", "1");
    let h = harness_with(env, RecordingBackend::new());

    h.hooks.on_run_start(&run_start()).await.unwrap();
    h.hooks.on_task_start(&task_start()).await.unwrap();
    h.hooks.on_run_end(&run_end()).await.unwrap();

    let ops = h.backend.operations().await;
    assert_eq!(
        &ops[ops.len() - 3..],
        &["close_call", "close_evaluation", "close_session"]
    );
    assert!(h.backend.open_handles().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_samples_do_not_interfere() {
    let h = harness();
    h.hooks.on_run_start(&run_start()).await.unwrap();
    h.hooks.on_task_start(&task_start()).await.unwrap();

    let events: Vec<SampleEnd> = (0..8)
        .map(|i| sample_end(&i.to_string(), &[("exact", json!(i % 2))]))
        .collect();
    let results =
        futures::future::join_all(events.iter().map(|event| h.hooks.on_sample_end(event))).await;
    assert!(results.iter().all(Result::is_ok));

    let calls = h.backend.calls().await;
    assert_eq!(h.backend.count("open_prediction").await, 8);
    assert_eq!(h.backend.count("close_prediction").await, 8);

    // Every score landed on a prediction that was open at the time.
    let mut open = std::collections::HashSet::new();
    for call in &calls {
        match call {
            BackendCall::OpenPrediction { prediction, .. } => {
                open.insert(prediction.clone());
            }
            BackendCall::LogScore { prediction, .. } => assert!(open.contains(prediction)),
            BackendCall::ClosePrediction { prediction } => {
                assert!(open.remove(prediction));
            }
            _ => {}
        }
    }
    assert!(open.is_empty());
}

#[tokio::test]
async fn test_best_effort_telemetry_failure_does_not_block_scores() {
    let h = harness_with(
        identity_env(),
        RecordingBackend::failing(&["set_prediction_attributes"]),
    );
    h.hooks.on_run_start(&run_start()).await.unwrap();
    h.hooks.on_task_start(&task_start()).await.unwrap();

    let mut event = sample_end("1", &[("exact", json!(1))]);
    event.sample.total_time = Some(2.5);
    event.sample.model_usage.insert(
        "mockllm/model".into(),
        ModelUsage {
            total_tokens: Some(42),
            ..Default::default()
        },
    );
    event.sample.metadata = json!({
        "Annotator Metadata": {"Number of tools": "not a number", "Tools": ["search"]}
    })
    .as_object()
    .cloned()
    .unwrap();

    h.hooks.on_sample_end(&event).await.unwrap();

    assert_eq!(
        scores(&h.backend.calls().await),
        vec![
            ("total_time".to_string(), ScoreShape::Scalar(json!(2.5))),
            ("total_tokens".to_string(), ScoreShape::Scalar(json!(42))),
            ("exact".to_string(), ScoreShape::Scalar(json!(1.0))),
        ]
    );
    assert_eq!(h.backend.refused().await, vec!["set_prediction_attributes"]);
    assert_eq!(h.backend.count("close_prediction").await, 1);
}

#[tokio::test]
async fn test_unformattable_score_still_closes_prediction() {
    let h = harness();
    h.hooks.on_run_start(&run_start()).await.unwrap();
    h.hooks.on_task_start(&task_start()).await.unwrap();

    let event = sample_end("1", &[("bad", json!([1, 2])), ("good", json!("C"))]);
    let err = h.hooks.on_sample_end(&event).await.unwrap_err();
    assert!(matches!(err, HookError::Format(_)));

    let calls = h.backend.calls().await;
    assert_eq!(scores(&calls).len(), 1);
    assert_eq!(h.backend.count("close_prediction").await, 1);
}

#[tokio::test]
async fn test_session_closed_even_when_evaluation_close_fails() {
    let h = harness_with(identity_env(), RecordingBackend::failing(&["close_evaluation"]));
    h.hooks.on_run_start(&run_start()).await.unwrap();
    h.hooks.on_task_start(&task_start()).await.unwrap();

    let err = h.hooks.on_run_end(&run_end()).await.unwrap_err();
    assert!(matches!(err, HookError::Backend(_)));
    assert_eq!(h.backend.count("close_session").await, 1);
    assert!(!h.hooks.is_active());
}
