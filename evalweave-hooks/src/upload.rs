//! Lifecycle hooks that mirror a run into the run tracker.
//!
//! A tracked run is opened per host run, receives per-task metrics as flat
//! keys, and on run end gets the configured files and an exit status.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use evalweave_core::SettingsLoader;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::backend::{RunExit, RunTracker, TrackedRunId, TrackedRunSpec};
use crate::error::{HookError, Result};
use crate::events::{EvalLog, RunEnd, RunStart, TaskEnd};
use crate::hooks::EvalHooks;

pub const HOOK_NAME: &str = "wandb_models_hooks";
pub const HOOK_DESCRIPTION: &str =
    "Integration hooks for recording run metadata and metrics to W&B Models";

#[derive(Debug, Default)]
enum UploadState {
    #[default]
    Idle,
    Inert,
    Active(ActiveUpload),
}

#[derive(Debug)]
struct ActiveUpload {
    run_id: String,
    tracked: TrackedRunId,
    files: Vec<String>,
    tracking_dir: PathBuf,
}

/// Records run config, per-task metrics and files on a [`RunTracker`].
pub struct RunUploadHooks {
    tracker: Arc<dyn RunTracker>,
    loader: SettingsLoader,
    state: Mutex<UploadState>,
}

impl RunUploadHooks {
    pub fn new(tracker: Arc<dyn RunTracker>, loader: SettingsLoader) -> Self {
        Self {
            tracker,
            loader,
            state: Mutex::new(UploadState::Idle),
        }
    }

    fn state(&self) -> MutexGuard<'_, UploadState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Flatten a task's numeric metrics into `<task>/<scorer>/<metric>` keys.
pub fn task_metrics(log: &EvalLog) -> BTreeMap<String, f64> {
    let Some(results) = &log.results else {
        return BTreeMap::new();
    };
    results
        .scores
        .iter()
        .flat_map(|score| {
            score.metrics.iter().filter_map(move |(metric, value)| match &value.value {
                Value::Number(n) => n
                    .as_f64()
                    .map(|v| (format!("{}/{}/{}", log.task, score.name, metric), v)),
                _ => None,
            })
        })
        .collect()
}

#[async_trait]
impl EvalHooks for RunUploadHooks {
    fn name(&self) -> &str {
        HOOK_NAME
    }

    fn enabled(&self) -> bool {
        match self.loader.load() {
            Ok(settings) => settings.run_upload.enabled,
            Err(err) => {
                debug!(error = %err, "Run upload disabled");
                false
            }
        }
    }

    async fn on_run_start(&self, event: &RunStart) -> Result<()> {
        *self.state() = UploadState::Inert;

        let settings = match self.loader.load() {
            Ok(settings) => settings.run_upload,
            Err(err) if err.is_missing_identity() => {
                info!(
                    run_id = %event.run_id,
                    error = %err,
                    "No project identity; run upload off for this run"
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if !settings.enabled {
            info!(run_id = %event.run_id, "Run upload disabled by settings");
            return Ok(());
        }

        let spec = TrackedRunSpec {
            entity: settings.entity,
            project: settings.project,
            name: event.run_id.clone(),
            config: settings.config.unwrap_or_default(),
        };
        let tracked = self.tracker.init_run(&spec).await?;
        info!(
            run_id = %event.run_id,
            tracked = %tracked,
            project = %spec.project,
            "Opened tracked run"
        );

        *self.state() = UploadState::Active(ActiveUpload {
            run_id: event.run_id.clone(),
            tracked,
            files: settings.files.unwrap_or_default(),
            tracking_dir: self.loader.tracking_dir(),
        });
        Ok(())
    }

    async fn on_task_end(&self, event: &TaskEnd) -> Result<()> {
        let tracked = match &*self.state() {
            UploadState::Inert => return Ok(()),
            UploadState::Idle => {
                error!(
                    hook = HOOK_NAME,
                    event = "task_end",
                    "Lifecycle event delivered out of order"
                );
                return Err(HookError::Precondition {
                    hook: HOOK_NAME,
                    event: "task_end",
                    missing: "run",
                });
            }
            UploadState::Active(active) => active.tracked.clone(),
        };

        let metrics = task_metrics(&event.log);
        if metrics.is_empty() {
            debug!(task = %event.log.task, "No numeric metrics to log");
            return Ok(());
        }
        self.tracker.log_metrics(&tracked, &metrics).await?;
        Ok(())
    }

    async fn on_run_end(&self, event: &RunEnd) -> Result<()> {
        let active = match std::mem::take(&mut *self.state()) {
            UploadState::Active(active) => active,
            UploadState::Inert | UploadState::Idle => return Ok(()),
        };

        for file in &active.files {
            let path = active.tracking_dir.join(file);
            if let Err(err) = self.tracker.upload_file(&active.tracked, &path).await {
                warn!(path = %path.display(), error = %err, "Failed to upload file");
            }
        }

        let exit = if event.exception.is_some() || !event.task_errors().is_empty() {
            RunExit::Failed
        } else {
            RunExit::Success
        };
        self.tracker.finish_run(&active.tracked, exit).await?;
        info!(run_id = %active.run_id, tracked = %active.tracked, ?exit, "Finished tracked run");
        Ok(())
    }
}
