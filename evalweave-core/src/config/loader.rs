//! Construction of the composite settings object.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::cascade::{Resolved, resolve_explained};
use super::{
    CompositeSettings, IdentityFileSource, InitOverrides, Manifest, RunUploadSettings,
    SettingsGroup, SettingsSources, TracingSettings, tracking_dir,
};
use crate::environment::Environment;
use crate::error::{ConfigError, Result};

/// Loads [`CompositeSettings`] from the environment and file system.
///
/// A loader is a pure description of its inputs; each call to
/// [`load`](Self::load) re-reads the files, with one identity-file reader
/// shared by both groups so they see the same identity.
#[derive(Debug, Clone)]
pub struct SettingsLoader {
    workdir: PathBuf,
    env: Environment,
    overrides: InitOverrides,
}

impl SettingsLoader {
    pub fn new(workdir: impl Into<PathBuf>, env: Environment) -> Self {
        Self {
            workdir: workdir.into(),
            env,
            overrides: InitOverrides::default(),
        }
    }

    /// A loader over the current working directory and process environment.
    pub fn from_process() -> Result<Self> {
        let workdir = std::env::current_dir().map_err(ConfigError::WorkingDirectory)?;
        Ok(Self::new(workdir, Environment::capture()))
    }

    pub fn with_overrides(mut self, overrides: InitOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// The tracking tool's local directory for this workdir and environment.
    pub fn tracking_dir(&self) -> PathBuf {
        tracking_dir(&self.workdir, &self.env)
    }

    /// Resolve both settings groups; either group failing fails the load.
    pub fn load(&self) -> Result<CompositeSettings> {
        self.load_explained().map(|explained| explained.settings)
    }

    /// Resolve both groups and report the source of every resolved field.
    pub fn load_explained(&self) -> Result<ExplainedSettings> {
        let identity = IdentityFileSource::discover(&self.workdir, &self.env);
        let manifest = Manifest::discover(&self.workdir)?;

        let tracing: Resolved<TracingSettings> = resolve_explained(&SettingsSources {
            env: &self.env,
            identity: &identity,
            overrides: &self.overrides.tracing,
            manifest: &manifest,
        })?;
        let run_upload: Resolved<RunUploadSettings> = resolve_explained(&SettingsSources {
            env: &self.env,
            identity: &identity,
            overrides: &self.overrides.run_upload,
            manifest: &manifest,
        })?;

        let origins = BTreeMap::from([
            (TracingSettings::NAME, tracing.origins),
            (RunUploadSettings::NAME, run_upload.origins),
        ]);

        Ok(ExplainedSettings {
            settings: CompositeSettings {
                tracing: tracing.settings,
                run_upload: run_upload.settings,
            },
            origins,
        })
    }
}

/// Composite settings plus, per group, the source of each resolved field.
#[derive(Debug, Clone)]
pub struct ExplainedSettings {
    pub settings: CompositeSettings,
    pub origins: BTreeMap<&'static str, BTreeMap<&'static str, String>>,
}
