//! Settings for the Evalweave integrations.
//!
//! Two settings groups are resolved independently through the same cascade:
//! [`TracingSettings`] drives the evaluation tracing hooks and
//! [`RunUploadSettings`] drives the run-metadata upload hooks.
//!
//! Priority (highest to lowest), per field:
//! 1. Environment variables (`EVALWEAVE_<GROUP>_<FIELD>`, plus the shared
//!    `WANDB_PROJECT` / `WANDB_ENTITY` aliases)
//! 2. The tracking tool's settings file (`wandb/settings`, entity/project only)
//! 3. Programmatic overrides ([`InitOverrides`])
//! 4. The project manifest (`[tool.evalweave.<group>]` in `pyproject.toml`)

mod cascade;
mod identity;
mod loader;
mod manifest;

pub use cascade::{Resolved, SettingsSources, resolve, resolve_explained};
pub use identity::{ENTITY_ALIAS, IdentityFileSource, PROJECT_ALIAS, tracking_dir};
pub use loader::{ExplainedSettings, SettingsLoader};
pub use manifest::{MANIFEST_FILE, Manifest};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a settings field, used to coerce textual values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Str,
    StrList,
    Map,
}

/// Schema entry for one field of a settings group.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub alias: Option<&'static str>,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            alias: None,
            kind,
        }
    }

    pub const fn aliased(name: &'static str, alias: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            alias: Some(alias),
            kind,
        }
    }
}

const ENTITY_FIELD: FieldSpec = FieldSpec::aliased("entity", ENTITY_ALIAS, FieldKind::Str);
const PROJECT_FIELD: FieldSpec = FieldSpec::aliased("project", PROJECT_ALIAS, FieldKind::Str);

/// A named bundle of settings resolved through the cascade.
pub trait SettingsGroup: Serialize + DeserializeOwned + Sized {
    /// Short group name, also the manifest table name.
    const NAME: &'static str;
    /// Prefix for the group's environment variables.
    const ENV_PREFIX: &'static str;
    /// Declared fields, with aliases and types.
    const FIELDS: &'static [FieldSpec];

    fn enabled(&self) -> bool;
    fn entity(&self) -> &str;
    fn project(&self) -> &str;

    /// The (entity, project) pair this group writes to.
    fn identity(&self) -> ProjectIdentity {
        ProjectIdentity {
            entity: self.entity().to_string(),
            project: self.project().to_string(),
        }
    }
}

/// Where tracing data is written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectIdentity {
    pub entity: String,
    pub project: String,
}

impl fmt::Display for ProjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity, self.project)
    }
}

fn default_true() -> bool {
    true
}

/// Settings for the evaluation tracing integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracingSettings {
    /// Whether the tracing integration is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub project: String,
    pub entity: String,
    /// Wrap every task in an `inspect_task` call span.
    #[serde(default)]
    pub autopatch: bool,
}

impl SettingsGroup for TracingSettings {
    const NAME: &'static str = "tracing";
    const ENV_PREFIX: &'static str = "EVALWEAVE_TRACING_";
    const FIELDS: &'static [FieldSpec] = &[
        FieldSpec::new("enabled", FieldKind::Bool),
        PROJECT_FIELD,
        ENTITY_FIELD,
        FieldSpec::new("autopatch", FieldKind::Bool),
    ];

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn entity(&self) -> &str {
        &self.entity
    }

    fn project(&self) -> &str {
        &self.project
    }
}

/// Settings for the run-metadata upload integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunUploadSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub project: String,
    pub entity: String,
    /// Passed through verbatim as the tracked run's config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Map<String, serde_json::Value>>,
    /// Files to upload with the run, relative to the tracking directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
}

impl SettingsGroup for RunUploadSettings {
    const NAME: &'static str = "upload";
    const ENV_PREFIX: &'static str = "EVALWEAVE_UPLOAD_";
    const FIELDS: &'static [FieldSpec] = &[
        FieldSpec::new("enabled", FieldKind::Bool),
        PROJECT_FIELD,
        ENTITY_FIELD,
        FieldSpec::new("config", FieldKind::Map),
        FieldSpec::new("files", FieldKind::StrList),
    ];

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn entity(&self) -> &str {
        &self.entity
    }

    fn project(&self) -> &str {
        &self.project
    }
}

/// Both settings groups, resolved together by [`SettingsLoader`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeSettings {
    pub tracing: TracingSettings,
    pub run_upload: RunUploadSettings,
}

/// Programmatic overrides, keyed by canonical field name or alias.
///
/// These sit below the environment and the tracking identity file, and above
/// the project manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitOverrides {
    pub tracing: serde_json::Map<String, serde_json::Value>,
    pub run_upload: serde_json::Map<String, serde_json::Value>,
}

impl InitOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracing(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.tracing.insert(key.to_string(), value.into());
        self
    }

    pub fn run_upload(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.run_upload.insert(key.to_string(), value.into());
        self
    }

    /// Apply the same override to both groups.
    pub fn both(self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        let value = value.into();
        self.tracing(key, value.clone()).run_upload(key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display() {
        let identity = ProjectIdentity {
            entity: "acme".into(),
            project: "evals".into(),
        };
        assert_eq!(identity.to_string(), "acme/evals");
    }

    #[test]
    fn test_group_defaults_apply_on_deserialize() {
        let settings: TracingSettings =
            serde_json::from_value(serde_json::json!({"project": "p", "entity": "e"})).unwrap();
        assert!(settings.enabled);
        assert!(!settings.autopatch);

        let upload: RunUploadSettings =
            serde_json::from_value(serde_json::json!({"project": "p", "entity": "e"})).unwrap();
        assert!(upload.enabled);
        assert!(upload.config.is_none());
        assert!(upload.files.is_none());
    }

    #[test]
    fn test_schema_declares_aliases_for_identity_fields() {
        for fields in [TracingSettings::FIELDS, RunUploadSettings::FIELDS] {
            let aliased: Vec<_> = fields.iter().filter_map(|f| f.alias).collect();
            assert_eq!(aliased, vec![PROJECT_ALIAS, ENTITY_ALIAS]);
        }
    }

    #[test]
    fn test_init_overrides_both() {
        let overrides = InitOverrides::new().both("WANDB_PROJECT", "shared");
        assert_eq!(overrides.tracing["WANDB_PROJECT"], "shared");
        assert_eq!(overrides.run_upload["WANDB_PROJECT"], "shared");
    }
}
