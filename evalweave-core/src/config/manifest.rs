//! Project manifest lookup.
//!
//! Settings groups may be configured in the project's `pyproject.toml`:
//!
//! ```toml
//! [tool.evalweave.tracing]
//! enabled = false
//!
//! [tool.evalweave.upload]
//! files = ["model_config.yaml"]
//! config = { from = "pyproject" }
//! ```
//!
//! The manifest is the lowest-priority source.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ConfigError, Result};

pub const MANIFEST_FILE: &str = "pyproject.toml";
const TOOL_TABLE: [&str; 2] = ["tool", "evalweave"];

/// A parsed project manifest, or the absence of one.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    path: Option<PathBuf>,
    document: toml::Table,
}

impl Manifest {
    /// A manifest that contributes nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Find the nearest manifest at or above `workdir`.
    ///
    /// A missing manifest is not an error. A manifest that exists but cannot
    /// be read or parsed is.
    pub fn discover(workdir: &Path) -> Result<Self> {
        for dir in workdir.ancestors() {
            let candidate = dir.join(MANIFEST_FILE);
            if candidate.is_file() {
                return Self::load(&candidate);
            }
        }
        debug!(workdir = %workdir.display(), "No project manifest found");
        Ok(Self::empty())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let document: toml::Table =
            toml::from_str(&text).map_err(|e| ConfigError::MalformedSource {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        debug!(path = %path.display(), "Loaded project manifest");
        Ok(Self {
            path: Some(path.to_path_buf()),
            document,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Human-readable name used in error messages.
    pub fn source_name(&self) -> String {
        match &self.path {
            Some(path) => format!("manifest {}", path.display()),
            None => "manifest".to_string(),
        }
    }

    /// The `[tool.evalweave.<group>]` table as JSON, if present.
    pub fn group_table(&self, group: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
        let mut table = &self.document;
        for key in TOOL_TABLE {
            table = table.get(key)?.as_table()?;
        }
        let table = table.get(group)?.as_table()?;
        match serde_json::to_value(table) {
            Ok(serde_json::Value::Object(map)) => Some(map),
            _ => None,
        }
    }
}
