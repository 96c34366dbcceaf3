//! Reader for the tracking tool's project settings file.
//!
//! The file lives at `<root>/wandb/settings`, is owned by the tracking tool's
//! own CLI, and uses INI syntax:
//!
//! ```text
//! [default]
//! entity = acme
//! project = evals
//! ```
//!
//! A missing, unreadable or malformed file is a soft miss: the source yields an
//! empty mapping and resolution falls through to lower-priority sources.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::environment::Environment;

/// Shared alias for the `project` field, in the environment and in this file's output.
pub const PROJECT_ALIAS: &str = "WANDB_PROJECT";
/// Shared alias for the `entity` field.
pub const ENTITY_ALIAS: &str = "WANDB_ENTITY";

/// Overrides the root under which the tracking directory lives.
const TRACKING_ROOT_ENV: &str = "WANDB_DIR";
const TRACKING_DIR_NAME: &str = "wandb";
const SETTINGS_FILE_NAME: &str = "settings";
const SETTINGS_SECTION: &str = "default";

/// Directory the tracking tool keeps its local state in.
///
/// `$WANDB_DIR/wandb` when `WANDB_DIR` is set (relative values resolve against
/// `workdir`), otherwise `<workdir>/wandb`.
pub fn tracking_dir(workdir: &Path, env: &Environment) -> PathBuf {
    let root = match env.get_non_empty(TRACKING_ROOT_ENV) {
        Some(dir) => workdir.join(dir),
        None => workdir.to_path_buf(),
    };
    root.join(TRACKING_DIR_NAME)
}

/// Memoising reader for the tracking identity file.
///
/// The first [`read`](Self::read) is cached for the lifetime of the instance,
/// even if the file later changes or disappears. Build a new instance to
/// force a re-read.
#[derive(Debug)]
pub struct IdentityFileSource {
    path: PathBuf,
    cache: OnceLock<BTreeMap<String, String>>,
}

impl IdentityFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: OnceLock::new(),
        }
    }

    /// Locate the settings file by the tracking tool's directory convention.
    pub fn discover(workdir: &Path, env: &Environment) -> Self {
        Self::new(tracking_dir(workdir, env).join(SETTINGS_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entity and project under their alias names, or an empty mapping.
    pub fn read(&self) -> &BTreeMap<String, String> {
        self.cache.get_or_init(|| self.load())
    }

    fn load(&self) -> BTreeMap<String, String> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "No tracking settings file");
                return BTreeMap::new();
            }
        };

        let sections = match parse_ini(&text) {
            Ok(sections) => sections,
            Err(reason) => {
                warn!(
                    path = %self.path.display(),
                    reason = %reason,
                    "Ignoring malformed tracking settings file"
                );
                return BTreeMap::new();
            }
        };

        let Some(section) = sections.get(SETTINGS_SECTION) else {
            debug!(path = %self.path.display(), "Tracking settings file has no [default] section");
            return BTreeMap::new();
        };

        let entity = section.get("entity").filter(|v| !v.is_empty());
        let project = section.get("project").filter(|v| !v.is_empty());
        match (entity, project) {
            (Some(entity), Some(project)) => BTreeMap::from([
                (ENTITY_ALIAS.to_string(), entity.clone()),
                (PROJECT_ALIAS.to_string(), project.clone()),
            ]),
            _ => {
                debug!(
                    path = %self.path.display(),
                    "Tracking settings file lacks entity or project"
                );
                BTreeMap::new()
            }
        }
    }
}

type Sections = BTreeMap<String, BTreeMap<String, String>>;

/// Parse INI text into sections of lower-cased keys.
///
/// Accepts `=` or `:` separators, `#`/`;` comment lines and indented
/// continuation lines. Rejects content before the first section header,
/// duplicate sections or keys, and lines that are neither headers nor pairs.
fn parse_ini(text: &str) -> Result<Sections, String> {
    let mut sections = Sections::new();
    let mut current: Option<String> = None;
    let mut last_key: Option<String> = None;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let indented = raw.starts_with([' ', '\t']);
        if indented {
            if let (Some(section), Some(key)) = (&current, &last_key) {
                if let Some(value) = sections.get_mut(section).and_then(|s| s.get_mut(key)) {
                    value.push('\n');
                    value.push_str(line);
                    continue;
                }
            }
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            if sections.contains_key(&name) {
                return Err(format!("line {lineno}: duplicate section [{name}]"));
            }
            sections.insert(name.clone(), BTreeMap::new());
            current = Some(name);
            last_key = None;
            continue;
        }

        let Some(section) = &current else {
            return Err(format!("line {lineno}: content before the first section header"));
        };
        let Some(split) = line.find(['=', ':']) else {
            return Err(format!("line {lineno}: expected 'key = value'"));
        };
        let key = line[..split].trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(format!("line {lineno}: empty key"));
        }
        let value = line[split + 1..].trim().to_string();

        let entries = sections.entry(section.clone()).or_default();
        if entries.contains_key(&key) {
            return Err(format!("line {lineno}: duplicate key '{key}' in [{section}]"));
        }
        entries.insert(key.clone(), value);
        last_key = Some(key);
    }

    Ok(sections)
}
