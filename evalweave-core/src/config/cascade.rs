//! The settings cascade.
//!
//! Each source is normalised into a [`figment`] provider keyed by canonical
//! field names, then the providers are merged lowest priority first so that
//! every field independently takes the value of its highest-priority definer.
//! When one source spells a field both by its canonical name and by its alias,
//! the canonical name wins.

use std::collections::BTreeMap;

use figment::value::{Dict, Map, Value as FigmentValue};
use figment::{Figment, Metadata, Profile, Provider};
use serde_json::Value;
use tracing::debug;

use super::{FieldKind, FieldSpec, IdentityFileSource, Manifest, SettingsGroup};
use crate::environment::Environment;
use crate::error::{ConfigError, Result};

/// The four inputs to one resolution pass.
#[derive(Debug, Clone, Copy)]
pub struct SettingsSources<'a> {
    pub env: &'a Environment,
    pub identity: &'a IdentityFileSource,
    pub overrides: &'a serde_json::Map<String, Value>,
    pub manifest: &'a Manifest,
}

/// A resolved group together with the source each field came from.
#[derive(Debug, Clone)]
pub struct Resolved<G> {
    pub settings: G,
    /// Field name to source name. Fields left at their default are absent.
    pub origins: BTreeMap<&'static str, String>,
}

/// Resolve one settings group from its sources.
pub fn resolve<G: SettingsGroup>(sources: &SettingsSources<'_>) -> Result<G> {
    resolve_explained(sources).map(|resolved| resolved.settings)
}

/// Resolve one settings group, also reporting where each field came from.
pub fn resolve_explained<G: SettingsGroup>(sources: &SettingsSources<'_>) -> Result<Resolved<G>> {
    let manifest_values = sources
        .manifest
        .group_table(G::NAME)
        .map(|table| select_fields::<G>(&table))
        .unwrap_or_default();

    let identity_values: serde_json::Map<String, Value> = sources
        .identity
        .read()
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    let tiers = [
        Tier::new::<G>(sources.manifest.source_name(), manifest_values)?,
        Tier::new::<G>("init overrides", select_fields::<G>(sources.overrides))?,
        Tier::new::<G>(
            format!("tracking settings {}", sources.identity.path().display()),
            select_fields::<G>(&identity_values),
        )?,
        Tier::new::<G>("environment", env_fields::<G>(sources.env)?)?,
    ];

    let figment = tiers
        .into_iter()
        .fold(Figment::new(), |figment, tier| figment.merge(tier));

    let settings: G = figment
        .extract()
        .map_err(|e| ConfigError::from_figment(G::NAME, e))?;

    for (field, value) in [("entity", settings.entity()), ("project", settings.project())] {
        if value.trim().is_empty() {
            return Err(ConfigError::BlankField {
                group: G::NAME,
                field: field.to_string(),
            });
        }
    }

    let origins = G::FIELDS
        .iter()
        .filter_map(|field| {
            figment
                .find_metadata(field.name)
                .map(|meta| (field.name, meta.name.to_string()))
        })
        .collect();

    debug!(
        group = G::NAME,
        identity = %settings.identity(),
        enabled = settings.enabled(),
        "Resolved settings group"
    );

    Ok(Resolved { settings, origins })
}

/// One precedence tier, already keyed by canonical field names.
struct Tier {
    name: String,
    values: Dict,
}

impl Tier {
    /// Textual values for typed fields are coerced here, so a manifest or
    /// override may spell `autopatch = "true"` just like the environment.
    fn new<G: SettingsGroup>(
        name: impl Into<String>,
        values: serde_json::Map<String, Value>,
    ) -> Result<Self> {
        let name = name.into();
        let mut dict = Dict::new();
        for (key, value) in coerce_text::<G>(&name, values)? {
            let value = FigmentValue::serialize(&value).map_err(|e| ConfigError::InvalidValue {
                group: G::NAME,
                field: key.clone(),
                source_name: name.clone(),
                reason: e.to_string(),
            })?;
            dict.insert(key, value);
        }
        Ok(Self { name, values: dict })
    }
}

impl Provider for Tier {
    fn metadata(&self) -> Metadata {
        Metadata::named(self.name.clone())
    }

    fn data(&self) -> std::result::Result<Map<Profile, Dict>, figment::Error> {
        Ok(Profile::Default.collect(self.values.clone()))
    }
}

/// Keep the declared fields of `G`, renaming aliases to canonical names.
///
/// Undeclared keys and `null` values are dropped.
fn select_fields<G: SettingsGroup>(
    source: &serde_json::Map<String, Value>,
) -> serde_json::Map<String, Value> {
    let mut out = serde_json::Map::new();
    for field in G::FIELDS {
        let value = source
            .get(field.name)
            .or_else(|| field.alias.and_then(|alias| source.get(alias)));
        if let Some(value) = value.filter(|v| !v.is_null()) {
            out.insert(field.name.to_string(), value.clone());
        }
    }
    out
}

/// Read and coerce the environment variables declared by `G`.
///
/// The prefixed name (`EVALWEAVE_TRACING_PROJECT`) wins over the shared alias
/// (`WANDB_PROJECT`) when both are set.
fn env_fields<G: SettingsGroup>(env: &Environment) -> Result<serde_json::Map<String, Value>> {
    let mut out = serde_json::Map::new();
    for field in G::FIELDS {
        let prefixed = format!("{}{}", G::ENV_PREFIX, field.name.to_ascii_uppercase());
        let hit = env
            .get(&prefixed)
            .map(|raw| (prefixed.clone(), raw))
            .or_else(|| {
                field
                    .alias
                    .and_then(|alias| env.get(alias).map(|raw| (alias.to_string(), raw)))
            });

        let Some((var, raw)) = hit else {
            continue;
        };
        let source_name = format!("environment variable {var}");
        if let Some(value) = coerce::<G>(field, &source_name, raw)? {
            out.insert(field.name.to_string(), value);
        }
    }
    Ok(out)
}

/// Coerce string values of non-string fields in one tier.
fn coerce_text<G: SettingsGroup>(
    source_name: &str,
    mut values: serde_json::Map<String, Value>,
) -> Result<serde_json::Map<String, Value>> {
    for field in G::FIELDS.iter().filter(|f| f.kind != FieldKind::Str) {
        let Some(Value::String(raw)) = values.get(field.name) else {
            continue;
        };
        match coerce::<G>(field, source_name, raw)? {
            Some(value) => values.insert(field.name.to_string(), value),
            None => values.remove(field.name),
        };
    }
    Ok(values)
}

/// Coerce a textual value to the field's declared type.
///
/// Blank values for non-string fields are treated as unset.
fn coerce<G: SettingsGroup>(
    field: &FieldSpec,
    source_name: &str,
    raw: &str,
) -> Result<Option<Value>> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        group: G::NAME,
        field: field.name.to_string(),
        source_name: source_name.to_string(),
        reason,
    };

    if field.kind != FieldKind::Str && raw.trim().is_empty() {
        return Ok(None);
    }

    let value = match field.kind {
        FieldKind::Str => Value::String(raw.to_string()),
        FieldKind::Bool => Value::Bool(
            parse_bool(raw).ok_or_else(|| invalid(format!("'{raw}' is not a boolean")))?,
        ),
        FieldKind::StrList => {
            let items: Vec<String> = serde_json::from_str(raw)
                .map_err(|e| invalid(format!("expected a JSON list of strings: {e}")))?;
            Value::from(items)
        }
        FieldKind::Map => {
            let map: serde_json::Map<String, Value> = serde_json::from_str(raw)
                .map_err(|e| invalid(format!("expected a JSON object: {e}")))?;
            Value::Object(map)
        }
    };
    Ok(Some(value))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" | "y" | "t" => Some(true),
        "false" | "0" | "no" | "off" | "n" | "f" => Some(false),
        _ => None,
    }
}
