//! CLI subcommand handlers.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use evalweave_core::config::{ExplainedSettings, FieldSpec};
use evalweave_core::{SettingsGroup, SettingsLoader};
use evalweave_hooks::events::HookEvent;
use evalweave_hooks::{RecordingBackend, RecordingRunTracker, default_registry, evaluation, upload};
use serde::Serialize;
use tracing::{info, warn};

use crate::{Commands, OutputFormat};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, loader: SettingsLoader) -> anyhow::Result<()> {
    match command {
        Commands::Settings { format, explain } => {
            let explained = loader
                .load_explained()
                .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
            print!("{}", render_settings(&explained, format, explain)?);
            Ok(())
        }
        Commands::Check => {
            for line in check_report(&loader)? {
                println!("{line}");
            }
            Ok(())
        }
        Commands::Replay { events } => handle_replay(loader, &events).await,
    }
}

/// Render resolved settings, optionally annotated with their sources.
pub fn render_settings(
    explained: &ExplainedSettings,
    format: OutputFormat,
    explain: bool,
) -> anyhow::Result<String> {
    let settings = &explained.settings;
    if explain {
        let mut out = String::new();
        explain_group(&mut out, &settings.tracing, explained)?;
        out.push('\n');
        explain_group(&mut out, &settings.run_upload, explained)?;
        return Ok(out);
    }
    let mut rendered = match format {
        OutputFormat::Toml => toml::to_string_pretty(settings)?,
        OutputFormat::Json => serde_json::to_string_pretty(settings)?,
    };
    if !rendered.ends_with('\n') {
        rendered.push('\n');
    }
    Ok(rendered)
}

fn explain_group<G: SettingsGroup>(
    out: &mut String,
    group: &G,
    explained: &ExplainedSettings,
) -> anyhow::Result<()> {
    let values = serde_json::to_value(group)?;
    let origins = explained.origins.get(G::NAME);
    writeln!(out, "[{}]", G::NAME)?;
    for FieldSpec { name, .. } in G::FIELDS {
        let value = values
            .get(*name)
            .map(|v| v.to_string())
            .unwrap_or_else(|| "(unset)".to_string());
        let origin = origins
            .and_then(|o| o.get(name))
            .map(String::as_str)
            .unwrap_or("default");
        writeln!(out, "{name} = {value}  # {origin}")?;
    }
    Ok(())
}

/// One line per integration saying whether it would run.
///
/// A missing project identity disables both integrations; any other
/// configuration error is returned.
pub fn check_report(loader: &SettingsLoader) -> anyhow::Result<Vec<String>> {
    let settings = match loader.load() {
        Ok(settings) => settings,
        Err(err) if err.is_missing_identity() => {
            return Ok(vec![
                format!("{}: disabled ({err})", evaluation::HOOK_NAME),
                format!("{}: disabled ({err})", upload::HOOK_NAME),
            ]);
        }
        Err(err) => return Err(anyhow::anyhow!("Configuration error: {}", err)),
    };

    Ok(vec![
        status_line(evaluation::HOOK_NAME, &settings.tracing),
        status_line(upload::HOOK_NAME, &settings.run_upload),
    ])
}

fn status_line<G: SettingsGroup>(hook: &str, group: &G) -> String {
    if group.enabled() {
        format!("{hook}: enabled (writing to {})", group.identity())
    } else {
        format!("{hook}: disabled ({}.enabled = false)", G::NAME)
    }
}

#[derive(Serialize)]
#[serde(tag = "target", rename_all = "snake_case")]
enum ReplayRecord<T> {
    Tracing(T),
    Tracker(T),
}

/// Feed recorded events through both integrations and print every call
/// they would have made, as JSON lines.
async fn handle_replay(loader: SettingsLoader, events: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(events)
        .with_context(|| format!("Failed to read {}", events.display()))?;
    let events = parse_events(&text)?;

    let backend = Arc::new(RecordingBackend::new());
    let tracker = Arc::new(RecordingRunTracker::new());
    let registry = default_registry(backend.clone(), tracker.clone(), loader);

    let mut failures = 0;
    for event in &events {
        for failure in registry.dispatch(event).await {
            warn!(
                hook = %failure.hook,
                event = failure.event,
                error = %failure.error,
                "Replay event failed"
            );
            failures += 1;
        }
    }
    info!(events = events.len(), failures, "Replay finished");

    for recorded in backend.recorded().await {
        println!("{}", serde_json::to_string(&ReplayRecord::Tracing(recorded))?);
    }
    for recorded in tracker.recorded().await {
        println!("{}", serde_json::to_string(&ReplayRecord::Tracker(recorded))?);
    }

    if failures > 0 {
        anyhow::bail!("{failures} hook event(s) failed during replay");
    }
    Ok(())
}

/// Parse one event per non-blank line.
pub fn parse_events(text: &str) -> anyhow::Result<Vec<HookEvent>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Invalid event on line {}", index + 1))
        })
        .collect()
}
