//! The host callback contract and a registry that drives it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, error};

use crate::error::{HookError, Result};
use crate::events::{HookEvent, RunEnd, RunStart, SampleEnd, TaskEnd, TaskStart};

/// Lifecycle callbacks invoked by the evaluation host.
///
/// The host calls [`enabled`](EvalHooks::enabled) once per run; when it
/// returns false no other callback is invoked for that run.
#[async_trait]
pub trait EvalHooks: Send + Sync {
    /// Display name for logging.
    fn name(&self) -> &str;

    /// Whether the hooks take part in the next run. Must not fail.
    fn enabled(&self) -> bool;

    async fn on_run_start(&self, event: &RunStart) -> Result<()>;

    async fn on_task_start(&self, _event: &TaskStart) -> Result<()> {
        Ok(())
    }

    async fn on_sample_end(&self, _event: &SampleEnd) -> Result<()> {
        Ok(())
    }

    async fn on_task_end(&self, _event: &TaskEnd) -> Result<()> {
        Ok(())
    }

    async fn on_run_end(&self, event: &RunEnd) -> Result<()>;
}

/// Deliver one event to one hook.
pub async fn deliver(hooks: &dyn EvalHooks, event: &HookEvent) -> Result<()> {
    match event {
        HookEvent::RunStart(e) => hooks.on_run_start(e).await,
        HookEvent::TaskStart(e) => hooks.on_task_start(e).await,
        HookEvent::SampleEnd(e) => hooks.on_sample_end(e).await,
        HookEvent::TaskEnd(e) => hooks.on_task_end(e).await,
        HookEvent::RunEnd(e) => hooks.on_run_end(e).await,
    }
}

struct Registered {
    name: String,
    description: String,
    hooks: Arc<dyn EvalHooks>,
}

/// A hook that failed while handling an event.
#[derive(Debug)]
pub struct DispatchFailure {
    pub hook: String,
    pub event: &'static str,
    pub error: HookError,
}

/// Named hook implementations, dispatched in registration order.
pub struct HookRegistry {
    entries: Vec<Registered>,
    enabled: Mutex<HashMap<String, bool>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            enabled: Mutex::new(HashMap::new()),
        }
    }

    /// Register hooks under a unique name. A later registration with the
    /// same name replaces the earlier one.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        hooks: Arc<dyn EvalHooks>,
    ) {
        let name = name.into();
        let entry = Registered {
            name: name.clone(),
            description: description.into(),
            hooks,
        };
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(name, description)` of every registered hook.
    pub fn describe(&self) -> Vec<(&str, &str)> {
        self.entries
            .iter()
            .map(|e| (e.name.as_str(), e.description.as_str()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn EvalHooks>> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| Arc::clone(&e.hooks))
    }

    /// Whether `name` was enabled for the current run, if known.
    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.enabled
            .lock()
            .ok()
            .and_then(|memo| memo.get(name).copied())
    }

    /// Deliver `event` to every enabled hook.
    ///
    /// Enablement is evaluated at run start and remembered until the next
    /// run start. A failing hook does not stop delivery to the others; its
    /// error is logged and returned.
    pub async fn dispatch(&self, event: &HookEvent) -> Vec<DispatchFailure> {
        if matches!(event, HookEvent::RunStart(_))
            && let Ok(mut memo) = self.enabled.lock()
        {
            memo.clear();
        }

        let mut failures = Vec::new();
        for entry in &self.entries {
            if !self.enabled_for_run(entry) {
                debug!(
                    hook = %entry.name,
                    event = event.event_name(),
                    "Hook disabled for this run"
                );
                continue;
            }
            if let Err(err) = deliver(entry.hooks.as_ref(), event).await {
                error!(
                    hook = %entry.name,
                    event = event.event_name(),
                    run_id = event.run_id(),
                    error = %err,
                    "Hook failed"
                );
                failures.push(DispatchFailure {
                    hook: entry.name.clone(),
                    event: event.event_name(),
                    error: err,
                });
            }
        }
        failures
    }

    fn enabled_for_run(&self, entry: &Registered) -> bool {
        if let Some(known) = self.is_enabled(&entry.name) {
            return known;
        }
        let enabled = entry.hooks.enabled();
        if let Ok(mut memo) = self.enabled.lock() {
            memo.insert(entry.name.clone(), enabled);
        }
        enabled
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHooks {
        name: String,
        enabled: bool,
        enabled_checks: AtomicUsize,
        delivered: AtomicUsize,
        fail: bool,
    }

    impl CountingHooks {
        fn new(name: &str, enabled: bool, fail: bool) -> Self {
            Self {
                name: name.into(),
                enabled,
                enabled_checks: AtomicUsize::new(0),
                delivered: AtomicUsize::new(0),
                fail,
            }
        }

        fn outcome(&self) -> Result<()> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(HookError::Precondition {
                    hook: "counting",
                    event: "test",
                    missing: "nothing",
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl EvalHooks for CountingHooks {
        fn name(&self) -> &str {
            &self.name
        }

        fn enabled(&self) -> bool {
            self.enabled_checks.fetch_add(1, Ordering::SeqCst);
            self.enabled
        }

        async fn on_run_start(&self, _event: &RunStart) -> Result<()> {
            self.outcome()
        }

        async fn on_run_end(&self, _event: &RunEnd) -> Result<()> {
            self.outcome()
        }
    }

    fn run_start() -> HookEvent {
        HookEvent::RunStart(RunStart {
            run_id: "run-1".into(),
            task_names: vec![],
        })
    }

    fn run_end() -> HookEvent {
        HookEvent::RunEnd(RunEnd {
            run_id: "run-1".into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_disabled_hooks_receive_nothing() {
        let on = Arc::new(CountingHooks::new("on", true, false));
        let off = Arc::new(CountingHooks::new("off", false, false));
        let mut registry = HookRegistry::new();
        registry.register("on", "enabled hooks", on.clone());
        registry.register("off", "disabled hooks", off.clone());

        registry.dispatch(&run_start()).await;
        registry.dispatch(&run_end()).await;

        assert_eq!(on.delivered.load(Ordering::SeqCst), 2);
        assert_eq!(off.delivered.load(Ordering::SeqCst), 0);
        assert_eq!(registry.is_enabled("off"), Some(false));
    }

    #[tokio::test]
    async fn test_enabled_checked_once_per_run() {
        let hooks = Arc::new(CountingHooks::new("h", true, false));
        let mut registry = HookRegistry::new();
        registry.register("h", "", hooks.clone());

        registry.dispatch(&run_start()).await;
        registry.dispatch(&run_end()).await;
        assert_eq!(hooks.enabled_checks.load(Ordering::SeqCst), 1);

        registry.dispatch(&run_start()).await;
        assert_eq!(hooks.enabled_checks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_other_hooks() {
        let failing = Arc::new(CountingHooks::new("failing", true, true));
        let healthy = Arc::new(CountingHooks::new("healthy", true, false));
        let mut registry = HookRegistry::new();
        registry.register("failing", "", failing);
        registry.register("healthy", "", healthy.clone());

        let failures = registry.dispatch(&run_start()).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].hook, "failing");
        assert_eq!(failures[0].event, "run_start");
        assert!(failures[0].error.is_precondition());
        assert_eq!(healthy.delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = HookRegistry::new();
        registry.register("h", "first", Arc::new(CountingHooks::new("h", true, false)));
        registry.register("h", "second", Arc::new(CountingHooks::new("h", true, false)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.describe(), vec![("h", "second")]);
        assert!(registry.get("h").is_some());
    }
}
