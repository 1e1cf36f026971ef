//! Queue-wide completion hooks and the key -> factory registry that selects one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::profiling::TaskProfile;
use super::types::{TaskInfo, TaskOutcome};

/// Called once per dequeued task, after it ran (or failed).
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_complete(
        &self,
        task: &TaskInfo,
        outcome: &TaskOutcome,
        profile: Option<&TaskProfile>,
    ) -> anyhow::Result<()>;
}

/// Default hook: one structured log line per task.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHook;

#[async_trait]
impl CompletionHook for LoggingHook {
    async fn on_complete(
        &self,
        task: &TaskInfo,
        outcome: &TaskOutcome,
        profile: Option<&TaskProfile>,
    ) -> anyhow::Result<()> {
        let duration_ms = profile.map(|p| p.duration_ms);
        let rss_delta = profile.map(|p| p.rss_delta);
        let peak_rss = profile.map(|p| p.peak_rss);

        match outcome {
            TaskOutcome::Failed { error } => error!(
                task_id = %task.task_id,
                task = %task.name,
                kind = task.kind,
                worker = task.worker,
                duration_ms,
                rss_delta,
                peak_rss,
                error = %error,
                "background task failed"
            ),
            _ => info!(
                task_id = %task.task_id,
                task = %task.name,
                kind = task.kind,
                worker = task.worker,
                status = outcome.status(),
                duration_ms,
                rss_delta,
                peak_rss,
                "background task finished"
            ),
        }
        Ok(())
    }
}

pub type HookFactory = Arc<dyn Fn() -> Arc<dyn CompletionHook> + Send + Sync>;

pub const DEFAULT_HOOK: &str = "logging";

/// Named completion hooks, populated at startup.
#[derive(Clone)]
pub struct CallbackRegistry {
    factories: HashMap<String, HookFactory>,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(DEFAULT_HOOK, || Arc::new(LoggingHook));
        registry
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn CompletionHook> + Send + Sync + 'static,
    {
        self.factories.insert(key.into(), Arc::new(factory));
    }

    pub fn resolve(&self, key: &str) -> Option<Arc<dyn CompletionHook>> {
        self.factories.get(key).map(|factory| factory())
    }

    /// Resolve `key`, falling back to the logging hook.
    pub fn resolve_or_default(&self, key: &str) -> Arc<dyn CompletionHook> {
        self.resolve(key).unwrap_or_else(|| {
            warn!(key, "unknown completion callback, using logging");
            Arc::new(LoggingHook)
        })
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<_> = self.factories.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

impl core::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::TaskId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl CompletionHook for Counting {
        async fn on_complete(
            &self,
            _: &TaskInfo,
            _: &TaskOutcome,
            _: Option<&TaskProfile>,
        ) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn info() -> TaskInfo {
        TaskInfo {
            task_id: TaskId::new(),
            name: "t".into(),
            kind: "blocking",
            worker: 0,
        }
    }

    #[tokio::test]
    async fn registered_hook_is_resolved_by_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = CallbackRegistry::new();
        let counter = calls.clone();
        registry.register("count", move || Arc::new(Counting(counter.clone())));

        assert_eq!(registry.keys(), vec!["count", "logging"]);
        let hook = registry.resolve("count").unwrap();
        hook.on_complete(&info(), &TaskOutcome::Queued, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_key_falls_back_to_logging() {
        let registry = CallbackRegistry::new();
        assert!(registry.resolve("nope").is_none());
        let hook = registry.resolve_or_default("nope");
        hook.on_complete(&info(), &TaskOutcome::Queued, None).await.unwrap();
    }
}
