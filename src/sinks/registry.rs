use super::reporters::{SilentReporter, TracingReporter};
use super::sink::MessageSink;
use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type ReporterFactory = fn() -> Arc<dyn MessageSink>;

/// Table from a stable reporter key to the factory building it.
#[derive(Debug, Clone, Default)]
pub struct ReporterRegistry {
    factories: BTreeMap<&'static str, ReporterFactory>,
}

impl ReporterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `tracing` and `silent`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("silent", || Arc::new(SilentReporter));
        registry.register("tracing", || Arc::new(TracingReporter));
        registry
    }

    /// Adds or replaces a factory, returning the one it replaced.
    pub fn register(
        &mut self,
        key: &'static str,
        factory: ReporterFactory,
    ) -> Option<ReporterFactory> {
        self.factories.insert(key, factory)
    }

    pub fn create(&self, key: &str) -> Result<Arc<dyn MessageSink>> {
        match self.factories.get(key) {
            Some(factory) => Ok(factory()),
            None => bail!(
                "unknown reporter '{key}' (available: {})",
                self.keys().collect::<Vec<_>>().join(", ")
            ),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }
}
