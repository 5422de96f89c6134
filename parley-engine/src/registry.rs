// ABOUTME: Name-to-constructor table for the engines parley can drive a turn with.
// ABOUTME: The `[engine]` config section picks an entry and feeds it its own settings.

use crate::handle::EngineHandle;
use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::BTreeMap;

/// Builds a running engine from the JSON form of its `[engine]` settings
pub type EngineFactory = Box<dyn Fn(&Value) -> Result<EngineHandle> + Send + Sync>;

/// Engines known to this build, keyed by the `engine.type` value that selects them.
///
/// `Default` holds every built-in engine; tests start from `new()` and add their own.
pub struct EngineRegistry {
    engines: BTreeMap<String, EngineFactory>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            engines: BTreeMap::new(),
        }
    }

    /// Add an engine under `name`, replacing any earlier entry with that name
    pub fn register<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&Value) -> Result<EngineHandle> + Send + Sync + 'static,
    {
        self.engines.insert(name.to_string(), Box::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.engines.contains_key(name)
    }

    /// Start the engine called `name`.
    ///
    /// Must be called inside a tokio runtime: factories spawn their worker.
    pub fn create(&self, name: &str, settings: &Value) -> Result<EngineHandle> {
        let Some(factory) = self.engines.get(name) else {
            bail!(
                "Unknown engine '{}' (available: {})",
                name,
                self.available().join(", ")
            );
        };
        factory(settings)
    }

    /// Engine names in alphabetical order
    pub fn available(&self) -> Vec<&str> {
        self.engines.keys().map(String::as_str).collect()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        use crate::backends::direct_cli::DirectCliEngine;
        use crate::backends::mock::MockEngine;

        Self::new()
            .register("direct", DirectCliEngine::factory())
            .register("mock", MockEngine::factory())
    }
}
