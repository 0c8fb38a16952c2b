//! Policy type -> plugin resolution.

use super::Plugin;
use crate::error::PluginError;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a plugin instance with its own configuration (RPC endpoints,
/// contract addresses, ...).
pub trait PluginFactory: Send + Sync {
    fn create(&self) -> anyhow::Result<Arc<dyn Plugin>>;
}

impl<F> PluginFactory for F
where
    F: Fn() -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync,
{
    fn create(&self) -> anyhow::Result<Arc<dyn Plugin>> {
        self()
    }
}

/// Immutable map from policy type to factory. Each call to [`resolve`]
/// builds a fresh plugin for the current request or cycle.
///
/// [`resolve`]: PluginRegistry::resolve
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, Arc<dyn PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for `plugin_type`.
    pub fn register(mut self, plugin_type: &str, factory: impl PluginFactory + 'static) -> Self {
        self.factories
            .insert(plugin_type.to_string(), Arc::new(factory));
        self
    }

    /// Build the plugin for `plugin_type`.
    pub fn resolve(&self, plugin_type: &str) -> Result<Arc<dyn Plugin>, PluginError> {
        let factory = self
            .factories
            .get(plugin_type)
            .ok_or_else(|| PluginError::UnknownType(plugin_type.to_string()))?;
        factory
            .create()
            .map_err(|e| PluginError::InvalidPolicy(format!("failed to initialize {plugin_type} plugin: {e:#}")))
    }

    /// Registered policy types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}
