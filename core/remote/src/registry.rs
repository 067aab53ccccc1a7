//! Remote registry for resolving adapters by name.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use shopsync_common::{Error, Result};

use crate::provider::RemoteSystem;

/// Factory function type for creating remotes.
pub type RemoteFactory = Box<dyn Fn(Value) -> Result<Arc<dyn RemoteSystem>> + Send + Sync>;

/// Registry for remote system factories.
///
/// Allows the host to pick its backend from configuration instead of
/// hard-wiring one.
pub struct RemoteRegistry {
    factories: HashMap<String, RemoteFactory>,
}

impl RemoteRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a remote factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: RemoteFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Remote '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a remote by name and configuration.
    ///
    /// # Errors
    /// - Remote not registered
    /// - Configuration invalid for the remote
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn RemoteSystem>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Remote '{}' is not registered", name)))?;
        factory(config)
    }

    /// Registered remote names, sorted.
    pub fn remotes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a remote is registered.
    pub fn has_remote(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for RemoteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn memory_factory(_config: Value) -> Result<Arc<dyn RemoteSystem>> {
    Ok(Arc::new(crate::memory::MemoryRemote::new()))
}

fn file_factory(config: Value) -> Result<Arc<dyn RemoteSystem>> {
    let root = config
        .get("root")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidInput("File remote requires 'root' path".to_string()))?;
    Ok(Arc::new(crate::file::FileRemote::open(root)?))
}

fn rest_factory(config: Value) -> Result<Arc<dyn RemoteSystem>> {
    let config: crate::rest::RestConfig = serde_json::from_value(config)
        .map_err(|e| Error::InvalidInput(format!("Invalid rest remote config: {}", e)))?;
    Ok(Arc::new(crate::rest::RestRemote::new(config)?))
}

/// Create a registry with the built-in remotes.
pub fn create_default_registry() -> RemoteRegistry {
    let mut registry = RemoteRegistry::new();
    registry
        .factories
        .insert("memory".to_string(), Box::new(memory_factory));
    registry
        .factories
        .insert("file".to_string(), Box::new(file_factory));
    registry
        .factories
        .insert("rest".to_string(), Box::new(rest_factory));
    registry
}
