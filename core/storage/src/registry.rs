//! Store registry for resolving node stores by name.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::store::NodeStore;
use strata_common::{Error, Result};

/// Factory function type for creating stores.
///
/// Opening a store may touch the filesystem, so factories are async.
pub type StoreFactory =
    Box<dyn Fn(Value) -> BoxFuture<'static, Result<Arc<dyn NodeStore>>> + Send + Sync>;

/// Registry for node store factories.
///
/// Allows the CLI and embedding applications to pick a cache backend by
/// name and configuration.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a store factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Store '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a store by name and configuration.
    ///
    /// # Errors
    /// - Store not found
    /// - Configuration invalid
    /// - Store failed to open
    pub async fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn NodeStore>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Store '{}' is not registered", name)))?;
        factory(config).await
    }

    /// Get list of registered store names.
    pub fn stores(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a store is registered.
    pub fn has_store(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn memory_factory() -> StoreFactory {
    Box::new(|_config| {
        Box::pin(async { Ok(Arc::new(crate::memory::MemoryStore::new()) as Arc<dyn NodeStore>) })
    })
}

fn file_factory() -> StoreFactory {
    Box::new(|config| {
        Box::pin(async move {
            let path = config
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::InvalidInput("File store requires 'path'".to_string()))?
                .to_string();
            let store = crate::local::JsonFileStore::open(path).await?;
            Ok(Arc::new(store) as Arc<dyn NodeStore>)
        })
    })
}

/// Create a registry with the built-in stores (`memory` and `file`).
pub fn create_default_registry() -> StoreRegistry {
    let mut factories = HashMap::new();
    factories.insert("memory".to_string(), memory_factory());
    factories.insert("file".to_string(), file_factory());
    StoreRegistry { factories }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let mut registry = StoreRegistry::new();
        registry.register("test", memory_factory()).unwrap();

        let store = registry.resolve("test", Value::Null).await.unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = StoreRegistry::new();
        registry.register("test", memory_factory()).unwrap();
        assert!(registry.register("test", memory_factory()).is_err());
    }

    #[tokio::test]
    async fn test_resolve_unknown_fails() {
        let registry = StoreRegistry::new();
        assert!(registry.resolve("unknown", Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_default_registry() {
        let registry = create_default_registry();
        assert_eq!(registry.stores(), vec!["file", "memory"]);

        let temp = TempDir::new().unwrap();
        let file = temp.path().join("nodes.json");
        let store = registry
            .resolve("file", serde_json::json!({ "path": file }))
            .await
            .unwrap();
        assert_eq!(store.name(), "file");

        assert!(registry.resolve("file", Value::Null).await.is_err());
    }
}
