//! Named data stores. Detector descriptors refer to stores by name.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::DataStoreError;
use crate::store::DataStore;

#[derive(Default, Clone)]
pub struct DataStoreRegistry {
    stores: BTreeMap<String, Arc<dyn DataStore>>,
}

impl DataStoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `store` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, store: Arc<dyn DataStore>) {
        let name = name.into();
        if self.stores.insert(name.clone(), store).is_some() {
            tracing::warn!(data_store = %name, "data store replaced");
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DataStore>, DataStoreError> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| DataStoreError::Unknown(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Destroy every store and empty the registry.
    pub async fn destroy(&mut self) {
        for (name, store) in std::mem::take(&mut self.stores) {
            store.destroy().await;
            tracing::debug!(data_store = %name, "data store destroyed");
        }
    }
}
