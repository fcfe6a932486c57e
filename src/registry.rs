//! ProviderRegistry — the in-memory repository of managed providers.
//!
//! Keyed by provider id, read-often/write-rare: lookups take a read lock,
//! registration and removal take the write lock. Providers themselves carry
//! their own aggregate locks; the registry never holds its lock across a
//! provider operation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::HangarConfig;
use crate::error::HangarError;
use crate::events::EventBus;
use crate::provider::Provider;

/// Thread-safe map of provider id to aggregate.
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<Provider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        ProviderRegistry {
            providers: RwLock::new(HashMap::new()),
        }
    }

    /// Build a registry from validated config.
    ///
    /// Calls `config.validate()` first — returns an error without creating
    /// anything if config is invalid.
    pub fn from_config(config: &HangarConfig, events: Arc<EventBus>) -> crate::Result<Self> {
        config.validate()?;

        let mut providers = HashMap::new();
        for (id, spec) in &config.providers {
            let provider = Arc::new(Provider::new(id.clone(), spec.clone(), events.clone()));
            providers.insert(id.clone(), provider);
            tracing::debug!(provider = %id, mode = %spec.mode.as_str(), "provider registered");
        }

        Ok(ProviderRegistry {
            providers: RwLock::new(providers),
        })
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Provider>> {
        self.providers.read().await.get(id).cloned()
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.providers.read().await.contains_key(id)
    }

    /// Register a provider; fails on duplicate ids.
    pub async fn add(&self, provider: Arc<Provider>) -> crate::Result<()> {
        let mut providers = self.providers.write().await;
        let id = provider.id().to_string();
        if providers.contains_key(&id) {
            return Err(HangarError::DuplicateProvider(id));
        }
        providers.insert(id, provider);
        Ok(())
    }

    /// Remove and return a provider; the caller is responsible for shutting
    /// it down.
    pub async fn remove(&self, id: &str) -> Option<Arc<Provider>> {
        self.providers.write().await.remove(id)
    }

    /// Snapshot of every provider, in id order.
    pub async fn get_all(&self) -> Vec<Arc<Provider>> {
        let providers = self.providers.read().await;
        let mut all: Vec<Arc<Provider>> = providers.values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Sorted list of provider ids.
    pub async fn ids(&self) -> Vec<String> {
        let providers = self.providers.read().await;
        let mut ids: Vec<String> = providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn count(&self) -> usize {
        self.providers.read().await.len()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
