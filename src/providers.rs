//! Provider registry.
//!
//! A process-wide catalog of the database, storage, monitoring and cache
//! providers the core runs with, keyed by `(type, name)`. [`ProviderRegistry::init`]
//! registers the configured providers and picks the defaults;
//! [`ProviderRegistry::shutdown`] closes every database provider.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, histogram};
use once_cell::sync::Lazy;
use serde::Serialize;
use strum::{Display, EnumString};
use tracing::{info, warn};

use crate::cache::CacheSettings;
use crate::config::AppConfig;
use crate::db::{connect_backend, Backend, StorageBackend};
use crate::errors::ServiceError;
use crate::storage::{LocalObjectStorage, MemoryObjectStorage, ObjectStorage};

/// Sink for operational counters and timings.
pub trait Monitor: Send + Sync {
    fn name(&self) -> &str;

    fn increment(&self, metric: &'static str);

    fn observe(&self, metric: &'static str, elapsed: Duration);
}

/// Forwards to the `metrics` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsMonitor;

impl Monitor for MetricsMonitor {
    fn name(&self) -> &str {
        "metrics"
    }

    fn increment(&self, metric: &'static str) {
        counter!(metric, 1);
    }

    fn observe(&self, metric: &'static str, elapsed: Duration) {
        histogram!(metric, elapsed.as_secs_f64());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Database,
    Storage,
    Monitoring,
    Cache,
}

#[derive(Clone)]
pub enum ProviderInstance {
    Database(Arc<Backend>),
    Storage(Arc<dyn ObjectStorage>),
    Monitoring(Arc<dyn Monitor>),
    Cache(CacheSettings),
}

impl std::fmt::Debug for ProviderInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderInstance::Database(backend) => f.debug_tuple("Database").field(backend).finish(),
            ProviderInstance::Storage(storage) => f.debug_tuple("Storage").field(&storage.name()).finish(),
            ProviderInstance::Monitoring(monitor) => f.debug_tuple("Monitoring").field(&monitor.name()).finish(),
            ProviderInstance::Cache(settings) => f.debug_tuple("Cache").field(settings).finish(),
        }
    }
}

impl ProviderInstance {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            ProviderInstance::Database(_) => ProviderType::Database,
            ProviderInstance::Storage(_) => ProviderType::Storage,
            ProviderInstance::Monitoring(_) => ProviderType::Monitoring,
            ProviderInstance::Cache(_) => ProviderType::Cache,
        }
    }

    pub fn as_database(&self) -> Option<Arc<Backend>> {
        match self {
            ProviderInstance::Database(backend) => Some(backend.clone()),
            _ => None,
        }
    }

    pub fn as_storage(&self) -> Option<Arc<dyn ObjectStorage>> {
        match self {
            ProviderInstance::Storage(storage) => Some(storage.clone()),
            _ => None,
        }
    }

    pub fn as_monitor(&self) -> Option<Arc<dyn Monitor>> {
        match self {
            ProviderInstance::Monitoring(monitor) => Some(monitor.clone()),
            _ => None,
        }
    }
}

static GLOBAL: Lazy<ProviderRegistry> = Lazy::new(ProviderRegistry::new);

#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: DashMap<(ProviderType, String), ProviderInstance>,
    defaults: DashMap<ProviderType, String>,
}

impl ProviderRegistry {
    /// A standalone registry; the process-wide one is [`ProviderRegistry::global`].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static ProviderRegistry {
        &GLOBAL
    }

    /// Registers `instance` under `name`, replacing any earlier registration.
    pub fn register(&self, name: impl Into<String>, instance: ProviderInstance) {
        let provider_type = instance.provider_type();
        let name = name.into();
        if self
            .providers
            .insert((provider_type, name.clone()), instance)
            .is_none()
        {
            info!(provider_type = %provider_type, provider = %name, "Provider registered");
        }
    }

    pub fn get(&self, provider_type: ProviderType, name: &str) -> Option<ProviderInstance> {
        self.providers
            .get(&(provider_type, name.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Every provider of one type, sorted by name.
    pub fn get_all_of_type(&self, provider_type: ProviderType) -> Vec<(String, ProviderInstance)> {
        let mut found: Vec<(String, ProviderInstance)> = self
            .providers
            .iter()
            .filter(|entry| entry.key().0 == provider_type)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    pub fn is_registered(&self, provider_type: ProviderType, name: &str) -> bool {
        self.providers.contains_key(&(provider_type, name.to_string()))
    }

    pub fn set_default(&self, provider_type: ProviderType, name: &str) -> Result<(), ServiceError> {
        if !self.is_registered(provider_type, name) {
            return Err(ServiceError::ConfigurationError(format!(
                "{} provider '{}' is not registered",
                provider_type, name
            )));
        }
        self.defaults.insert(provider_type, name.to_string());
        Ok(())
    }

    fn default_of(&self, provider_type: ProviderType) -> Result<ProviderInstance, ServiceError> {
        let name = self
            .defaults
            .get(&provider_type)
            .map(|n| n.value().clone())
            .ok_or_else(|| {
                ServiceError::ConfigurationError(format!("no default {} provider configured", provider_type))
            })?;
        self.get(provider_type, &name).ok_or_else(|| {
            ServiceError::ConfigurationError(format!("default {} provider '{}' is gone", provider_type, name))
        })
    }

    pub fn default_database(&self) -> Result<Arc<Backend>, ServiceError> {
        self.default_of(ProviderType::Database)?
            .as_database()
            .ok_or_else(|| ServiceError::ConfigurationError("default database is not a database".into()))
    }

    pub fn default_storage(&self) -> Result<Arc<dyn ObjectStorage>, ServiceError> {
        self.default_of(ProviderType::Storage)?
            .as_storage()
            .ok_or_else(|| ServiceError::ConfigurationError("default storage is not a storage provider".into()))
    }

    /// The registered monitor, or a [`MetricsMonitor`] when none is.
    pub fn monitor(&self) -> Arc<dyn Monitor> {
        self.get_all_of_type(ProviderType::Monitoring)
            .into_iter()
            .find_map(|(_, instance)| instance.as_monitor())
            .unwrap_or_else(|| Arc::new(MetricsMonitor))
    }

    pub fn cache_settings(&self) -> CacheSettings {
        match self.get(ProviderType::Cache, "memory") {
            Some(ProviderInstance::Cache(settings)) => settings,
            _ => CacheSettings::default(),
        }
    }

    /// Connects the configured database, builds the configured storage and
    /// registers both as defaults alongside the monitoring and cache providers.
    pub async fn init(&self, config: &AppConfig) -> Result<(), ServiceError> {
        let settings = config
            .database_settings()
            .map_err(|e| ServiceError::ConfigurationError(e.to_string()))?;
        let backend = connect_backend(&settings).await?;
        backend.ensure_schema().await?;
        self.register(
            config.db_provider.as_str(),
            ProviderInstance::Database(Arc::new(backend)),
        );
        self.set_default(ProviderType::Database, &config.db_provider)?;

        let storage: Arc<dyn ObjectStorage> = match config.storage_provider.as_str() {
            "local" => Arc::new(LocalObjectStorage::new(&config.storage_bucket, &config.storage_bucket)),
            "memory" => Arc::new(MemoryObjectStorage::new()),
            other => {
                return Err(ServiceError::ConfigurationError(format!(
                    "unknown STORAGE_PROVIDER '{}'",
                    other
                )))
            }
        };
        self.register(config.storage_provider.as_str(), ProviderInstance::Storage(storage));
        self.set_default(ProviderType::Storage, &config.storage_provider)?;

        self.register("metrics", ProviderInstance::Monitoring(Arc::new(MetricsMonitor)));
        self.register(
            "memory",
            ProviderInstance::Cache(CacheSettings::with_ttl(config.cache_ttl())),
        );

        info!(
            database = %config.db_provider,
            storage = %config.storage_provider,
            "Providers initialized"
        );
        Ok(())
    }

    /// Closes every database provider. Failures are logged, not returned.
    pub async fn shutdown(&self) {
        for (name, instance) in self.get_all_of_type(ProviderType::Database) {
            if let Some(backend) = instance.as_database() {
                match backend.close().await {
                    Ok(()) => info!(provider = %name, "Database provider closed"),
                    Err(e) => warn!(provider = %name, error = %e, "Failed to close database provider"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn memory_storage() -> ProviderInstance {
        ProviderInstance::Storage(Arc::new(MemoryObjectStorage::new()))
    }

    #[test]
    fn reregistering_replaces_the_instance() {
        let registry = ProviderRegistry::new();
        registry.register("memory", memory_storage());
        registry.register("memory", memory_storage());
        assert_eq!(registry.get_all_of_type(ProviderType::Storage).len(), 1);
        assert!(registry.is_registered(ProviderType::Storage, "memory"));
        assert!(!registry.is_registered(ProviderType::Database, "memory"));
    }

    #[test]
    fn missing_default_is_a_configuration_error() {
        let registry = ProviderRegistry::new();
        let err = registry.default_storage().err().unwrap();
        assert_eq!(err.code(), "ConfigurationError");
        assert!(registry.set_default(ProviderType::Storage, "s3").is_err());
    }

    #[tokio::test]
    async fn init_registers_all_four_provider_types() {
        let vars: HashMap<String, String> = [
            ("DB_URI", "memory:"),
            ("DB_PROVIDER", "otherdoc"),
            ("STORAGE_PROVIDER", "memory"),
            ("STORAGE_BUCKET", "uploads"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let config = crate::config::load_config_from(Some(vars)).unwrap();

        let registry = ProviderRegistry::new();
        registry.init(&config).await.unwrap();

        for provider_type in [
            ProviderType::Database,
            ProviderType::Storage,
            ProviderType::Monitoring,
            ProviderType::Cache,
        ] {
            assert_eq!(registry.get_all_of_type(provider_type).len(), 1, "{}", provider_type);
        }
        assert_eq!(registry.default_database().unwrap().kind().to_string(), "otherdoc");
        assert_eq!(registry.default_storage().unwrap().name(), "memory");
        registry.shutdown().await;
    }
}
