use std::sync::Arc;

use crate::{
    cache::{CacheSettings, CachedRepository},
    config::AppConfig,
    db::{Backend, RetryPolicy, TransactionCoordinator},
    errors::ServiceError,
    models::Entity,
    providers::{Monitor, ProviderRegistry},
    repositories::{EntityRepository, RelationshipRepository, SharedRepository},
    services::{
        assets::AssetService, derivation::DerivationService, inventory::InventoryService, items::ItemService,
        purchases::PurchaseService, relationships::RelationshipService, sales::SaleService,
        Repositories,
    },
    storage::ObjectStorage,
};

/// Factory for creating service instances with shared dependencies
pub struct ServiceFactory {
    backend: Arc<Backend>,
    storage: Arc<dyn ObjectStorage>,
    coordinator: Arc<TransactionCoordinator>,
    repos: Repositories,
}

impl std::fmt::Debug for ServiceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceFactory")
            .field("backend", &self.backend)
            .field("storage", &self.storage.name())
            .finish_non_exhaustive()
    }
}

fn cached<E: Entity>(backend: &Arc<Backend>, settings: &CacheSettings) -> SharedRepository<E> {
    Arc::new(CachedRepository::new(
        EntityRepository::<E>::new(backend.clone()),
        settings.clone(),
    ))
}

impl ServiceFactory {
    /// Creates a new service factory over one backend. Every repository is
    /// wrapped in its own cache.
    pub fn new(
        backend: Arc<Backend>,
        storage: Arc<dyn ObjectStorage>,
        monitor: Arc<dyn Monitor>,
        cache: CacheSettings,
        log_transactions: bool,
    ) -> Self {
        let coordinator = TransactionCoordinator::new(backend.clone(), monitor)
            .with_transaction_logging(log_transactions);
        Self::with_coordinator(backend, storage, Arc::new(coordinator), cache)
    }

    /// Like [`ServiceFactory::new`] but with a caller-built coordinator, so
    /// tests can swap the retry policy.
    pub fn with_coordinator(
        backend: Arc<Backend>,
        storage: Arc<dyn ObjectStorage>,
        coordinator: Arc<TransactionCoordinator>,
        cache: CacheSettings,
    ) -> Self {
        let repos = Repositories {
            items: cached(&backend, &cache),
            purchases: cached(&backend, &cache),
            sales: cached(&backend, &cache),
            assets: cached(&backend, &cache),
            relationships: RelationshipRepository::new(cached(&backend, &cache)),
        };
        Self {
            backend,
            storage,
            coordinator,
            repos,
        }
    }

    /// Builds a factory from the registry's default providers.
    pub fn from_registry(registry: &ProviderRegistry, config: &AppConfig) -> Result<Self, ServiceError> {
        Ok(Self::new(
            registry.default_database()?,
            registry.default_storage()?,
            registry.monitor(),
            registry.cache_settings(),
            config.enable_transaction_logging,
        ))
    }

    /// Replaces the coordinator's retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        let coordinator = TransactionCoordinator::clone(&self.coordinator).with_retry_policy(policy);
        self.coordinator = Arc::new(coordinator);
        self
    }

    pub fn inventory_service(&self) -> InventoryService {
        InventoryService::new(self.repos.items.clone())
    }

    pub fn relationship_service(&self) -> RelationshipService {
        RelationshipService::new(self.repos.clone(), self.coordinator.clone())
    }

    pub fn derivation_service(&self) -> DerivationService {
        DerivationService::new(self.repos.clone(), self.coordinator.clone())
    }

    pub fn purchase_service(&self) -> PurchaseService {
        PurchaseService::new(
            self.repos.clone(),
            self.inventory_service(),
            self.relationship_service(),
            self.coordinator.clone(),
        )
    }

    pub fn sale_service(&self) -> SaleService {
        SaleService::new(
            self.repos.clone(),
            self.inventory_service(),
            self.relationship_service(),
            self.coordinator.clone(),
        )
    }

    pub fn item_service(&self) -> ItemService {
        ItemService::new(
            self.repos.clone(),
            self.relationship_service(),
            self.storage.clone(),
            self.coordinator.clone(),
        )
    }

    pub fn asset_service(&self) -> AssetService {
        AssetService::new(self.repos.clone(), self.relationship_service(), self.coordinator.clone())
    }

    /// Gets a reference to the database backend
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }
}

/// Service container holding all service instances
#[derive(Clone)]
pub struct ServiceContainer {
    pub backend: Arc<Backend>,
    pub coordinator: Arc<TransactionCoordinator>,
    pub repos: Repositories,
    pub inventory: Arc<InventoryService>,
    pub relationships: Arc<RelationshipService>,
    pub derivation: Arc<DerivationService>,
    pub purchases: Arc<PurchaseService>,
    pub sales: Arc<SaleService>,
    pub items: Arc<ItemService>,
    pub assets: Arc<AssetService>,
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl ServiceContainer {
    /// Creates a new service container with all services initialized
    pub fn new(factory: &ServiceFactory) -> Self {
        Self {
            backend: factory.backend.clone(),
            coordinator: factory.coordinator.clone(),
            repos: factory.repos.clone(),
            inventory: Arc::new(factory.inventory_service()),
            relationships: Arc::new(factory.relationship_service()),
            derivation: Arc::new(factory.derivation_service()),
            purchases: Arc::new(factory.purchase_service()),
            sales: Arc::new(factory.sale_service()),
            items: Arc::new(factory.item_service()),
            assets: Arc::new(factory.asset_service()),
        }
    }
}
