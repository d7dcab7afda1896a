//! Business services.
//!
//! The inventory, relationship and derivation engines work on a transaction
//! handle supplied by their caller. The purchase, sale, item and asset controllers
//! open that transaction and orchestrate the engines inside it.

pub mod assets;
pub mod derivation;
pub mod factory;
pub mod inventory;
pub mod items;
pub mod purchases;
pub mod relationships;
pub mod sales;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::ServiceError;
use crate::models::{Asset, Item, Purchase, Relationship, Sale};
use crate::repositories::{RelationshipRepository, SharedRepository};

pub use assets::AssetService;
pub use derivation::{DerivationResult, DerivationService, DerivedItemSpec};
pub use factory::{ServiceContainer, ServiceFactory};
pub use inventory::{GroupOutcome, InventoryResult, InventoryService};
pub use items::ItemService;
pub use purchases::PurchaseService;
pub use relationships::{ConversionReport, EdgeDiff, EdgeKind, RebuildReport, RelationshipService};
pub use sales::SaleService;

/// Repositories every service draws from.
#[derive(Clone)]
pub struct Repositories {
    pub items: SharedRepository<Item>,
    pub purchases: SharedRepository<Purchase>,
    pub sales: SharedRepository<Sale>,
    pub assets: SharedRepository<Asset>,
    pub relationships: RelationshipRepository,
}

impl std::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repositories").finish_non_exhaustive()
    }
}

impl Repositories {
    pub fn relationship_store(&self) -> &SharedRepository<Relationship> {
        self.relationships.store()
    }
}

/// Create, update and delete for entities whose writes also touch stock
/// levels and relationships. Each call runs in one transaction.
#[async_trait]
pub trait RelationshipAwareController: Send + Sync {
    type Entity: DeserializeOwned + serde::Serialize + Send + Sync;

    async fn create(&self, entity: Self::Entity) -> Result<Self::Entity, ServiceError>;

    async fn update(&self, id: &str, patch: Value) -> Result<Self::Entity, ServiceError>;

    async fn delete(&self, id: &str) -> Result<bool, ServiceError>;
}

/// Drops server-managed fields from a client patch.
pub(crate) fn strip_fields(patch: &mut Value, fields: &[&str]) {
    if let Value::Object(map) = patch {
        for field in fields {
            map.remove(*field);
        }
    }
}
