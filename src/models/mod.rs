//! Domain records. Every persisted model implements [`Entity`], which ties it
//! to its schema declaration.

pub mod asset;
pub mod counter;
pub mod item;
pub mod measurement;
pub mod purchase;
pub mod relationship;
pub mod sale;

use serde::{de::DeserializeOwned, Serialize};

use crate::schema::EntitySchema;

pub use asset::{Asset, MaintenanceRecord};
pub use counter::Counter;
pub use item::{Component, DerivedRef, Item, ItemType};
pub use measurement::{add_amounts, subtract_amounts, to_decimal, Axis, Measurements};
pub use purchase::{Purchase, PurchaseLine, PurchaseStatus, PurchaseType, Supplier};
pub use relationship::{
    is_valid_entity_combination, EntityType, PurchaseAssetAttributes, PurchaseItemAttributes,
    Relationship, RelationshipType, SaleItemAttributes,
};
pub use sale::{Customer, Sale, SaleLine, SaleStatus};

/// A persisted record with a declared schema.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn schema() -> &'static EntitySchema;

    fn id(&self) -> &str;
}
