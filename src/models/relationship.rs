use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumIter, EnumString};

use super::{Axis, Entity, Measurements};
use crate::schema::{definitions, EntitySchema};

/// Entity kinds that can sit at either end of a relationship.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum EntityType {
    Item,
    Purchase,
    Sale,
    Asset,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RelationshipType {
    PurchaseItem,
    PurchaseAsset,
    SaleItem,
    ProductMaterial,
    Derived,
    ParentChild,
    Associated,
}

/// Permitted `(primary, secondary)` endpoint types per relationship type.
///
/// Every write path validates against this table.
pub fn is_valid_entity_combination(
    relationship_type: RelationshipType,
    primary_type: EntityType,
    secondary_type: EntityType,
) -> bool {
    use EntityType::*;
    use RelationshipType::*;

    match relationship_type {
        PurchaseItem => primary_type == Purchase && secondary_type == Item,
        PurchaseAsset => primary_type == Purchase && secondary_type == Asset,
        SaleItem => primary_type == Sale && secondary_type == Item,
        ProductMaterial | Derived => primary_type == Item && secondary_type == Item,
        ParentChild | Associated => true,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseItemAttributes {
    #[serde(default)]
    pub cost_per_unit: Decimal,
    #[serde(default)]
    pub total_cost: Decimal,
    #[serde(default)]
    pub purchased_by: Axis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleItemAttributes {
    #[serde(default)]
    pub price_at_sale: Decimal,
    #[serde(default)]
    pub sold_by: Axis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseAssetAttributes {
    #[serde(default)]
    pub acquisition_cost: Decimal,
    #[serde(default)]
    pub asset_tag: Option<String>,
}

/// Directed, typed edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    #[serde(default)]
    pub id: String,
    pub primary_id: String,
    pub primary_type: EntityType,
    pub secondary_id: String,
    pub secondary_type: EntityType,
    pub relationship_type: RelationshipType,
    #[serde(default)]
    pub measurements: Measurements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_item_attributes: Option<PurchaseItemAttributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sale_item_attributes: Option<SaleItemAttributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_asset_attributes: Option<PurchaseAssetAttributes>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub is_legacy: bool,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        primary: (&str, EntityType),
        secondary: (&str, EntityType),
        relationship_type: RelationshipType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            primary_id: primary.0.to_string(),
            primary_type: primary.1,
            secondary_id: secondary.0.to_string(),
            secondary_type: secondary.1,
            relationship_type,
            measurements: Measurements::default(),
            purchase_item_attributes: None,
            sale_item_attributes: None,
            purchase_asset_attributes: None,
            metadata: Map::new(),
            is_legacy: false,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_measurements(mut self, measurements: Measurements) -> Self {
        self.measurements = measurements;
        self
    }

    pub fn is_valid_combination(&self) -> bool {
        is_valid_entity_combination(self.relationship_type, self.primary_type, self.secondary_type)
    }

    /// Identity tuple that must be unique across the collection.
    pub fn unique_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.primary_id,
            self.primary_type,
            self.secondary_id,
            self.secondary_type,
            self.relationship_type
        )
    }

    /// The endpoint opposite to `id`, if `id` is one of the two endpoints.
    pub fn other_end(&self, id: &str) -> Option<(&str, EntityType)> {
        if self.primary_id == id {
            Some((&self.secondary_id, self.secondary_type))
        } else if self.secondary_id == id {
            Some((&self.primary_id, self.primary_type))
        } else {
            None
        }
    }
}

impl Entity for Relationship {
    fn schema() -> &'static EntitySchema {
        &definitions::RELATIONSHIP_SCHEMA
    }

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn fixed_combinations_only_accept_their_pair() {
        use EntityType::*;
        assert!(is_valid_entity_combination(RelationshipType::PurchaseItem, Purchase, Item));
        assert!(!is_valid_entity_combination(RelationshipType::PurchaseItem, Item, Purchase));
        assert!(is_valid_entity_combination(RelationshipType::PurchaseAsset, Purchase, Asset));
        assert!(!is_valid_entity_combination(RelationshipType::PurchaseAsset, Purchase, Item));
        assert!(is_valid_entity_combination(RelationshipType::SaleItem, Sale, Item));
        assert!(!is_valid_entity_combination(RelationshipType::SaleItem, Purchase, Item));
        assert!(is_valid_entity_combination(RelationshipType::Derived, Item, Item));
        assert!(!is_valid_entity_combination(RelationshipType::ProductMaterial, Item, Asset));
    }

    #[test]
    fn open_relationship_types_accept_every_pair() {
        for primary in EntityType::iter() {
            for secondary in EntityType::iter() {
                assert!(is_valid_entity_combination(RelationshipType::ParentChild, primary, secondary));
                assert!(is_valid_entity_combination(RelationshipType::Associated, primary, secondary));
            }
        }
    }

    #[test]
    fn wire_names_match_the_relationship_vocabulary() {
        let rel = Relationship::new(
            ("p1", EntityType::Purchase),
            ("i1", EntityType::Item),
            RelationshipType::PurchaseItem,
        );
        let value = serde_json::to_value(&rel).unwrap();
        assert_eq!(value["relationshipType"], "purchase_item");
        assert_eq!(value["primaryType"], "Purchase");
        assert_eq!(rel.unique_key(), "p1|Purchase|i1|Item|purchase_item");
        assert_eq!(rel.other_end("i1"), Some(("p1", EntityType::Purchase)));
    }
}
