use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::{Axis, Entity, Measurements};
use crate::schema::{definitions, EntitySchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ItemType {
    #[default]
    Material,
    Product,
    Both,
}

impl ItemType {
    /// Products (and dual-use items) are assembled from components.
    pub fn has_components(&self) -> bool {
        matches!(self, ItemType::Product | ItemType::Both)
    }
}

/// One entry of a product's bill of materials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub item: String,
    #[serde(default)]
    pub quantity: f64,
}

/// Carve record linking a derived item and its source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedRef {
    pub item: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl DerivedRef {
    pub fn carved(item: impl Into<String>, axis: Axis, amount: f64, unit: Option<String>) -> Self {
        let mut carve = Self {
            item: item.into(),
            unit,
            ..Default::default()
        };
        match axis {
            Axis::Quantity => carve.quantity = Some(amount),
            Axis::Weight => carve.weight = Some(amount),
            Axis::Length => carve.length = Some(amount),
            Axis::Area => carve.area = Some(amount),
            Axis::Volume => carve.volume = Some(amount),
        }
        carve
    }

    pub fn amount(&self, axis: Axis) -> Option<f64> {
        match axis {
            Axis::Quantity => self.quantity,
            Axis::Weight => self.weight,
            Axis::Length => self.length,
            Axis::Area => self.area,
            Axis::Volume => self.volume,
        }
    }
}

/// A tracked good or material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// Auto-generated as a zero-padded sequence number when absent.
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub item_type: ItemType,
    /// Authoritative axis; `quantity` when unset.
    #[serde(default)]
    pub tracking_type: Option<Axis>,
    #[serde(flatten)]
    pub measurements: Measurements,
    #[serde(default)]
    pub cost: Decimal,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub used_in_products: Vec<String>,
    /// Legacy embedded links, read only by relationship conversion.
    #[serde(default)]
    pub related_items: Vec<String>,
    #[serde(default)]
    pub derived_from: Option<DerivedRef>,
    #[serde(default)]
    pub derived_items: Vec<DerivedRef>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Item {
    /// Minimal material item; the remaining fields take their defaults.
    pub fn new(name: impl Into<String>, tracking_type: Axis) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: name.into(),
            sku: None,
            category: None,
            tags: BTreeSet::new(),
            item_type: ItemType::Material,
            tracking_type: Some(tracking_type),
            measurements: Measurements::default(),
            cost: Decimal::ZERO,
            price: Decimal::ZERO,
            image_url: None,
            components: Vec::new(),
            used_in_products: Vec::new(),
            related_items: Vec::new(),
            derived_from: None,
            derived_items: Vec::new(),
            created_at: now,
            updated_at: now,
            last_updated: None,
        }
    }

    pub fn with_measurement(mut self, axis: Axis, value: f64) -> Self {
        self.measurements.set(axis, value);
        self
    }

    pub fn axis(&self) -> Axis {
        self.tracking_type.unwrap_or_default()
    }

    pub fn component_ids(&self) -> Vec<String> {
        self.components.iter().map(|c| c.item.clone()).collect()
    }
}

impl Entity for Item {
    fn schema() -> &'static EntitySchema {
        &definitions::ITEM_SCHEMA
    }

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn item_measurements_flatten_into_the_record() {
        let item = Item::new("Oak plank", Axis::Length).with_measurement(Axis::Length, 12.5);
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["length"], json!(12.5));
        assert_eq!(value["trackingType"], json!("length"));
        assert!(value.get("measurements").is_none());
    }

    #[test]
    fn item_deserializes_from_sparse_json() {
        let item: Item = serde_json::from_value(json!({
            "name": "Flour",
            "trackingType": "weight",
            "weight": 10,
            "weightUnit": "lb",
            "cost": 2.5
        }))
        .unwrap();
        assert_eq!(item.axis(), Axis::Weight);
        assert_eq!(item.measurements.weight, 10.0);
        assert_eq!(item.measurements.unit(Axis::Weight), Some("lb"));
        assert_eq!(item.cost, Decimal::new(25, 1));
        assert_eq!(item.item_type, ItemType::Material);
    }

    #[test]
    fn unset_tracking_type_means_quantity() {
        let item: Item = serde_json::from_value(json!({"name": "Widget"})).unwrap();
        assert_eq!(item.axis(), Axis::Quantity);
    }
}
