use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use validator::Validate;

use super::{Axis, Entity, Measurements};
use crate::schema::{definitions, EntitySchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PurchaseStatus {
    #[default]
    Pending,
    Received,
    PartiallyReceived,
    Cancelled,
}

impl PurchaseStatus {
    /// Only goods that arrived count towards stock.
    pub fn applies_inventory(&self) -> bool {
        matches!(self, PurchaseStatus::Received | PurchaseStatus::PartiallyReceived)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PurchaseType {
    #[default]
    Inventory,
    Asset,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Supplier {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    #[validate(email)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseLine {
    /// Referenced item; lines without one are skipped by inventory.
    #[serde(default)]
    pub item: Option<String>,
    #[serde(flatten)]
    pub measurements: Measurements,
    #[serde(default)]
    pub cost_per_unit: Decimal,
    #[serde(default)]
    pub total_cost: Decimal,
    #[serde(default)]
    pub purchased_by: Axis,
    #[serde(default)]
    pub purchase_type: PurchaseType,
    /// Asset created from this line, written back once recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_category: Option<String>,
}

impl PurchaseLine {
    pub fn inventory(item: impl Into<String>, axis: Axis, amount: f64, cost_per_unit: Decimal) -> Self {
        let mut measurements = Measurements::default();
        measurements.set(axis, amount);
        let total_cost = Decimal::try_from(amount).unwrap_or_default() * cost_per_unit;
        Self {
            item: Some(item.into()),
            measurements,
            cost_per_unit,
            total_cost,
            purchased_by: axis,
            ..Default::default()
        }
    }

    pub fn is_asset(&self) -> bool {
        self.purchase_type == PurchaseType::Asset
    }
}

/// A supplier transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    #[serde(default)]
    pub id: String,
    #[validate]
    pub supplier: Supplier,
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default = "Utc::now")]
    pub purchase_date: DateTime<Utc>,
    #[serde(default)]
    pub items: Vec<PurchaseLine>,
    #[serde(default)]
    pub subtotal: Decimal,
    #[serde(default)]
    pub tax_rate: Decimal,
    #[serde(default)]
    pub tax_amount: Decimal,
    #[serde(default)]
    pub shipping_cost: Decimal,
    #[serde(default)]
    pub total: Decimal,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub status: PurchaseStatus,
    /// Set once the lines have been folded into stock.
    #[serde(default)]
    pub inventory_applied: bool,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Purchase {
    pub fn new(supplier: impl Into<String>, status: PurchaseStatus, items: Vec<PurchaseLine>) -> Self {
        let subtotal = items.iter().map(|line| line.total_cost).sum();
        let now = Utc::now();
        Self {
            id: String::new(),
            supplier: Supplier {
                name: supplier.into(),
                ..Default::default()
            },
            invoice_number: None,
            purchase_date: now,
            items,
            subtotal,
            tax_rate: Decimal::ZERO,
            tax_amount: Decimal::ZERO,
            shipping_cost: Decimal::ZERO,
            total: subtotal,
            payment_method: None,
            status,
            inventory_applied: false,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn inventory_lines(&self) -> Vec<PurchaseLine> {
        self.items.iter().filter(|l| !l.is_asset()).cloned().collect()
    }

    pub fn item_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for id in self.items.iter().filter(|l| !l.is_asset()).filter_map(|l| l.item.clone()) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    pub fn asset_ids(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|l| l.is_asset())
            .filter_map(|l| l.asset.clone())
            .collect()
    }
}

impl Entity for Purchase {
    fn schema() -> &'static EntitySchema {
        &definitions::PURCHASE_SCHEMA
    }

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn status_controls_inventory_application() {
        assert!(!PurchaseStatus::Pending.applies_inventory());
        assert!(!PurchaseStatus::Cancelled.applies_inventory());
        assert!(PurchaseStatus::Received.applies_inventory());
        assert!(PurchaseStatus::PartiallyReceived.applies_inventory());
        assert_eq!(PurchaseStatus::PartiallyReceived.to_string(), "partially_received");
    }

    #[test]
    fn asset_lines_are_excluded_from_inventory_lines() {
        let mut asset = PurchaseLine::inventory("ignored", Axis::Quantity, 1.0, dec!(900));
        asset.purchase_type = PurchaseType::Asset;
        asset.item = None;
        let purchase = Purchase::new(
            "Acme",
            PurchaseStatus::Received,
            vec![PurchaseLine::inventory("a", Axis::Quantity, 3.0, dec!(5)), asset],
        );
        assert_eq!(purchase.inventory_lines().len(), 1);
        assert_eq!(purchase.item_ids(), vec!["a".to_string()]);
        assert_eq!(purchase.subtotal, dec!(915));
    }

    #[test]
    fn supplier_email_is_validated() {
        let supplier = Supplier {
            name: "Acme".into(),
            email: Some("not-an-email".into()),
            ..Default::default()
        };
        assert!(supplier.validate().is_err());
    }
}
