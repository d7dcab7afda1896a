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
pub enum SaleStatus {
    #[default]
    Completed,
    Refunded,
    PartiallyRefunded,
}

impl SaleStatus {
    /// A full refund returns every line to stock; a partial refund keeps the
    /// sale applied and expresses returned goods through line edits.
    pub fn applies_inventory(&self) -> bool {
        matches!(self, SaleStatus::Completed | SaleStatus::PartiallyRefunded)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default)]
    #[validate(email)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleLine {
    #[serde(default)]
    pub item: Option<String>,
    #[serde(flatten)]
    pub measurements: Measurements,
    #[serde(default)]
    pub price_at_sale: Decimal,
    #[serde(default)]
    pub sold_by: Axis,
}

impl SaleLine {
    pub fn new(item: impl Into<String>, axis: Axis, amount: f64, price_at_sale: Decimal) -> Self {
        let mut measurements = Measurements::default();
        measurements.set(axis, amount);
        Self {
            item: Some(item.into()),
            measurements,
            price_at_sale,
            sold_by: axis,
        }
    }
}

/// A customer transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    #[serde(default)]
    pub id: String,
    #[validate]
    pub customer: Customer,
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default = "Utc::now")]
    pub sale_date: DateTime<Utc>,
    #[serde(default)]
    pub items: Vec<SaleLine>,
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
    pub status: SaleStatus,
    #[serde(default)]
    pub inventory_applied: bool,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Sale {
    pub fn new(customer: impl Into<String>, status: SaleStatus, items: Vec<SaleLine>) -> Self {
        let subtotal: Decimal = items
            .iter()
            .map(|line| {
                Decimal::try_from(line.measurements.get(line.sold_by)).unwrap_or_default()
                    * line.price_at_sale
            })
            .sum();
        let now = Utc::now();
        Self {
            id: String::new(),
            customer: Customer {
                name: customer.into(),
                ..Default::default()
            },
            invoice_number: None,
            sale_date: now,
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

    pub fn item_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for id in self.items.iter().filter_map(|l| l.item.clone()) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

impl Entity for Sale {
    fn schema() -> &'static EntitySchema {
        &definitions::SALE_SCHEMA
    }

    fn id(&self) -> &str {
        &self.id
    }
}
