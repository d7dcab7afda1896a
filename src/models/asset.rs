use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Entity;
use crate::schema::{definitions, EntitySchema};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceRecord {
    pub date: DateTime<Utc>,
    pub description: String,
    #[serde(default)]
    pub cost: Decimal,
}

/// A durable good bought for the business rather than for resale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// `AST-000001` style tag drawn from a monotonic counter.
    #[serde(default)]
    pub asset_tag: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub acquisition_cost: Decimal,
    #[serde(default)]
    pub acquisition_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub maintenance_records: Vec<MaintenanceRecord>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub source_purchase: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Asset {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: name.into(),
            asset_tag: None,
            category: None,
            location: None,
            acquisition_cost: Decimal::ZERO,
            acquisition_date: None,
            maintenance_records: Vec::new(),
            image_url: None,
            source_purchase: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Asset {
    fn schema() -> &'static EntitySchema {
        &definitions::ASSET_SCHEMA
    }

    fn id(&self) -> &str {
        &self.id
    }
}
