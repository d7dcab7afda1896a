use serde::{Deserialize, Serialize};

use super::Entity;
use crate::schema::{definitions, EntitySchema};

/// Named monotonic sequence (sku codes, asset tags).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counter {
    pub id: String,
    pub value: u64,
}

impl Entity for Counter {
    fn schema() -> &'static EntitySchema {
        &definitions::COUNTER_SCHEMA
    }

    fn id(&self) -> &str {
        &self.id
    }
}
