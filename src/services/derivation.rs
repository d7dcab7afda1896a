//! Derivation engine: carving child items out of a source item.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument};

use super::relationships::derived_edge;
use super::Repositories;
use crate::db::{TransactionCoordinator, TransactionHandle, TransactionOptions};
use crate::errors::ServiceError;
use crate::models::{add_amounts, subtract_amounts, Axis, DerivedRef, Item, ItemType, Measurements};

/// One child to carve. Only the amount on the source's tracking axis counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedItemSpec {
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub length: Option<f64>,
    #[serde(default)]
    pub area: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub price: Option<Decimal>,
}

impl DerivedItemSpec {
    pub fn of(axis: Axis, amount: f64) -> Self {
        let mut spec = Self::default();
        match axis {
            Axis::Quantity => spec.quantity = Some(amount),
            Axis::Weight => spec.weight = Some(amount),
            Axis::Length => spec.length = Some(amount),
            Axis::Area => spec.area = Some(amount),
            Axis::Volume => spec.volume = Some(amount),
        }
        spec
    }

    pub fn amount(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Quantity => self.quantity,
            Axis::Weight => self.weight,
            Axis::Length => self.length,
            Axis::Area => self.area,
            Axis::Volume => self.volume,
        }
        .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivationResult {
    pub source: Item,
    pub derived: Vec<Item>,
}

#[derive(Clone)]
pub struct DerivationService {
    repos: Repositories,
    coordinator: Arc<TransactionCoordinator>,
}

impl std::fmt::Debug for DerivationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivationService").finish_non_exhaustive()
    }
}

impl DerivationService {
    pub fn new(repos: Repositories, coordinator: Arc<TransactionCoordinator>) -> Self {
        Self { repos, coordinator }
    }

    /// Creates one child per spec and takes the carved amounts off the source.
    ///
    /// Fails with `InsufficientSource` before writing anything when the
    /// specs ask for more than the source holds on its tracking axis.
    #[instrument(skip(self, specs, txn), fields(children = specs.len()))]
    pub async fn create_derived_items(
        &self,
        source_id: &str,
        specs: Vec<DerivedItemSpec>,
        txn: Option<&TransactionHandle>,
    ) -> Result<DerivationResult, ServiceError> {
        let this = self.clone();
        let source_id = source_id.to_string();
        let specs = Arc::new(specs);
        self.coordinator
            .with_transaction_in(txn, TransactionOptions::retrying("items.derive"), move |txn| {
                let this = this.clone();
                let source_id = source_id.clone();
                let specs = specs.clone();
                async move { this.derive(&source_id, &specs, &txn).await }
            })
            .await
    }

    async fn derive(
        &self,
        source_id: &str,
        specs: &[DerivedItemSpec],
        txn: &TransactionHandle,
    ) -> Result<DerivationResult, ServiceError> {
        let source = self
            .repos
            .items
            .find_by_id_in(source_id, Some(txn))
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Item {} not found", source_id)))?;

        if specs.is_empty() {
            return Err(ServiceError::ValidationError("at least one derived item is required".into()));
        }
        let axis = source.axis();
        if let Some(bad) = specs.iter().map(|s| s.amount(axis)).find(|a| !(*a > 0.0) || !a.is_finite()) {
            return Err(ServiceError::ValidationError(format!(
                "each derived item must carve a positive {}, got {}",
                axis, bad
            )));
        }

        let requested = specs.iter().map(|s| s.amount(axis)).reduce(add_amounts).unwrap_or(0.0);
        let available = source.measurements.get(axis);
        if requested > available {
            return Err(ServiceError::InsufficientSource {
                axis,
                requested,
                available,
            });
        }

        let unit = source.measurements.unit(axis).map(str::to_string);
        let mut derived = Vec::with_capacity(specs.len());
        let mut carves = source.derived_items.clone();
        let mut remaining = available;
        let offset = source.derived_items.len();

        for (index, spec) in specs.iter().enumerate() {
            let amount = spec.amount(axis);
            let child = self.build_child(&source, spec, axis, amount, unit.clone(), offset + index + 1);
            let child = self.repos.items.create(child, Some(txn)).await?;

            self.repos
                .relationships
                .create(
                    derived_edge(&source.id, &child.id, axis, amount, unit.clone()),
                    Some(txn),
                )
                .await?;

            carves.push(DerivedRef::carved(&child.id, axis, amount, unit.clone()));
            remaining = subtract_amounts(remaining, amount);
            derived.push(child);
        }

        let patch = json!({
            axis.field(): remaining.max(0.0),
            "derivedItems": carves,
            "lastUpdated": Utc::now(),
        });
        let source = self.repos.items.update(&source.id, patch, Some(txn)).await?;

        info!(
            source_id = %source.id,
            axis = %axis,
            requested,
            remaining,
            children = derived.len(),
            "Derived items created"
        );
        Ok(DerivationResult { source, derived })
    }

    fn build_child(
        &self,
        source: &Item,
        spec: &DerivedItemSpec,
        axis: Axis,
        amount: f64,
        unit: Option<String>,
        ordinal: usize,
    ) -> Item {
        let name = spec
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("{} (derived {})", source.name, ordinal));
        let mut child = Item::new(name, axis);
        child.sku = spec.sku.clone();
        child.category = source.category.clone();
        child.tags = source.tags.clone();
        child.item_type = ItemType::Material;
        child.measurements = Measurements::single(axis, amount, unit.clone()).with_units_of(&source.measurements);
        child.cost = source.cost;
        child.price = spec.price.unwrap_or(source.price);
        child.derived_from = Some(DerivedRef::carved(&source.id, axis, amount, unit));
        child
    }
}

/// Derivation specs arrive either as a bare array or as `{ "items": [...] }`.
pub fn parse_specs(body: Value) -> Result<Vec<DerivedItemSpec>, ServiceError> {
    let list = match body {
        Value::Object(mut map) => map.remove("items").or_else(|| map.remove("derivedItems")).unwrap_or(Value::Null),
        other => other,
    };
    serde_json::from_value(list)
        .map_err(|e| ServiceError::ValidationError(format!("invalid derivation request: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_amount_reads_the_requested_axis() {
        let spec = DerivedItemSpec::of(Axis::Weight, 4.0);
        assert_eq!(spec.amount(Axis::Weight), 4.0);
        assert_eq!(spec.amount(Axis::Quantity), 0.0);
    }

    #[test]
    fn specs_parse_from_either_shape() {
        let bare = parse_specs(json!([{"weight": 4}, {"weight": 3, "name": "Offcut"}])).unwrap();
        assert_eq!(bare.len(), 2);
        assert_eq!(bare[1].name.as_deref(), Some("Offcut"));

        let wrapped = parse_specs(json!({"items": [{"quantity": 1}]})).unwrap();
        assert_eq!(wrapped[0].quantity, Some(1.0));

        assert!(parse_specs(json!({"items": "nope"})).is_err());
    }
}
