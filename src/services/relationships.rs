//! Relationship engine: edge diffs, lifecycle cleanup, legacy conversion and
//! maintenance rebuilds over the relationship collection.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::Repositories;
use crate::db::{Filter, TransactionCoordinator, TransactionHandle, TransactionOptions};
use crate::errors::ServiceError;
use crate::models::{
    Asset, Axis, EntityType, Item, Measurements, Purchase, PurchaseAssetAttributes, PurchaseItemAttributes,
    PurchaseLine, Relationship, RelationshipType, Sale, SaleItemAttributes,
};
use crate::repositories::{
    EntityRelationships, FindOptions, RelationshipRepository, RelationshipStatistics,
};

/// The three types that identify a family of edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeKind {
    pub primary_type: EntityType,
    pub secondary_type: EntityType,
    pub relationship_type: RelationshipType,
}

impl EdgeKind {
    pub const PURCHASE_ITEM: EdgeKind = EdgeKind::new(
        EntityType::Purchase,
        EntityType::Item,
        RelationshipType::PurchaseItem,
    );
    pub const PURCHASE_ASSET: EdgeKind = EdgeKind::new(
        EntityType::Purchase,
        EntityType::Asset,
        RelationshipType::PurchaseAsset,
    );
    pub const SALE_ITEM: EdgeKind = EdgeKind::new(EntityType::Sale, EntityType::Item, RelationshipType::SaleItem);
    pub const PRODUCT_MATERIAL: EdgeKind = EdgeKind::new(
        EntityType::Item,
        EntityType::Item,
        RelationshipType::ProductMaterial,
    );
    pub const DERIVED: EdgeKind = EdgeKind::new(EntityType::Item, EntityType::Item, RelationshipType::Derived);
    pub const ASSOCIATED_ITEMS: EdgeKind = EdgeKind::new(
        EntityType::Item,
        EntityType::Item,
        RelationshipType::Associated,
    );

    pub const fn new(
        primary_type: EntityType,
        secondary_type: EntityType,
        relationship_type: RelationshipType,
    ) -> Self {
        Self {
            primary_type,
            secondary_type,
            relationship_type,
        }
    }

    /// A bare edge of this kind.
    pub fn edge(&self, primary_id: &str, secondary_id: &str) -> Relationship {
        Relationship::new(
            (primary_id, self.primary_type),
            (secondary_id, self.secondary_type),
            self.relationship_type,
        )
    }
}

/// Outcome of one edge-diff run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDiff {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReport {
    pub converted: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    pub examined: usize,
    pub created: usize,
    pub failed: usize,
}

/// `purchase_item` edges for a purchase, one per referenced item, carrying
/// the summed line measurements.
pub fn purchase_item_edges(purchase: &Purchase) -> Vec<Relationship> {
    let mut edges: Vec<Relationship> = Vec::new();
    for line in purchase.items.iter().filter(|l| !l.is_asset()) {
        let Some(item_id) = line.item.as_deref().filter(|id| !id.trim().is_empty()) else {
            continue;
        };
        match edges.iter_mut().find(|e| e.secondary_id == item_id) {
            Some(edge) => {
                add_measurements(&mut edge.measurements, &line.measurements);
                if let Some(attrs) = edge.purchase_item_attributes.as_mut() {
                    attrs.total_cost += line.total_cost;
                    attrs.cost_per_unit = attrs.cost_per_unit.max(line.cost_per_unit);
                }
            }
            None => {
                let mut edge = EdgeKind::PURCHASE_ITEM
                    .edge(&purchase.id, item_id)
                    .with_measurements(line.measurements.clone());
                edge.purchase_item_attributes = Some(PurchaseItemAttributes {
                    cost_per_unit: line.cost_per_unit,
                    total_cost: line.total_cost,
                    purchased_by: line.purchased_by,
                });
                edges.push(edge);
            }
        }
    }
    edges
}

/// `sale_item` edges for a sale, one per referenced item.
pub fn sale_item_edges(sale: &Sale) -> Vec<Relationship> {
    let mut edges: Vec<Relationship> = Vec::new();
    for line in &sale.items {
        let Some(item_id) = line.item.as_deref().filter(|id| !id.trim().is_empty()) else {
            continue;
        };
        match edges.iter_mut().find(|e| e.secondary_id == item_id) {
            Some(edge) => add_measurements(&mut edge.measurements, &line.measurements),
            None => {
                let mut edge = EdgeKind::SALE_ITEM
                    .edge(&sale.id, item_id)
                    .with_measurements(line.measurements.clone());
                edge.sale_item_attributes = Some(SaleItemAttributes {
                    price_at_sale: line.price_at_sale,
                    sold_by: line.sold_by,
                });
                edges.push(edge);
            }
        }
    }
    edges
}

/// `product_material` edges from a product to each of its components.
pub fn component_edges(item: &Item) -> Vec<Relationship> {
    let mut edges: Vec<Relationship> = Vec::new();
    for component in &item.components {
        if component.item.trim().is_empty() || edges.iter().any(|e| e.secondary_id == component.item) {
            continue;
        }
        let mut measurements = Measurements::default();
        measurements.quantity = component.quantity;
        edges.push(
            EdgeKind::PRODUCT_MATERIAL
                .edge(&item.id, &component.item)
                .with_measurements(measurements),
        );
    }
    edges
}

/// `derived` edge from a source item to a child carved out of it.
pub fn derived_edge(source_id: &str, child_id: &str, axis: Axis, amount: f64, unit: Option<String>) -> Relationship {
    EdgeKind::DERIVED
        .edge(source_id, child_id)
        .with_measurements(Measurements::single(axis, amount, unit))
}

fn add_measurements(total: &mut Measurements, more: &Measurements) {
    use crate::models::add_amounts;
    total.quantity = add_amounts(total.quantity, more.quantity);
    total.weight = add_amounts(total.weight, more.weight);
    total.length = add_amounts(total.length, more.length);
    total.area = add_amounts(total.area, more.area);
    total.volume = add_amounts(total.volume, more.volume);
}

#[derive(Clone)]
pub struct RelationshipService {
    repos: Repositories,
    coordinator: Arc<TransactionCoordinator>,
}

impl std::fmt::Debug for RelationshipService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationshipService")
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl RelationshipService {
    pub fn new(repos: Repositories, coordinator: Arc<TransactionCoordinator>) -> Self {
        Self { repos, coordinator }
    }

    pub fn repository(&self) -> &RelationshipRepository {
        &self.repos.relationships
    }

    pub async fn create(
        &self,
        relationship: Relationship,
        txn: Option<&TransactionHandle>,
    ) -> Result<Relationship, ServiceError> {
        self.repos.relationships.create(relationship, txn).await
    }

    /// Brings the edges of one kind leaving `anchor_id` in line with `desired`.
    ///
    /// Edges to ids in `old` but not in `desired` are deleted, missing edges
    /// are created and existing edges whose measurements or attributes
    /// changed are updated. Running it twice with the same arguments
    /// changes nothing the second time.
    #[instrument(skip(self, old, desired, txn), fields(relationship_type = %kind.relationship_type))]
    pub async fn update_relationships(
        &self,
        kind: EdgeKind,
        anchor_id: &str,
        old: &[String],
        desired: &[Relationship],
        txn: &TransactionHandle,
    ) -> Result<EdgeDiff, ServiceError> {
        let relationships = &self.repos.relationships;
        let mut diff = EdgeDiff::default();

        for removed in old
            .iter()
            .filter(|id| !desired.iter().any(|edge| &edge.secondary_id == *id))
        {
            let existing = relationships
                .find_by_tuple(
                    (anchor_id, kind.primary_type),
                    (removed, kind.secondary_type),
                    kind.relationship_type,
                    Some(txn),
                )
                .await?;
            if let Some(edge) = existing {
                if relationships.delete(&edge.id, Some(txn)).await? {
                    diff.deleted += 1;
                }
            }
        }

        for edge in desired {
            let existing = relationships
                .find_by_tuple(
                    (anchor_id, kind.primary_type),
                    (&edge.secondary_id, kind.secondary_type),
                    kind.relationship_type,
                    Some(txn),
                )
                .await?;
            match existing {
                None => {
                    let mut edge = edge.clone();
                    edge.primary_id = anchor_id.to_string();
                    relationships.create(edge, Some(txn)).await?;
                    diff.created += 1;
                }
                Some(current) if !same_payload(&current, edge) => {
                    let patch = json!({
                        "measurements": edge.measurements,
                        "purchaseItemAttributes": edge.purchase_item_attributes,
                        "saleItemAttributes": edge.sale_item_attributes,
                        "purchaseAssetAttributes": edge.purchase_asset_attributes,
                    });
                    relationships.update(&current.id, patch, Some(txn)).await?;
                    diff.updated += 1;
                }
                Some(_) => {}
            }
        }
        Ok(diff)
    }

    /// Creates the edges of `desired` that do not exist yet and leaves
    /// existing ones untouched.
    async fn add_missing(
        &self,
        kind: EdgeKind,
        anchor_id: &str,
        desired: &[Relationship],
        txn: &TransactionHandle,
    ) -> Result<usize, ServiceError> {
        let mut created = 0;
        for edge in desired {
            let existing = self
                .repos
                .relationships
                .find_by_tuple(
                    (anchor_id, kind.primary_type),
                    (&edge.secondary_id, kind.secondary_type),
                    kind.relationship_type,
                    Some(txn),
                )
                .await?;
            if existing.is_none() {
                self.repos.relationships.create(edge.clone(), Some(txn)).await?;
                created += 1;
            }
        }
        Ok(created)
    }

    /// Deletes every edge touching `id`, on both ends.
    pub async fn cleanup_entity(&self, id: &str, txn: &TransactionHandle) -> Result<usize, ServiceError> {
        let relationships = &self.repos.relationships;
        let deleted = relationships.delete_by_primary(id, Some(txn)).await?
            + relationships.delete_by_secondary(id, Some(txn)).await?;
        info!(entity_id = %id, deleted, "Relationships cleaned up");
        Ok(deleted)
    }

    pub async fn find_all_for_entity(&self, id: &str) -> Result<EntityRelationships, ServiceError> {
        self.repos.relationships.find_all_for_entity(id, None).await
    }

    pub async fn find_direct_relationships(&self, first: &str, second: &str) -> Result<Vec<Relationship>, ServiceError> {
        self.repos
            .relationships
            .find_direct_relationships(first, second, None)
            .await
    }

    pub async fn statistics(&self) -> Result<RelationshipStatistics, ServiceError> {
        self.repos.relationships.statistics().await
    }

    /// Creates the asset bought on an asset line and links it to the purchase.
    pub async fn record_purchase_asset(
        &self,
        purchase: &Purchase,
        line: &PurchaseLine,
        txn: &TransactionHandle,
    ) -> Result<Asset, ServiceError> {
        let mut asset = Asset::new(
            line.asset_name
                .clone()
                .unwrap_or_else(|| format!("Asset from {}", purchase.supplier.name)),
        );
        asset.category = line.asset_category.clone();
        asset.acquisition_cost = if line.total_cost > rust_decimal::Decimal::ZERO {
            line.total_cost
        } else {
            line.cost_per_unit
        };
        asset.acquisition_date = Some(purchase.purchase_date);
        asset.source_purchase = Some(purchase.id.clone());
        let asset = self.repos.assets.create(asset, Some(txn)).await?;

        let mut edge = EdgeKind::PURCHASE_ASSET.edge(&purchase.id, &asset.id);
        edge.purchase_asset_attributes = Some(PurchaseAssetAttributes {
            acquisition_cost: asset.acquisition_cost,
            asset_tag: asset.asset_tag.clone(),
        });
        self.repos.relationships.create(edge, Some(txn)).await?;
        info!(purchase_id = %purchase.id, asset_id = %asset.id, "Asset recorded from purchase");
        Ok(asset)
    }

    /// Turns the embedded link arrays of an item into relationship records.
    ///
    /// `components` become `product_material` edges from the item,
    /// `usedInProducts` become `product_material` edges into it and
    /// `relatedItems` become `associated` edges. Edges that already exist
    /// are skipped, so the conversion can be re-run.
    #[instrument(skip(self))]
    pub async fn convert_legacy_relationships(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<ConversionReport, ServiceError> {
        if entity_type != EntityType::Item {
            return Ok(ConversionReport::default());
        }
        let this = self.clone();
        let entity_id = entity_id.to_string();
        self.coordinator
            .with_transaction(TransactionOptions::labeled("relationships.convert_legacy"), move |txn| {
                let this = this.clone();
                let entity_id = entity_id.clone();
                async move { this.convert_item(&entity_id, &txn).await }
            })
            .await
    }

    async fn convert_item(&self, item_id: &str, txn: &TransactionHandle) -> Result<ConversionReport, ServiceError> {
        let item = self
            .repos
            .items
            .find_by_id_in(item_id, Some(txn))
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Item {} not found", item_id)))?;

        let mut candidates: Vec<Relationship> = Vec::new();
        for component in &item.components {
            candidates.push(EdgeKind::PRODUCT_MATERIAL.edge(&item.id, &component.item));
        }
        for product in &item.used_in_products {
            candidates.push(EdgeKind::PRODUCT_MATERIAL.edge(product, &item.id));
        }
        for related in &item.related_items {
            candidates.push(EdgeKind::ASSOCIATED_ITEMS.edge(&item.id, related));
        }

        let mut report = ConversionReport::default();
        for mut edge in candidates {
            if edge.primary_id.trim().is_empty() || edge.secondary_id.trim().is_empty() {
                report.errors.push(format!("blank {} reference on item {}", edge.relationship_type, item.id));
                continue;
            }
            let existing = self
                .repos
                .relationships
                .find_by_tuple(
                    (&edge.primary_id, edge.primary_type),
                    (&edge.secondary_id, edge.secondary_type),
                    edge.relationship_type,
                    Some(txn),
                )
                .await?;
            if existing.is_some() {
                report.skipped += 1;
                continue;
            }
            edge.is_legacy = true;
            edge.notes = Some("converted from embedded item links".into());
            match self.repos.relationships.create(edge, Some(txn)).await {
                Ok(_) => report.converted += 1,
                Err(err) if err.is_duplicate() => report.skipped += 1,
                Err(err) if err.is_validation() => report.errors.push(err.to_string()),
                Err(err) => return Err(err),
            }
        }
        info!(
            item_id = %item.id,
            converted = report.converted,
            skipped = report.skipped,
            errors = report.errors.len(),
            "Legacy relationships converted"
        );
        Ok(report)
    }

    /// Walks every purchase, sale and item and adds edges that are missing.
    /// Existing edges are never removed.
    #[instrument(skip(self))]
    pub async fn rebuild_relationships(&self) -> Result<RebuildReport, ServiceError> {
        let started = Utc::now();
        let mut report = RebuildReport::default();
        let all = FindOptions::default();

        let purchases = self.repos.purchases.find_all(&Filter::all(), &all).await?;
        for purchase in purchases {
            let mut desired = vec![(EdgeKind::PURCHASE_ITEM, purchase_item_edges(&purchase))];
            let assets: Vec<Relationship> = purchase
                .asset_ids()
                .iter()
                .map(|asset_id| EdgeKind::PURCHASE_ASSET.edge(&purchase.id, asset_id))
                .collect();
            desired.push((EdgeKind::PURCHASE_ASSET, assets));
            self.rebuild_one(&purchase.id, desired, &mut report).await;
        }

        let sales = self.repos.sales.find_all(&Filter::all(), &all).await?;
        for sale in sales {
            let desired = vec![(EdgeKind::SALE_ITEM, sale_item_edges(&sale))];
            self.rebuild_one(&sale.id, desired, &mut report).await;
        }

        let items = self.repos.items.find_all(&Filter::all(), &all).await?;
        for item in items {
            let desired = vec![(EdgeKind::PRODUCT_MATERIAL, component_edges(&item))];
            self.rebuild_one(&item.id, desired, &mut report).await;
            if let Some(source) = &item.derived_from {
                let axis = item.axis();
                let amount = source.amount(axis).unwrap_or_default();
                let edge = derived_edge(&source.item, &item.id, axis, amount, source.unit.clone());
                self.rebuild_one(&source.item, vec![(EdgeKind::DERIVED, vec![edge])], &mut report)
                    .await;
            }
        }

        info!(
            examined = report.examined,
            created = report.created,
            failed = report.failed,
            elapsed_ms = (Utc::now() - started).num_milliseconds(),
            "Relationship rebuild finished"
        );
        Ok(report)
    }

    async fn rebuild_one(&self, anchor_id: &str, desired: Vec<(EdgeKind, Vec<Relationship>)>, report: &mut RebuildReport) {
        report.examined += 1;
        let this = self.clone();
        let anchor = anchor_id.to_string();
        let desired = Arc::new(desired);
        let result = self
            .coordinator
            .with_transaction(TransactionOptions::retrying("relationships.rebuild"), move |txn| {
                let this = this.clone();
                let anchor = anchor.clone();
                let desired = desired.clone();
                async move {
                    let mut created = 0;
                    for (kind, edges) in desired.iter() {
                        created += this.add_missing(*kind, &anchor, edges, &txn).await?;
                    }
                    Ok(created)
                }
            })
            .await;
        match result {
            Ok(created) => report.created += created,
            Err(err) => {
                report.failed += 1;
                warn!(anchor_id, error = %err, "Relationship rebuild failed for entity");
            }
        }
    }
}

fn same_payload(current: &Relationship, desired: &Relationship) -> bool {
    current.measurements == desired.measurements
        && current.purchase_item_attributes == desired.purchase_item_attributes
        && current.sale_item_attributes == desired.sale_item_attributes
        && current.purchase_asset_attributes == desired.purchase_asset_attributes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Component, ItemType, PurchaseStatus, SaleLine, SaleStatus};
    use rust_decimal_macros::dec;

    #[test]
    fn purchase_edges_merge_lines_of_the_same_item() {
        let mut purchase = Purchase::new(
            "Acme",
            PurchaseStatus::Received,
            vec![
                PurchaseLine::inventory("a", Axis::Quantity, 3.0, dec!(5)),
                PurchaseLine::inventory("a", Axis::Quantity, 2.0, dec!(7)),
                PurchaseLine::inventory("b", Axis::Quantity, 1.0, dec!(1)),
            ],
        );
        purchase.id = "p1".into();
        let edges = purchase_item_edges(&purchase);
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].measurements.quantity, 5.0);
        let attrs = edges[0].purchase_item_attributes.as_ref().unwrap();
        assert_eq!(attrs.total_cost, dec!(29));
        assert_eq!(attrs.cost_per_unit, dec!(7));
        assert!(edges.iter().all(|e| e.is_valid_combination()));
    }

    #[test]
    fn sale_edges_skip_lines_without_items() {
        let mut sale = Sale::new(
            "Jane",
            SaleStatus::Completed,
            vec![SaleLine::new("a", Axis::Quantity, 1.0, dec!(3)), SaleLine::default()],
        );
        sale.id = "s1".into();
        let edges = sale_item_edges(&sale);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relationship_type, RelationshipType::SaleItem);
    }

    #[test]
    fn component_edges_point_from_the_product() {
        let mut product = Item::new("Table", Axis::Quantity);
        product.id = "t".into();
        product.item_type = ItemType::Product;
        product.components = vec![
            Component { item: "leg".into(), quantity: 4.0 },
            Component { item: "top".into(), quantity: 1.0 },
        ];
        let edges = component_edges(&product);
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].primary_id, "t");
        assert_eq!(edges[0].secondary_id, "leg");
        assert_eq!(edges[0].measurements.quantity, 4.0);
    }
}
