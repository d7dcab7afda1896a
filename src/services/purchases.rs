//! Purchase controller.
//!
//! Every write runs in one retrying transaction that keeps the purchase
//! record, stock levels, bought assets and `purchase_item` edges in step.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, instrument};
use validator::Validate;

use super::inventory::InventoryService;
use super::relationships::{purchase_item_edges, EdgeKind, RelationshipService};
use super::{strip_fields, RelationshipAwareController, Repositories};
use crate::db::{TransactionCoordinator, TransactionHandle, TransactionOptions};
use crate::errors::ServiceError;
use crate::models::{Purchase, PurchaseLine};

const MANAGED_FIELDS: [&str; 1] = ["inventoryApplied"];

#[derive(Clone)]
pub struct PurchaseService {
    repos: Repositories,
    inventory: InventoryService,
    relationships: RelationshipService,
    coordinator: Arc<TransactionCoordinator>,
}

impl std::fmt::Debug for PurchaseService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurchaseService").finish_non_exhaustive()
    }
}

impl PurchaseService {
    pub fn new(
        repos: Repositories,
        inventory: InventoryService,
        relationships: RelationshipService,
        coordinator: Arc<TransactionCoordinator>,
    ) -> Self {
        Self {
            repos,
            inventory,
            relationships,
            coordinator,
        }
    }

    async fn create_in(&self, mut purchase: Purchase, txn: &TransactionHandle) -> Result<Purchase, ServiceError> {
        purchase.validate()?;
        purchase.inventory_applied = false;
        let mut created = self.repos.purchases.create(purchase, Some(txn)).await?;

        if created.status.applies_inventory() {
            created = self.receive(created, txn).await?;
        }
        self.relationships
            .update_relationships(
                EdgeKind::PURCHASE_ITEM,
                &created.id,
                &[],
                &purchase_item_edges(&created),
                txn,
            )
            .await?;
        Ok(created)
    }

    /// Applies the lines to stock, records bought assets and sets the marker.
    async fn receive(&self, purchase: Purchase, txn: &TransactionHandle) -> Result<Purchase, ServiceError> {
        self.inventory.apply_purchase(&purchase.items, txn).await?;
        let lines = self.record_assets(&purchase, txn).await?;
        self.repos
            .purchases
            .update(
                &purchase.id,
                json!({"inventoryApplied": true, "items": lines}),
                Some(txn),
            )
            .await
    }

    /// Creates an asset for every asset line that has none yet.
    async fn record_assets(&self, purchase: &Purchase, txn: &TransactionHandle) -> Result<Vec<PurchaseLine>, ServiceError> {
        let mut lines = purchase.items.clone();
        for line in lines.iter_mut().filter(|l| l.is_asset() && l.asset.is_none()) {
            let asset = self.relationships.record_purchase_asset(purchase, line, txn).await?;
            line.asset = Some(asset.id);
        }
        Ok(lines)
    }

    /// Matches asset lines that came back without an asset id to the old
    /// line of the same asset name, then deletes the assets whose lines are
    /// gone along with their edges. Returns whether any line adopted an id.
    async fn reconcile_assets(
        &self,
        old: &Purchase,
        updated: &mut Purchase,
        txn: &TransactionHandle,
    ) -> Result<bool, ServiceError> {
        let mut unclaimed: Vec<&PurchaseLine> = old
            .items
            .iter()
            .filter(|l| l.is_asset() && l.asset.is_some())
            .filter(|l| !updated.items.iter().any(|u| u.is_asset() && u.asset == l.asset))
            .collect();

        let mut adopted = false;
        for line in updated.items.iter_mut().filter(|l| l.is_asset() && l.asset.is_none()) {
            if let Some(pos) = unclaimed.iter().position(|o| o.asset_name == line.asset_name) {
                line.asset = unclaimed.remove(pos).asset.clone();
                adopted = true;
            }
        }

        for asset_id in unclaimed.into_iter().filter_map(|l| l.asset.as_deref()) {
            self.relationships.cleanup_entity(asset_id, txn).await?;
            self.repos.assets.delete(asset_id, Some(txn)).await?;
            info!(purchase_id = %old.id, asset_id, "Asset removed with its purchase line");
        }
        Ok(adopted)
    }

    async fn update_in(&self, id: &str, mut patch: Value, txn: &TransactionHandle) -> Result<Purchase, ServiceError> {
        let old = self
            .repos
            .purchases
            .find_by_id_in(id, Some(txn))
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Purchase {} not found", id)))?;

        strip_fields(&mut patch, &MANAGED_FIELDS);
        let mut updated = self.repos.purchases.update(id, patch, Some(txn)).await?;
        updated.validate()?;
        if self.reconcile_assets(&old, &mut updated, txn).await? {
            updated = self
                .repos
                .purchases
                .update(id, json!({"items": updated.items}), Some(txn))
                .await?;
        }

        match (old.inventory_applied, updated.status.applies_inventory()) {
            (true, true) => {
                self.inventory.update_purchase(&old.items, &updated.items, txn).await?;
                if updated.items.iter().any(|l| l.is_asset() && l.asset.is_none()) {
                    let lines = self.record_assets(&updated, txn).await?;
                    updated = self
                        .repos
                        .purchases
                        .update(id, json!({"items": lines}), Some(txn))
                        .await?;
                }
            }
            (true, false) => {
                self.inventory.revert_purchase(&old.items, txn).await?;
                updated = self
                    .repos
                    .purchases
                    .update(id, json!({"inventoryApplied": false}), Some(txn))
                    .await?;
            }
            (false, true) => {
                updated = self.receive(updated, txn).await?;
            }
            (false, false) => {}
        }

        self.relationships
            .update_relationships(
                EdgeKind::PURCHASE_ITEM,
                id,
                &old.item_ids(),
                &purchase_item_edges(&updated),
                txn,
            )
            .await?;
        Ok(updated)
    }

    async fn delete_in(&self, id: &str, txn: &TransactionHandle) -> Result<bool, ServiceError> {
        let Some(purchase) = self.repos.purchases.find_by_id_in(id, Some(txn)).await? else {
            return Ok(false);
        };
        if purchase.inventory_applied {
            self.inventory.revert_purchase(&purchase.items, txn).await?;
        }
        self.relationships.cleanup_entity(id, txn).await?;
        self.repos.purchases.delete(id, Some(txn)).await
    }
}

#[async_trait]
impl RelationshipAwareController for PurchaseService {
    type Entity = Purchase;

    #[instrument(skip(self, purchase), fields(lines = purchase.items.len()))]
    async fn create(&self, purchase: Purchase) -> Result<Purchase, ServiceError> {
        let this = self.clone();
        let created = self
            .coordinator
            .with_transaction(TransactionOptions::retrying("purchase.create"), move |txn| {
                let this = this.clone();
                let purchase = purchase.clone();
                async move { this.create_in(purchase, &txn).await }
            })
            .await?;
        info!(purchase_id = %created.id, status = %created.status, "Purchase created");
        Ok(created)
    }

    #[instrument(skip(self, patch))]
    async fn update(&self, id: &str, patch: Value) -> Result<Purchase, ServiceError> {
        let this = self.clone();
        let id = id.to_string();
        let updated = self
            .coordinator
            .with_transaction(TransactionOptions::retrying("purchase.update"), move |txn| {
                let this = this.clone();
                let id = id.clone();
                let patch = patch.clone();
                async move { this.update_in(&id, patch, &txn).await }
            })
            .await?;
        info!(purchase_id = %updated.id, status = %updated.status, "Purchase updated");
        Ok(updated)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<bool, ServiceError> {
        let this = self.clone();
        let id = id.to_string();
        self.coordinator
            .with_transaction(TransactionOptions::retrying("purchase.delete"), move |txn| {
                let this = this.clone();
                let id = id.clone();
                async move { this.delete_in(&id, &txn).await }
            })
            .await
    }
}
