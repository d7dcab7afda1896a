//! Sale controller.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, instrument};
use validator::Validate;

use super::inventory::InventoryService;
use super::relationships::{sale_item_edges, EdgeKind, RelationshipService};
use super::{strip_fields, RelationshipAwareController, Repositories};
use crate::db::{TransactionCoordinator, TransactionHandle, TransactionOptions};
use crate::errors::ServiceError;
use crate::models::Sale;

const MANAGED_FIELDS: [&str; 1] = ["inventoryApplied"];

#[derive(Clone)]
pub struct SaleService {
    repos: Repositories,
    inventory: InventoryService,
    relationships: RelationshipService,
    coordinator: Arc<TransactionCoordinator>,
}

impl std::fmt::Debug for SaleService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaleService").finish_non_exhaustive()
    }
}

impl SaleService {
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

    async fn mark_applied(&self, id: &str, applied: bool, txn: &TransactionHandle) -> Result<Sale, ServiceError> {
        self.repos
            .sales
            .update(id, json!({"inventoryApplied": applied}), Some(txn))
            .await
    }

    async fn create_in(&self, mut sale: Sale, txn: &TransactionHandle) -> Result<Sale, ServiceError> {
        sale.validate()?;
        sale.inventory_applied = false;
        let mut created = self.repos.sales.create(sale, Some(txn)).await?;

        if created.status.applies_inventory() {
            self.inventory.apply_sale(&created.items, txn).await?;
            created = self.mark_applied(&created.id, true, txn).await?;
        }
        self.relationships
            .update_relationships(EdgeKind::SALE_ITEM, &created.id, &[], &sale_item_edges(&created), txn)
            .await?;
        Ok(created)
    }

    async fn update_in(&self, id: &str, mut patch: Value, txn: &TransactionHandle) -> Result<Sale, ServiceError> {
        let old = self
            .repos
            .sales
            .find_by_id_in(id, Some(txn))
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Sale {} not found", id)))?;

        strip_fields(&mut patch, &MANAGED_FIELDS);
        let mut updated = self.repos.sales.update(id, patch, Some(txn)).await?;
        updated.validate()?;

        match (old.inventory_applied, updated.status.applies_inventory()) {
            (true, true) => {
                self.inventory.revert_sale(&old.items, txn).await?;
                self.inventory.apply_sale(&updated.items, txn).await?;
            }
            (true, false) => {
                self.inventory.revert_sale(&old.items, txn).await?;
                updated = self.mark_applied(id, false, txn).await?;
            }
            (false, true) => {
                self.inventory.apply_sale(&updated.items, txn).await?;
                updated = self.mark_applied(id, true, txn).await?;
            }
            (false, false) => {}
        }

        self.relationships
            .update_relationships(EdgeKind::SALE_ITEM, id, &old.item_ids(), &sale_item_edges(&updated), txn)
            .await?;
        Ok(updated)
    }

    async fn delete_in(&self, id: &str, txn: &TransactionHandle) -> Result<bool, ServiceError> {
        let Some(sale) = self.repos.sales.find_by_id_in(id, Some(txn)).await? else {
            return Ok(false);
        };
        if sale.inventory_applied {
            self.inventory.revert_sale(&sale.items, txn).await?;
        }
        self.relationships.cleanup_entity(id, txn).await?;
        self.repos.sales.delete(id, Some(txn)).await
    }
}

#[async_trait]
impl RelationshipAwareController for SaleService {
    type Entity = Sale;

    #[instrument(skip(self, sale), fields(lines = sale.items.len()))]
    async fn create(&self, sale: Sale) -> Result<Sale, ServiceError> {
        let this = self.clone();
        let created = self
            .coordinator
            .with_transaction(TransactionOptions::retrying("sale.create"), move |txn| {
                let this = this.clone();
                let sale = sale.clone();
                async move { this.create_in(sale, &txn).await }
            })
            .await?;
        info!(sale_id = %created.id, status = %created.status, "Sale created");
        Ok(created)
    }

    #[instrument(skip(self, patch))]
    async fn update(&self, id: &str, patch: Value) -> Result<Sale, ServiceError> {
        let this = self.clone();
        let id = id.to_string();
        let updated = self
            .coordinator
            .with_transaction(TransactionOptions::retrying("sale.update"), move |txn| {
                let this = this.clone();
                let id = id.clone();
                let patch = patch.clone();
                async move { this.update_in(&id, patch, &txn).await }
            })
            .await?;
        info!(sale_id = %updated.id, status = %updated.status, "Sale updated");
        Ok(updated)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<bool, ServiceError> {
        let this = self.clone();
        let id = id.to_string();
        self.coordinator
            .with_transaction(TransactionOptions::retrying("sale.delete"), move |txn| {
                let this = this.clone();
                let id = id.clone();
                async move { this.delete_in(&id, &txn).await }
            })
            .await
    }
}
