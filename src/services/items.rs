//! Item controller: bill-of-materials edges and item images.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use super::relationships::{component_edges, EdgeKind, RelationshipService};
use super::{strip_fields, RelationshipAwareController, Repositories};
use crate::db::{TransactionCoordinator, TransactionHandle, TransactionOptions};
use crate::errors::ServiceError;
use crate::models::Item;
use crate::storage::{object_key, ObjectStorage};

/// Stock and derivation bookkeeping only change through purchases, sales
/// and derivations.
const MANAGED_FIELDS: [&str; 2] = ["derivedItems", "derivedFrom"];

#[derive(Clone)]
pub struct ItemService {
    repos: Repositories,
    relationships: RelationshipService,
    storage: Arc<dyn ObjectStorage>,
    coordinator: Arc<TransactionCoordinator>,
}

impl std::fmt::Debug for ItemService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemService")
            .field("storage", &self.storage.name())
            .finish_non_exhaustive()
    }
}

impl ItemService {
    pub fn new(
        repos: Repositories,
        relationships: RelationshipService,
        storage: Arc<dyn ObjectStorage>,
        coordinator: Arc<TransactionCoordinator>,
    ) -> Self {
        Self {
            repos,
            relationships,
            storage,
            coordinator,
        }
    }

    /// Stores an image and points the item at it. The previous image, if
    /// any, is removed afterwards; failing to remove it is only logged.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn upload_image(
        &self,
        id: &str,
        bytes: Vec<u8>,
        file_name: &str,
        content_type: &str,
    ) -> Result<Item, ServiceError> {
        let existing = self
            .repos
            .items
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Item {} not found", id)))?;

        if !content_type.starts_with("image/") {
            return Err(ServiceError::ValidationError(format!(
                "expected an image upload, got {}",
                content_type
            )));
        }

        let url = self
            .storage
            .put(&object_key("items", file_name), bytes, content_type)
            .await?;
        let updated = match self
            .repos
            .items
            .update(id, json!({"imageUrl": url, "lastUpdated": Utc::now()}), None)
            .await
        {
            Ok(item) => item,
            Err(err) => {
                self.discard_image(&url).await;
                return Err(err);
            }
        };

        if let Some(previous) = existing.image_url.as_deref() {
            self.discard_image(previous).await;
        }
        info!(item_id = %id, image_url = %url, "Item image uploaded");
        Ok(updated)
    }

    async fn discard_image(&self, url: &str) {
        if let Err(err) = self.storage.delete(url).await {
            warn!(image_url = %url, error = %err, "Failed to delete item image");
        }
    }

    async fn create_in(&self, item: Item, txn: &TransactionHandle) -> Result<Item, ServiceError> {
        let created = self.repos.items.create(item, Some(txn)).await?;
        self.relationships
            .update_relationships(
                EdgeKind::PRODUCT_MATERIAL,
                &created.id,
                &[],
                &component_edges(&created),
                txn,
            )
            .await?;
        Ok(created)
    }

    async fn update_in(&self, id: &str, mut patch: Value, txn: &TransactionHandle) -> Result<Item, ServiceError> {
        let old = self
            .repos
            .items
            .find_by_id_in(id, Some(txn))
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Item {} not found", id)))?;

        strip_fields(&mut patch, &MANAGED_FIELDS);
        let updated = self.repos.items.update(id, patch, Some(txn)).await?;
        self.relationships
            .update_relationships(
                EdgeKind::PRODUCT_MATERIAL,
                id,
                &old.component_ids(),
                &component_edges(&updated),
                txn,
            )
            .await?;
        Ok(updated)
    }

    async fn delete_in(&self, id: &str, txn: &TransactionHandle) -> Result<Option<Item>, ServiceError> {
        let Some(item) = self.repos.items.find_by_id_in(id, Some(txn)).await? else {
            return Ok(None);
        };
        self.relationships.cleanup_entity(id, txn).await?;
        self.repos.items.delete(id, Some(txn)).await?;
        Ok(Some(item))
    }
}

#[async_trait]
impl RelationshipAwareController for ItemService {
    type Entity = Item;

    #[instrument(skip(self, item), fields(name = %item.name))]
    async fn create(&self, item: Item) -> Result<Item, ServiceError> {
        let this = self.clone();
        let created = self
            .coordinator
            .with_transaction(TransactionOptions::retrying("item.create"), move |txn| {
                let this = this.clone();
                let item = item.clone();
                async move { this.create_in(item, &txn).await }
            })
            .await?;
        info!(item_id = %created.id, sku = ?created.sku, "Item created");
        Ok(created)
    }

    #[instrument(skip(self, patch))]
    async fn update(&self, id: &str, patch: Value) -> Result<Item, ServiceError> {
        let this = self.clone();
        let id = id.to_string();
        self.coordinator
            .with_transaction(TransactionOptions::retrying("item.update"), move |txn| {
                let this = this.clone();
                let id = id.clone();
                let patch = patch.clone();
                async move { this.update_in(&id, patch, &txn).await }
            })
            .await
    }

    /// Deletes the item with its edges. The stored image goes afterwards,
    /// outside the transaction.
    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<bool, ServiceError> {
        let this = self.clone();
        let id = id.to_string();
        let deleted = self
            .coordinator
            .with_transaction(TransactionOptions::retrying("item.delete"), move |txn| {
                let this = this.clone();
                let id = id.clone();
                async move { this.delete_in(&id, &txn).await }
            })
            .await?;

        match deleted {
            Some(item) => {
                if let Some(url) = item.image_url.as_deref() {
                    self.discard_image(url).await;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
