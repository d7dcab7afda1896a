//! Asset controller: deletes take the asset's edges with them.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument};

use super::relationships::RelationshipService;
use super::{strip_fields, RelationshipAwareController, Repositories};
use crate::db::{TransactionCoordinator, TransactionHandle, TransactionOptions};
use crate::errors::ServiceError;
use crate::models::Asset;

/// The tag comes from the counter and the source is fixed by the purchase.
const MANAGED_FIELDS: [&str; 2] = ["assetTag", "sourcePurchase"];

#[derive(Clone)]
pub struct AssetService {
    repos: Repositories,
    relationships: RelationshipService,
    coordinator: Arc<TransactionCoordinator>,
}

impl std::fmt::Debug for AssetService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetService").finish_non_exhaustive()
    }
}

impl AssetService {
    pub fn new(
        repos: Repositories,
        relationships: RelationshipService,
        coordinator: Arc<TransactionCoordinator>,
    ) -> Self {
        Self {
            repos,
            relationships,
            coordinator,
        }
    }

    async fn delete_in(&self, id: &str, txn: &TransactionHandle) -> Result<bool, ServiceError> {
        if self.repos.assets.find_by_id_in(id, Some(txn)).await?.is_none() {
            return Ok(false);
        }
        self.relationships.cleanup_entity(id, txn).await?;
        self.repos.assets.delete(id, Some(txn)).await
    }
}

#[async_trait]
impl RelationshipAwareController for AssetService {
    type Entity = Asset;

    #[instrument(skip(self, asset), fields(name = %asset.name))]
    async fn create(&self, asset: Asset) -> Result<Asset, ServiceError> {
        let repos = self.repos.clone();
        let created = self
            .coordinator
            .with_transaction(TransactionOptions::retrying("asset.create"), move |txn| {
                let repos = repos.clone();
                let asset = asset.clone();
                async move { repos.assets.create(asset, Some(&txn)).await }
            })
            .await?;
        info!(asset_id = %created.id, tag = ?created.asset_tag, "Asset created");
        Ok(created)
    }

    #[instrument(skip(self, patch))]
    async fn update(&self, id: &str, mut patch: Value) -> Result<Asset, ServiceError> {
        strip_fields(&mut patch, &MANAGED_FIELDS);
        let repos = self.repos.clone();
        let id = id.to_string();
        self.coordinator
            .with_transaction(TransactionOptions::retrying("asset.update"), move |txn| {
                let repos = repos.clone();
                let id = id.clone();
                let patch = patch.clone();
                async move { repos.assets.update(&id, patch, Some(&txn)).await }
            })
            .await
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<bool, ServiceError> {
        let this = self.clone();
        let id = id.to_string();
        self.coordinator
            .with_transaction(TransactionOptions::retrying("asset.delete"), move |txn| {
                let this = this.clone();
                let id = id.clone();
                async move { this.delete_in(&id, &txn).await }
            })
            .await
    }
}
