//! Graph queries over the relationship collection.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::json;
use tracing::debug;

use super::{FindOptions, SharedRepository};
use crate::db::{Condition, Filter, TransactionHandle};
use crate::errors::ServiceError;
use crate::models::{EntityType, Relationship, RelationshipType};

pub type RelationshipStore = SharedRepository<Relationship>;

/// Edges touching one entity, split by which end it occupies.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRelationships {
    pub as_primary: Vec<Relationship>,
    pub as_secondary: Vec<Relationship>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipStatistics {
    pub total_count: u64,
    pub by_type: BTreeMap<String, u64>,
    /// Each edge counts once for its primary type and once for its secondary type.
    pub by_entity_type: BTreeMap<String, u64>,
}

#[derive(Clone)]
pub struct RelationshipRepository {
    inner: RelationshipStore,
}

impl std::fmt::Debug for RelationshipRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationshipRepository").finish_non_exhaustive()
    }
}

fn endpoint_filter(side: &str, id: &str, entity_type: Option<EntityType>) -> Filter {
    let filter = Filter::eq(format!("{}Id", side), id);
    match entity_type {
        Some(t) => filter.and(format!("{}Type", side), Condition::Eq(json!(t))),
        None => filter,
    }
}

impl RelationshipRepository {
    pub fn new(inner: RelationshipStore) -> Self {
        Self { inner }
    }

    pub fn store(&self) -> &RelationshipStore {
        &self.inner
    }

    /// Rejects combinations outside the permitted table before touching storage.
    pub async fn create(
        &self,
        relationship: Relationship,
        txn: Option<&TransactionHandle>,
    ) -> Result<Relationship, ServiceError> {
        if !relationship.is_valid_combination() {
            return Err(ServiceError::InvalidRelationshipCombination {
                relationship_type: relationship.relationship_type,
                primary_type: relationship.primary_type,
                secondary_type: relationship.secondary_type,
            });
        }
        self.inner.create(relationship, txn).await
    }

    pub async fn delete(&self, id: &str, txn: Option<&TransactionHandle>) -> Result<bool, ServiceError> {
        self.inner.delete(id, txn).await
    }

    pub async fn update(
        &self,
        id: &str,
        patch: serde_json::Value,
        txn: Option<&TransactionHandle>,
    ) -> Result<Relationship, ServiceError> {
        self.inner.update(id, patch, txn).await
    }

    pub async fn find_by_primary(
        &self,
        id: &str,
        entity_type: Option<EntityType>,
        txn: Option<&TransactionHandle>,
    ) -> Result<Vec<Relationship>, ServiceError> {
        self.inner
            .find_all_in(&endpoint_filter("primary", id, entity_type), &FindOptions::default(), txn)
            .await
    }

    pub async fn find_by_secondary(
        &self,
        id: &str,
        entity_type: Option<EntityType>,
        txn: Option<&TransactionHandle>,
    ) -> Result<Vec<Relationship>, ServiceError> {
        self.inner
            .find_all_in(&endpoint_filter("secondary", id, entity_type), &FindOptions::default(), txn)
            .await
    }

    pub async fn find_all_for_entity(
        &self,
        id: &str,
        txn: Option<&TransactionHandle>,
    ) -> Result<EntityRelationships, ServiceError> {
        Ok(EntityRelationships {
            as_primary: self.find_by_primary(id, None, txn).await?,
            as_secondary: self.find_by_secondary(id, None, txn).await?,
        })
    }

    /// Edges between two entities in either direction.
    pub async fn find_direct_relationships(
        &self,
        first: &str,
        second: &str,
        txn: Option<&TransactionHandle>,
    ) -> Result<Vec<Relationship>, ServiceError> {
        let mut edges = self
            .inner
            .find_all_in(
                &Filter::eq("primaryId", first).and("secondaryId", Condition::Eq(json!(second))),
                &FindOptions::default(),
                txn,
            )
            .await?;
        if first != second {
            edges.extend(
                self.inner
                    .find_all_in(
                        &Filter::eq("primaryId", second).and("secondaryId", Condition::Eq(json!(first))),
                        &FindOptions::default(),
                        txn,
                    )
                    .await?,
            );
        }
        Ok(edges)
    }

    /// The edge with exactly this 5-tuple, if stored.
    pub async fn find_by_tuple(
        &self,
        primary: (&str, EntityType),
        secondary: (&str, EntityType),
        relationship_type: RelationshipType,
        txn: Option<&TransactionHandle>,
    ) -> Result<Option<Relationship>, ServiceError> {
        let filter = endpoint_filter("primary", primary.0, Some(primary.1))
            .and("secondaryId", Condition::Eq(json!(secondary.0)))
            .and("secondaryType", Condition::Eq(json!(secondary.1)))
            .and("relationshipType", Condition::Eq(json!(relationship_type)));
        Ok(self
            .inner
            .find_all_in(&filter, &FindOptions::default().with_limit(1), txn)
            .await?
            .into_iter()
            .next())
    }

    pub async fn delete_by_primary(&self, id: &str, txn: Option<&TransactionHandle>) -> Result<usize, ServiceError> {
        let edges = self.find_by_primary(id, None, txn).await?;
        self.delete_all(edges, txn).await
    }

    pub async fn delete_by_secondary(&self, id: &str, txn: Option<&TransactionHandle>) -> Result<usize, ServiceError> {
        let edges = self.find_by_secondary(id, None, txn).await?;
        self.delete_all(edges, txn).await
    }

    async fn delete_all(&self, edges: Vec<Relationship>, txn: Option<&TransactionHandle>) -> Result<usize, ServiceError> {
        let mut deleted = 0;
        for edge in edges {
            if self.inner.delete(&edge.id, txn).await? {
                deleted += 1;
            }
        }
        debug!(deleted, "Relationships deleted");
        Ok(deleted)
    }

    pub async fn statistics(&self) -> Result<RelationshipStatistics, ServiceError> {
        let edges = self.inner.find_all(&Filter::all(), &FindOptions::default()).await?;
        let mut stats = RelationshipStatistics::default();
        for edge in &edges {
            stats.total_count += 1;
            *stats.by_type.entry(edge.relationship_type.to_string()).or_default() += 1;
            *stats.by_entity_type.entry(edge.primary_type.to_string()).or_default() += 1;
            *stats.by_entity_type.entry(edge.secondary_type.to_string()).or_default() += 1;
        }
        Ok(stats)
    }
}
