//! Read-through caching decorator for any [`Repository`].
//!
//! Allow-listed reads are cached per instance under `"{operation}:{args}"`
//! with a TTL. Writes pass through and then drop every entry whose key
//! mentions the written id, plus all list-style entries. Reads that run
//! inside a transaction never touch the cache.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use strum::{Display, EnumString};
use tracing::{debug, warn};

use crate::db::{current_transaction, Filter, TransactionHandle};
use crate::errors::ServiceError;
use crate::models::Entity;
use crate::repositories::{FindOptions, FindQuery, Repository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CachedOperation {
    FindById,
    FindAll,
    FindByIds,
    Count,
    Search,
    FindByQuery,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub operations: Vec<CachedOperation>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            operations: vec![CachedOperation::FindById, CachedOperation::FindAll],
        }
    }
}

impl CacheSettings {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

pub struct CachedRepository<R> {
    inner: R,
    settings: CacheSettings,
    entries: DashMap<String, CacheEntry>,
}

impl<R> std::fmt::Debug for CachedRepository<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedRepository")
            .field("settings", &self.settings)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl<R: Repository> CachedRepository<R> {
    pub fn new(inner: R, settings: CacheSettings) -> Self {
        Self {
            inner,
            settings,
            entries: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry whose serialized arguments mention `id`.
    pub fn invalidate(&self, id: &str) {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.contains(id));
        debug!(id, dropped = before - self.entries.len(), "Cache invalidated");
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    fn invalidate_after_write(&self, id: &str) {
        let single = format!("{}:", CachedOperation::FindById);
        self.entries
            .retain(|key, _| key.starts_with(&single) && !key.contains(id));
    }

    async fn cached<T, F, Fut>(&self, operation: CachedOperation, args: Value, load: F) -> Result<T, ServiceError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, ServiceError>> + Send,
    {
        if !self.settings.operations.contains(&operation) || current_transaction().is_some() {
            return load().await;
        }

        let key = format!("{}:{}", operation, args);
        if let Some(entry) = self.entries.get(&key).map(|e| e.clone()) {
            if !entry.is_expired() {
                match serde_json::from_str(&entry.value) {
                    Ok(value) => {
                        counter!("ledgerlink_db.cache.hit", 1);
                        return Ok(value);
                    }
                    Err(err) => warn!(key = %key, error = %err, "Discarding unreadable cache entry"),
                }
            }
            self.entries.remove(&key);
        }

        counter!("ledgerlink_db.cache.miss", 1);
        let value = load().await?;
        self.entries
            .insert(key, CacheEntry::new(serde_json::to_string(&value)?, self.settings.ttl));
        Ok(value)
    }
}

#[async_trait]
impl<R: Repository> Repository for CachedRepository<R> {
    type Entity = R::Entity;

    async fn find_all_in(
        &self,
        filter: &Filter,
        options: &FindOptions,
        txn: Option<&TransactionHandle>,
    ) -> Result<Vec<R::Entity>, ServiceError> {
        if txn.is_some() {
            return self.inner.find_all_in(filter, options, txn).await;
        }
        self.cached(CachedOperation::FindAll, json!([filter, options]), || {
            self.inner.find_all_in(filter, options, None)
        })
        .await
    }

    async fn find_by_id_in(
        &self,
        id: &str,
        txn: Option<&TransactionHandle>,
    ) -> Result<Option<R::Entity>, ServiceError> {
        if txn.is_some() {
            return self.inner.find_by_id_in(id, txn).await;
        }
        self.cached(CachedOperation::FindById, json!([id]), || self.inner.find_by_id_in(id, None))
            .await
    }

    async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<R::Entity>, ServiceError> {
        self.cached(CachedOperation::FindByIds, json!([ids]), || self.inner.find_by_ids(ids))
            .await
    }

    async fn create(&self, entity: R::Entity, txn: Option<&TransactionHandle>) -> Result<R::Entity, ServiceError> {
        let created = self.inner.create(entity, txn).await?;
        self.invalidate_after_write(created.id());
        Ok(created)
    }

    async fn update(&self, id: &str, patch: Value, txn: Option<&TransactionHandle>) -> Result<R::Entity, ServiceError> {
        let result = self.inner.update(id, patch, txn).await;
        self.invalidate_after_write(id);
        result
    }

    async fn delete(&self, id: &str, txn: Option<&TransactionHandle>) -> Result<bool, ServiceError> {
        let result = self.inner.delete(id, txn).await;
        self.invalidate_after_write(id);
        result
    }

    async fn count(&self, filter: &Filter) -> Result<u64, ServiceError> {
        self.cached(CachedOperation::Count, json!([filter]), || self.inner.count(filter))
            .await
    }

    async fn search(&self, text: &str, options: &FindOptions) -> Result<Vec<R::Entity>, ServiceError> {
        self.cached(CachedOperation::Search, json!([text, options]), || {
            self.inner.search(text, options)
        })
        .await
    }

    async fn find_by_query(&self, query: &FindQuery) -> Result<Vec<R::Entity>, ServiceError> {
        self.cached(CachedOperation::FindByQuery, json!([query]), || {
            self.inner.find_by_query(query)
        })
        .await
    }
}
