//! Wide-column key-value backend.
//!
//! Tables are keyed by `id` and declare global secondary indexes from the
//! schema. Transactions buffer writes in a [`PendingBatch`] and flush them as
//! one conditional `transact_write` on commit. Uniqueness is enforced with
//! guard items in the constraints table, each written with a not-exists
//! condition.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::{counter, histogram};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::filter::Filter;
use super::retry::BackoffPolicy;
use super::transaction::{HandleKind, TransactionHandle, TransactionStatus};
use super::{BackendKind, StorageBackend, StoreError, StoredDocument};
use crate::schema::definitions::UNIQUE_CONSTRAINTS_COLLECTION;
use crate::schema::{EntitySchema, GlobalSecondaryIndex, NativeSchema};

/// Maximum number of writes in one transactional batch.
pub const KEY_VALUE_BATCH_LIMIT: usize = 100;

const REVISION_ATTR: &str = "_revision";
const UNIQUE_KEY_ATTR: &str = "_uniqueKey";
const TABLE_ACTIVE_POLLS: u32 = 60;

pub type KvItem = Map<String, Value>;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("conditional check {condition:?} failed on {target}")]
    ConditionalCheckFailed {
        target: String,
        condition: Option<KvCondition>,
    },

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("transaction of {0} items exceeds the service limit")]
    TransactionTooLarge(usize),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("validation: {0}")]
    Validation(String),
}

impl From<KvError> for StoreError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::ConditionalCheckFailed {
                target,
                condition: Some(KvCondition::NotExists),
            } => StoreError::Duplicate(format!("{} already exists", target)),
            KvError::ConditionalCheckFailed { target, .. } => {
                StoreError::Conflict(format!("{} was modified concurrently", target))
            }
            KvError::TransactionTooLarge(size) => StoreError::TransactionTooLarge {
                size,
                limit: KEY_VALUE_BATCH_LIMIT,
            },
            KvError::Unavailable(msg) => StoreError::Unavailable(msg),
            other => StoreError::Transaction(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    Creating,
    Active,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KvCondition {
    NotExists,
    Exists,
    RevisionEquals(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum KvWrite {
    Put {
        table: String,
        item: KvItem,
        condition: Option<KvCondition>,
    },
    Delete {
        table: String,
        key: String,
        condition: Option<KvCondition>,
    },
}

impl KvWrite {
    pub fn table(&self) -> &str {
        match self {
            KvWrite::Put { table, .. } | KvWrite::Delete { table, .. } => table,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            KvWrite::Put { item, .. } => item.get("id").and_then(Value::as_str).unwrap_or_default(),
            KvWrite::Delete { key, .. } => key,
        }
    }

    pub fn condition(&self) -> Option<&KvCondition> {
        match self {
            KvWrite::Put { condition, .. } | KvWrite::Delete { condition, .. } => condition.as_ref(),
        }
    }

    fn with_condition(self, condition: Option<KvCondition>) -> Self {
        match self {
            KvWrite::Put { table, item, .. } => KvWrite::Put {
                table,
                item,
                condition,
            },
            KvWrite::Delete { table, key, .. } => KvWrite::Delete {
                table,
                key,
                condition,
            },
        }
    }
}

/// Client surface the backend needs from a wide-column store.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn list_tables(&self) -> Result<Vec<String>, KvError>;

    async fn create_table(
        &self,
        table: &str,
        partition_key: &str,
        indexes: &[GlobalSecondaryIndex],
    ) -> Result<(), KvError>;

    async fn describe_table(&self, table: &str) -> Result<TableStatus, KvError>;

    async fn get_item(&self, table: &str, key: &str) -> Result<Option<KvItem>, KvError>;

    /// Items whose index partition key equals `key`, narrowed by `filter`.
    async fn query_index(
        &self,
        table: &str,
        index: &str,
        key: &Value,
        filter: &Filter,
    ) -> Result<Vec<KvItem>, KvError>;

    /// Full scan with a server-side filter expression.
    async fn scan(&self, table: &str, filter: &Filter) -> Result<Vec<KvItem>, KvError>;

    /// Applies every write or none. Any failed condition aborts the batch.
    async fn transact_write(&self, writes: Vec<KvWrite>) -> Result<(), KvError>;
}

/// Writes buffered by an open key-value transaction.
#[derive(Debug, Default)]
pub struct PendingBatch {
    writes: Vec<KvWrite>,
}

impl PendingBatch {
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Adds a write. A later write to an item already in the batch replaces
    /// the earlier one in place but keeps the earlier condition, since the
    /// condition is checked against the store as it was before the batch.
    /// An item created and deleted within the batch drops out entirely.
    pub fn push(&mut self, write: KvWrite) {
        let existing = self
            .writes
            .iter()
            .position(|w| w.table() == write.table() && w.key() == write.key());

        match existing {
            Some(pos) => {
                let created_here = matches!(
                    &self.writes[pos],
                    KvWrite::Put {
                        condition: Some(KvCondition::NotExists),
                        ..
                    }
                );
                if created_here && matches!(write, KvWrite::Delete { .. }) {
                    self.writes.remove(pos);
                    return;
                }
                let condition = self.writes[pos].condition().cloned();
                self.writes[pos] = write.with_condition(condition);
            }
            None => self.writes.push(write),
        }
    }

    /// Buffered state of an item: `Some(Some(_))` written, `Some(None)`
    /// deleted, `None` untouched by this batch.
    pub fn overlay(&self, table: &str, key: &str) -> Option<Option<&KvItem>> {
        self.writes
            .iter()
            .find(|w| w.table() == table && w.key() == key)
            .map(|w| match w {
                KvWrite::Put { item, .. } => Some(item),
                KvWrite::Delete { .. } => None,
            })
    }

    fn writes_for<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a KvWrite> + 'a {
        self.writes.iter().filter(move |w| w.table() == table)
    }

    fn take(&mut self) -> Vec<KvWrite> {
        std::mem::take(&mut self.writes)
    }
}

fn to_item(doc: &StoredDocument) -> Result<KvItem, StoreError> {
    let mut item = match &doc.body {
        Value::Object(map) => map.clone(),
        other => {
            return Err(StoreError::Corrupt(format!(
                "key-value items must be objects, got {}",
                other
            )))
        }
    };
    item.insert("id".to_string(), Value::String(doc.id.clone()));
    item.insert(REVISION_ATTR.to_string(), json!(doc.revision));
    if let Some(key) = &doc.unique_key {
        item.insert(UNIQUE_KEY_ATTR.to_string(), Value::String(key.clone()));
    }
    Ok(item)
}

fn from_item(mut item: KvItem) -> Result<StoredDocument, StoreError> {
    let revision = item
        .remove(REVISION_ATTR)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| StoreError::Corrupt("item without revision".into()))?;
    let unique_key = item
        .remove(UNIQUE_KEY_ATTR)
        .and_then(|v| v.as_str().map(str::to_string));
    let id = item
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::Corrupt("item without id".into()))?;
    Ok(StoredDocument {
        id,
        revision,
        unique_key,
        body: Value::Object(item),
    })
}

fn guard_key(collection: &str, unique_key: &str) -> String {
    format!("{}#{}", collection, unique_key)
}

fn guard_put(collection: &str, unique_key: &str, owner: &str) -> KvWrite {
    let mut item = Map::new();
    item.insert("id".into(), Value::String(guard_key(collection, unique_key)));
    item.insert("owner".into(), Value::String(owner.to_string()));
    KvWrite::Put {
        table: UNIQUE_CONSTRAINTS_COLLECTION.to_string(),
        item,
        condition: Some(KvCondition::NotExists),
    }
}

fn guard_delete(collection: &str, unique_key: &str) -> KvWrite {
    KvWrite::Delete {
        table: UNIQUE_CONSTRAINTS_COLLECTION.to_string(),
        key: guard_key(collection, unique_key),
        condition: None,
    }
}

pub struct KeyValueBackend {
    id: String,
    client: Arc<dyn KvClient>,
    backoff: BackoffPolicy,
    connected: OnceCell<()>,
    indexes: DashMap<String, Vec<GlobalSecondaryIndex>>,
    table_poll_interval: Duration,
}

impl fmt::Debug for KeyValueBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValueBackend")
            .field("id", &self.id)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl KeyValueBackend {
    pub fn new(client: Arc<dyn KvClient>, backoff: BackoffPolicy) -> Self {
        Self {
            id: format!("keyvalue-{}", Uuid::new_v4()),
            client,
            backoff,
            connected: OnceCell::new(),
            indexes: DashMap::new(),
            table_poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_table_poll_interval(mut self, interval: Duration) -> Self {
        self.table_poll_interval = interval;
        self
    }

    async fn ready(&self) -> Result<(), StoreError> {
        self.connected
            .get_or_try_init(|| async {
                self.backoff
                    .run("key-value connect", || async {
                        self.client.list_tables().await.map(|_| ())
                    })
                    .await
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                self.create_table_if_missing(UNIQUE_CONSTRAINTS_COLLECTION, "id", &[])
                    .await?;
                info!(backend_id = %self.id, "Key-value backend connected");
                Ok::<(), StoreError>(())
            })
            .await
            .map(|_| ())
    }

    async fn create_table_if_missing(
        &self,
        table: &str,
        partition_key: &str,
        indexes: &[GlobalSecondaryIndex],
    ) -> Result<(), StoreError> {
        let tables = self.client.list_tables().await?;
        if !tables.iter().any(|t| t == table) {
            info!(table, "Creating key-value table");
            self.client.create_table(table, partition_key, indexes).await?;
        }

        for _ in 0..TABLE_ACTIVE_POLLS {
            if self.client.describe_table(table).await? == TableStatus::Active {
                return Ok(());
            }
            tokio::time::sleep(self.table_poll_interval).await;
        }
        Err(StoreError::Unavailable(format!("table {} never became ACTIVE", table)))
    }

    async fn read_store(&self, table: &str, key: &str) -> Result<Option<StoredDocument>, StoreError> {
        self.client.get_item(table, key).await?.map(from_item).transpose()
    }

    async fn read_through(
        &self,
        batch: &PendingBatch,
        table: &str,
        key: &str,
    ) -> Result<Option<StoredDocument>, StoreError> {
        match batch.overlay(table, key) {
            Some(Some(item)) => from_item(item.clone()).map(Some),
            Some(None) => Ok(None),
            None => self.read_store(table, key).await,
        }
    }

    async fn guard_taken(
        &self,
        batch: &PendingBatch,
        collection: &str,
        unique_key: &str,
    ) -> Result<bool, StoreError> {
        let key = guard_key(collection, unique_key);
        if let Some(state) = batch.overlay(UNIQUE_CONSTRAINTS_COLLECTION, &key) {
            return Ok(state.is_some());
        }
        Ok(self
            .client
            .get_item(UNIQUE_CONSTRAINTS_COLLECTION, &key)
            .await?
            .is_some())
    }

    async fn write_now(&self, writes: Vec<KvWrite>) -> Result<(), StoreError> {
        let start = Instant::now();
        let result = self.client.transact_write(writes).await;
        histogram!("ledgerlink_db.keyvalue.write.duration", start.elapsed());
        result.map_err(|e| {
            counter!("ledgerlink_db.keyvalue.write.error", 1);
            e.into()
        })
    }

    fn replace_writes(
        collection: &str,
        current: &StoredDocument,
        doc: &StoredDocument,
        expected_revision: u64,
    ) -> Result<Vec<KvWrite>, StoreError> {
        let mut writes = vec![KvWrite::Put {
            table: collection.to_string(),
            item: to_item(doc)?,
            condition: Some(KvCondition::RevisionEquals(expected_revision)),
        }];
        if current.unique_key != doc.unique_key {
            if let Some(old) = &current.unique_key {
                writes.push(guard_delete(collection, old));
            }
            if let Some(new) = &doc.unique_key {
                writes.push(guard_put(collection, new, &doc.id));
            }
        }
        Ok(writes)
    }
}

#[async_trait]
impl StorageBackend for KeyValueBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::KeyValue
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<(), StoreError> {
        self.ready().await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.client
            .list_tables()
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn close(&self) -> Result<(), StoreError> {
        debug!(backend_id = %self.id, "Key-value backend closed");
        Ok(())
    }

    async fn ensure_collection(&self, schema: &EntitySchema) -> Result<(), StoreError> {
        self.ready().await?;
        let NativeSchema::KeyValue(table) = schema.compile(BackendKind::KeyValue) else {
            return Err(StoreError::Transaction("schema did not compile to a key-value table".into()));
        };
        self.create_table_if_missing(&table.table, &table.partition_key, &table.indexes)
            .await?;
        self.indexes.insert(table.table.clone(), table.indexes);
        Ok(())
    }

    async fn begin(&self) -> Result<TransactionHandle, StoreError> {
        self.ready().await?;
        counter!("ledgerlink_db.keyvalue.transaction.started", 1);
        Ok(TransactionHandle::new(
            &self.id,
            HandleKind::PendingBatch(Mutex::new(PendingBatch::default())),
        ))
    }

    async fn commit(&self, txn: &TransactionHandle) -> Result<(), StoreError> {
        txn.ensure_pending()?;
        let writes = txn.pending_batch()?.lock().await.take();
        let size = writes.len();

        if size > KEY_VALUE_BATCH_LIMIT {
            txn.set_status(TransactionStatus::Error);
            warn!(transaction_id = %txn.id(), size, "Key-value batch over limit");
            return Err(StoreError::TransactionTooLarge {
                size,
                limit: KEY_VALUE_BATCH_LIMIT,
            });
        }

        if size > 0 {
            if let Err(err) = self.write_now(writes).await {
                txn.set_status(TransactionStatus::Error);
                return Err(err);
            }
        }
        txn.set_status(TransactionStatus::Committed);
        debug!(transaction_id = %txn.id(), size, "Key-value batch flushed");
        Ok(())
    }

    async fn rollback(&self, txn: &TransactionHandle) -> Result<(), StoreError> {
        if !txn.is_pending() {
            return Ok(());
        }
        let discarded = txn.pending_batch()?.lock().await.take().len();
        txn.set_status(TransactionStatus::Aborted);
        debug!(transaction_id = %txn.id(), discarded, "Key-value batch discarded");
        Ok(())
    }

    async fn get(
        &self,
        collection: &str,
        id: &str,
        txn: Option<&TransactionHandle>,
    ) -> Result<Option<StoredDocument>, StoreError> {
        self.ready().await?;
        match txn {
            Some(handle) => {
                let batch = handle.pending_batch()?.lock().await;
                self.read_through(&batch, collection, id).await
            }
            None => self.read_store(collection, id).await,
        }
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        txn: Option<&TransactionHandle>,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        self.ready().await?;

        let index = self.indexes.get(collection).and_then(|indexes| {
            indexes.iter().find_map(|idx| {
                filter
                    .equality_on(&idx.partition_key)
                    .map(|value| (idx.name.clone(), value.clone()))
            })
        });

        let items = match index {
            Some((name, value)) => {
                counter!("ledgerlink_db.keyvalue.query", 1);
                self.client.query_index(collection, &name, &value, filter).await?
            }
            None => {
                counter!("ledgerlink_db.keyvalue.scan", 1);
                self.client.scan(collection, filter).await?
            }
        };

        let mut docs = items
            .into_iter()
            .map(from_item)
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(handle) = txn {
            let batch = handle.pending_batch()?.lock().await;
            for write in batch.writes_for(collection) {
                docs.retain(|d| d.id != write.key());
                if let KvWrite::Put { item, .. } = write {
                    let doc = from_item(item.clone())?;
                    if filter.matches(&doc.body) {
                        docs.push(doc);
                    }
                }
            }
        }
        Ok(docs)
    }

    async fn insert(
        &self,
        collection: &str,
        doc: StoredDocument,
        txn: Option<&TransactionHandle>,
    ) -> Result<(), StoreError> {
        self.ready().await?;
        let mut writes = vec![KvWrite::Put {
            table: collection.to_string(),
            item: to_item(&doc)?,
            condition: Some(KvCondition::NotExists),
        }];
        if let Some(key) = &doc.unique_key {
            writes.push(guard_put(collection, key, &doc.id));
        }

        match txn {
            Some(handle) => {
                handle.ensure_pending()?;
                let mut batch = handle.pending_batch()?.lock().await;
                if self.read_through(&batch, collection, &doc.id).await?.is_some() {
                    return Err(StoreError::Duplicate(format!("{} {} already exists", collection, doc.id)));
                }
                if let Some(key) = &doc.unique_key {
                    if self.guard_taken(&batch, collection, key).await? {
                        return Err(StoreError::Duplicate(format!(
                            "{} unique key {} already exists",
                            collection, key
                        )));
                    }
                }
                for write in writes {
                    batch.push(write);
                }
                Ok(())
            }
            None => self.write_now(writes).await,
        }
    }

    async fn replace(
        &self,
        collection: &str,
        doc: StoredDocument,
        expected_revision: u64,
        txn: Option<&TransactionHandle>,
    ) -> Result<(), StoreError> {
        self.ready().await?;
        let not_found = || StoreError::NotFound {
            collection: collection.to_string(),
            id: doc.id.clone(),
        };
        let stale = |found: u64| {
            StoreError::Conflict(format!(
                "{} {} was modified concurrently (expected revision {}, found {})",
                collection, doc.id, expected_revision, found
            ))
        };

        match txn {
            Some(handle) => {
                handle.ensure_pending()?;
                let mut batch = handle.pending_batch()?.lock().await;
                let current = self
                    .read_through(&batch, collection, &doc.id)
                    .await?
                    .ok_or_else(not_found)?;
                if current.revision != expected_revision {
                    return Err(stale(current.revision));
                }
                if let Some(key) = doc.unique_key.as_deref().filter(|k| Some(*k) != current.unique_key.as_deref()) {
                    if self.guard_taken(&batch, collection, key).await? {
                        return Err(StoreError::Duplicate(format!(
                            "{} unique key {} already exists",
                            collection, key
                        )));
                    }
                }
                for write in Self::replace_writes(collection, &current, &doc, expected_revision)? {
                    batch.push(write);
                }
                Ok(())
            }
            None => {
                let current = self.read_store(collection, &doc.id).await?.ok_or_else(not_found)?;
                if current.revision != expected_revision {
                    return Err(stale(current.revision));
                }
                self.write_now(Self::replace_writes(collection, &current, &doc, expected_revision)?)
                    .await
            }
        }
    }

    async fn remove(
        &self,
        collection: &str,
        id: &str,
        txn: Option<&TransactionHandle>,
    ) -> Result<bool, StoreError> {
        self.ready().await?;
        let deletes = |current: &StoredDocument| {
            let mut writes = vec![KvWrite::Delete {
                table: collection.to_string(),
                key: id.to_string(),
                condition: Some(KvCondition::RevisionEquals(current.revision)),
            }];
            if let Some(key) = &current.unique_key {
                writes.push(guard_delete(collection, key));
            }
            writes
        };

        match txn {
            Some(handle) => {
                handle.ensure_pending()?;
                let mut batch = handle.pending_batch()?.lock().await;
                let Some(current) = self.read_through(&batch, collection, id).await? else {
                    return Ok(false);
                };
                for write in deletes(&current) {
                    batch.push(write);
                }
                Ok(true)
            }
            None => {
                let Some(current) = self.read_store(collection, id).await? else {
                    return Ok(false);
                };
                self.write_now(deletes(&current)).await?;
                Ok(true)
            }
        }
    }
}
