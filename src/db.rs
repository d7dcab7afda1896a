//! Storage backends.
//!
//! Every backend stores JSON documents in named collections and implements
//! [`StorageBackend`]. The three shipped backends differ in how they provide
//! transactions, which is hidden behind [`transaction::TransactionHandle`].

pub mod compensating;
pub mod filter;
pub mod key_value;
pub mod memory_document;
pub mod memory_kv;
pub mod retry;
pub mod sql_document;
pub mod transaction;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::DbErr;
use serde_json::Value;
use strum::{Display, EnumString};
use thiserror::Error;
use tracing::info;

use crate::schema::EntitySchema;

pub use compensating::{CompensatingBackend, DocumentClient};
pub use filter::{Condition, Filter};
pub use key_value::{KeyValueBackend, KvClient, KEY_VALUE_BATCH_LIMIT};
pub use memory_document::MemoryDocumentClient;
pub use memory_kv::MemoryKvClient;
pub use retry::{BackoffPolicy, RetryPolicy};
pub use sql_document::SqlDocumentBackend;
pub use transaction::{
    current_transaction, TransactionCoordinator, TransactionHandle, TransactionOptions,
    TransactionStatus,
};

/// Backend-level failures. Repositories convert these into `ServiceError`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{collection} {id} not found")]
    NotFound { collection: String, id: String },

    /// Optimistic revision check failed.
    #[error("{0}")]
    Conflict(String),

    /// Id or unique key already present.
    #[error("{0}")]
    Duplicate(String),

    #[error("transaction batch of {size} writes exceeds the limit of {limit}")]
    TransactionTooLarge { size: usize, limit: usize },

    #[error("{0}")]
    PartialRollback(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid stored document: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(DbErr),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<DbErr> for StoreError {
    fn from(err: DbErr) -> Self {
        if let Some(sea_orm::SqlErr::UniqueConstraintViolation(msg)) = err.sql_err() {
            return StoreError::Duplicate(format!("unique constraint violated: {}", msg));
        }
        match err {
            DbErr::ConnectionAcquire(e) => StoreError::Unavailable(e.to_string()),
            DbErr::Conn(e) => StoreError::Unavailable(e.to_string()),
            other => StoreError::Database(other),
        }
    }
}

/// Which family of backend a [`Backend`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    /// Document store with native multi-document transactions (sea-orm).
    #[strum(serialize = "documentstore")]
    DocumentStore,
    /// Wide-column key-value store with bounded transactional batches.
    #[strum(serialize = "keyvalue")]
    KeyValue,
    /// Document store without server-side transactions.
    #[strum(serialize = "otherdoc")]
    OtherDoc,
}

/// A stored record: the JSON body plus bookkeeping the backend needs.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    /// Incremented on every replace; used for optimistic concurrency.
    pub revision: u64,
    /// Joint value of the schema's unique fields, if any.
    pub unique_key: Option<String>,
    pub body: Value,
}

impl StoredDocument {
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            revision: 1,
            unique_key: None,
            body,
        }
    }

    pub fn with_unique_key(mut self, key: Option<String>) -> Self {
        self.unique_key = key;
        self
    }

    pub fn next_revision(&self, body: Value, unique_key: Option<String>) -> Self {
        Self {
            id: self.id.clone(),
            revision: self.revision + 1,
            unique_key,
            body,
        }
    }
}

/// Operations every storage backend provides.
///
/// Writes take an optional transaction handle. Without one they are applied
/// immediately (still atomically per call).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Unique per backend instance; handles remember which backend made them.
    fn id(&self) -> &str;

    /// Establishes the connection. Concurrent callers share one attempt.
    async fn connect(&self) -> Result<(), StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError>;

    /// Creates the physical layout for a collection if it does not exist.
    async fn ensure_collection(&self, schema: &EntitySchema) -> Result<(), StoreError>;

    async fn begin(&self) -> Result<TransactionHandle, StoreError>;

    async fn commit(&self, txn: &TransactionHandle) -> Result<(), StoreError>;

    async fn rollback(&self, txn: &TransactionHandle) -> Result<(), StoreError>;

    fn is_active(&self, txn: &TransactionHandle) -> bool {
        txn.backend_id() == self.id() && txn.is_pending()
    }

    async fn get(
        &self,
        collection: &str,
        id: &str,
        txn: Option<&TransactionHandle>,
    ) -> Result<Option<StoredDocument>, StoreError>;

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        txn: Option<&TransactionHandle>,
    ) -> Result<Vec<StoredDocument>, StoreError>;

    /// Fails with `Conflict` when the id or unique key is taken.
    async fn insert(
        &self,
        collection: &str,
        doc: StoredDocument,
        txn: Option<&TransactionHandle>,
    ) -> Result<(), StoreError>;

    /// Fails with `Conflict` when the stored revision is not `expected_revision`.
    async fn replace(
        &self,
        collection: &str,
        doc: StoredDocument,
        expected_revision: u64,
        txn: Option<&TransactionHandle>,
    ) -> Result<(), StoreError>;

    /// Returns whether a record was removed.
    async fn remove(
        &self,
        collection: &str,
        id: &str,
        txn: Option<&TransactionHandle>,
    ) -> Result<bool, StoreError>;
}

/// The configured backend, one variant per family.
pub enum Backend {
    DocStore(SqlDocumentBackend),
    KeyValue(KeyValueBackend),
    OtherDoc(CompensatingBackend),
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .finish()
    }
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $call:expr) => {
        match $self {
            Backend::DocStore($inner) => $call,
            Backend::KeyValue($inner) => $call,
            Backend::OtherDoc($inner) => $call,
        }
    };
}

#[async_trait]
impl StorageBackend for Backend {
    fn kind(&self) -> BackendKind {
        delegate!(self, b => b.kind())
    }

    fn id(&self) -> &str {
        delegate!(self, b => b.id())
    }

    async fn connect(&self) -> Result<(), StoreError> {
        delegate!(self, b => b.connect().await)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        delegate!(self, b => b.health_check().await)
    }

    async fn close(&self) -> Result<(), StoreError> {
        delegate!(self, b => b.close().await)
    }

    async fn ensure_collection(&self, schema: &EntitySchema) -> Result<(), StoreError> {
        delegate!(self, b => b.ensure_collection(schema).await)
    }

    async fn begin(&self) -> Result<TransactionHandle, StoreError> {
        delegate!(self, b => b.begin().await)
    }

    async fn commit(&self, txn: &TransactionHandle) -> Result<(), StoreError> {
        delegate!(self, b => b.commit(txn).await)
    }

    async fn rollback(&self, txn: &TransactionHandle) -> Result<(), StoreError> {
        delegate!(self, b => b.rollback(txn).await)
    }

    fn is_active(&self, txn: &TransactionHandle) -> bool {
        delegate!(self, b => b.is_active(txn))
    }

    async fn get(
        &self,
        collection: &str,
        id: &str,
        txn: Option<&TransactionHandle>,
    ) -> Result<Option<StoredDocument>, StoreError> {
        delegate!(self, b => b.get(collection, id, txn).await)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        txn: Option<&TransactionHandle>,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        delegate!(self, b => b.find(collection, filter, txn).await)
    }

    async fn insert(
        &self,
        collection: &str,
        doc: StoredDocument,
        txn: Option<&TransactionHandle>,
    ) -> Result<(), StoreError> {
        delegate!(self, b => b.insert(collection, doc, txn).await)
    }

    async fn replace(
        &self,
        collection: &str,
        doc: StoredDocument,
        expected_revision: u64,
        txn: Option<&TransactionHandle>,
    ) -> Result<(), StoreError> {
        delegate!(self, b => b.replace(collection, doc, expected_revision, txn).await)
    }

    async fn remove(
        &self,
        collection: &str,
        id: &str,
        txn: Option<&TransactionHandle>,
    ) -> Result<bool, StoreError> {
        delegate!(self, b => b.remove(collection, id, txn).await)
    }
}

/// Connection settings shared by all backend kinds.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub uri: String,
    pub region: Option<String>,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Connection timeout duration
    pub connect_timeout: Duration,
    /// Acquire connection timeout
    pub acquire_timeout: Duration,
    /// Statement timeout
    pub statement_timeout: Duration,
    /// Idle timeout duration
    pub idle_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl BackendSettings {
    pub fn new(kind: BackendKind, uri: impl Into<String>) -> Self {
        Self {
            kind,
            uri: uri.into(),
            region: None,
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(60),
            statement_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(600),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Builds and connects the backend selected by `settings`.
///
/// The key-value and non-transactional document backends ship in-process
/// clients only, selected with a `memory:` URI; other clients are plugged in
/// through [`Backend::key_value`] and [`Backend::other_doc`].
///
/// # Errors
/// Returns `Unavailable` once connection attempts are exhausted, or
/// `Transaction` for an unsupported URI scheme.
pub async fn connect_backend(settings: &BackendSettings) -> Result<Backend, StoreError> {
    info!(kind = %settings.kind, "Connecting storage backend");

    let backend = match settings.kind {
        BackendKind::DocumentStore => Backend::DocStore(SqlDocumentBackend::new(settings.clone())),
        BackendKind::KeyValue => {
            require_memory_uri(settings)?;
            let region = settings.region.clone().unwrap_or_else(|| "local".to_string());
            Backend::key_value(Arc::new(MemoryKvClient::new(region)), settings.backoff.clone())
        }
        BackendKind::OtherDoc => {
            require_memory_uri(settings)?;
            Backend::other_doc(Arc::new(MemoryDocumentClient::new()), settings.backoff.clone())
        }
    };

    backend.connect().await?;
    Ok(backend)
}

fn require_memory_uri(settings: &BackendSettings) -> Result<(), StoreError> {
    if settings.uri.starts_with("memory:") {
        Ok(())
    } else {
        Err(StoreError::Unavailable(format!(
            "no {} client available for {}",
            settings.kind, settings.uri
        )))
    }
}

impl Backend {
    pub fn key_value(client: Arc<dyn KvClient>, backoff: BackoffPolicy) -> Self {
        Backend::KeyValue(KeyValueBackend::new(client, backoff))
    }

    pub fn other_doc(client: Arc<dyn DocumentClient>, backoff: BackoffPolicy) -> Self {
        Backend::OtherDoc(CompensatingBackend::new(client, backoff))
    }

    /// Ensures every collection the core persists exists.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        use crate::schema::definitions::*;

        for schema in [
            &*ITEM_SCHEMA,
            &*PURCHASE_SCHEMA,
            &*SALE_SCHEMA,
            &*ASSET_SCHEMA,
            &*RELATIONSHIP_SCHEMA,
            &*COUNTER_SCHEMA,
        ] {
            self.ensure_collection(schema).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn backend_kind_parses_provider_names() {
        assert_eq!(BackendKind::from_str("documentstore").unwrap(), BackendKind::DocumentStore);
        assert_eq!(BackendKind::from_str("keyvalue").unwrap(), BackendKind::KeyValue);
        assert_eq!(BackendKind::from_str("otherdoc").unwrap(), BackendKind::OtherDoc);
        assert!(BackendKind::from_str("mongodb").is_err());
        assert_eq!(BackendKind::KeyValue.to_string(), "keyvalue");
    }

    #[test]
    fn next_revision_bumps_the_counter() {
        let doc = StoredDocument::new("a", serde_json::json!({"n": 1}));
        let next = doc.next_revision(serde_json::json!({"n": 2}), None);
        assert_eq!(next.revision, 2);
        assert_eq!(next.id, "a");
    }

    #[tokio::test]
    async fn non_memory_uris_are_rejected_for_in_process_clients() {
        let settings = BackendSettings::new(BackendKind::KeyValue, "dynamodb://prod");
        let err = connect_backend(&settings).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
