//! Document backend for stores without server-side transactions.
//!
//! Writes inside a transaction are applied immediately and recorded in a
//! [`CompensationLog`]. Commit discards the log; rollback replays it in
//! reverse. Other readers can observe the writes before commit.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::filter::Filter;
use super::retry::BackoffPolicy;
use super::transaction::{HandleKind, TransactionHandle, TransactionStatus};
use super::{BackendKind, StorageBackend, StoreError, StoredDocument};
use crate::schema::{EntitySchema, NativeSchema};

/// Client surface the backend needs from a document store.
#[async_trait]
pub trait DocumentClient: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn create_collection(&self, name: &str, unique: bool) -> Result<(), StoreError>;

    async fn find_one(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>, StoreError>;

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<StoredDocument>, StoreError>;

    /// Fails with `Duplicate` when the id or unique key is taken.
    async fn insert_one(&self, collection: &str, doc: StoredDocument) -> Result<(), StoreError>;

    /// Replaces the document only if its stored revision is `expected_revision`.
    async fn replace_one(
        &self,
        collection: &str,
        doc: StoredDocument,
        expected_revision: u64,
    ) -> Result<bool, StoreError>;

    async fn delete_one(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>, StoreError>;
}

#[derive(Debug)]
enum Compensation {
    Inserted {
        collection: String,
        id: String,
    },
    /// Undone by writing `previous` back under `written_revision + 1`.
    /// Revisions only move forward, so a reader holding the aborted
    /// revision cannot overwrite the restored document.
    Replaced {
        collection: String,
        previous: StoredDocument,
        written_revision: u64,
    },
    Deleted {
        collection: String,
        previous: StoredDocument,
    },
}

/// Undo records for the writes of one compensating transaction.
#[derive(Debug, Default)]
pub struct CompensationLog {
    entries: Vec<Compensation>,
}

impl CompensationLog {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn record(&mut self, entry: Compensation) {
        self.entries.push(entry);
    }
}

pub struct CompensatingBackend {
    id: String,
    client: Arc<dyn DocumentClient>,
    backoff: BackoffPolicy,
    connected: OnceCell<()>,
}

impl fmt::Debug for CompensatingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompensatingBackend")
            .field("id", &self.id)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl CompensatingBackend {
    pub fn new(client: Arc<dyn DocumentClient>, backoff: BackoffPolicy) -> Self {
        Self {
            id: format!("otherdoc-{}", Uuid::new_v4()),
            client,
            backoff,
            connected: OnceCell::new(),
        }
    }

    async fn ready(&self) -> Result<(), StoreError> {
        self.connected
            .get_or_try_init(|| async {
                self.backoff
                    .run("document store connect", || self.client.ping())
                    .await
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                info!(backend_id = %self.id, "Document backend connected");
                Ok::<(), StoreError>(())
            })
            .await
            .map(|_| ())
    }

    async fn undo(&self, entry: &Compensation) -> Result<(), StoreError> {
        match entry {
            Compensation::Inserted { collection, id } => {
                self.client.delete_one(collection, id).await?;
                Ok(())
            }
            Compensation::Replaced {
                collection,
                previous,
                written_revision,
            } => {
                let restored = StoredDocument {
                    id: previous.id.clone(),
                    revision: written_revision + 1,
                    unique_key: previous.unique_key.clone(),
                    body: previous.body.clone(),
                };
                if self
                    .client
                    .replace_one(collection, restored, *written_revision)
                    .await?
                {
                    Ok(())
                } else {
                    Err(StoreError::Conflict(format!(
                        "{} {} changed after revision {}",
                        collection, previous.id, written_revision
                    )))
                }
            }
            Compensation::Deleted {
                collection,
                previous,
            } => self.client.insert_one(collection, previous.clone()).await,
        }
    }

    async fn log_write(&self, txn: Option<&TransactionHandle>, entry: Compensation) -> Result<(), StoreError> {
        if let Some(handle) = txn {
            handle.compensation_log()?.lock().await.record(entry);
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for CompensatingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OtherDoc
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<(), StoreError> {
        self.ready().await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.client
            .ping()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn close(&self) -> Result<(), StoreError> {
        debug!(backend_id = %self.id, "Document backend closed");
        Ok(())
    }

    async fn ensure_collection(&self, schema: &EntitySchema) -> Result<(), StoreError> {
        self.ready().await?;
        let NativeSchema::Document(collection) = schema.compile(BackendKind::OtherDoc) else {
            return Err(StoreError::Transaction("schema did not compile to a document collection".into()));
        };
        self.client
            .create_collection(&collection.collection, !collection.unique_fields.is_empty())
            .await
    }

    async fn begin(&self) -> Result<TransactionHandle, StoreError> {
        self.ready().await?;
        counter!("ledgerlink_db.otherdoc.transaction.started", 1);
        Ok(TransactionHandle::new(
            &self.id,
            HandleKind::CompensationLog(Mutex::new(CompensationLog::default())),
        ))
    }

    async fn commit(&self, txn: &TransactionHandle) -> Result<(), StoreError> {
        txn.ensure_pending()?;
        let mut log = txn.compensation_log()?.lock().await;
        let writes = log.len();
        log.entries.clear();
        txn.set_status(TransactionStatus::Committed);
        debug!(transaction_id = %txn.id(), writes, "Compensating transaction committed");
        Ok(())
    }

    async fn rollback(&self, txn: &TransactionHandle) -> Result<(), StoreError> {
        if !txn.is_pending() {
            return Ok(());
        }
        let entries = std::mem::take(&mut txn.compensation_log()?.lock().await.entries);
        let total = entries.len();

        let mut failures = Vec::new();
        for entry in entries.iter().rev() {
            if let Err(err) = self.undo(entry).await {
                error!(transaction_id = %txn.id(), entry = ?entry, error = %err, "Compensation failed");
                failures.push(err.to_string());
            }
        }

        if failures.is_empty() {
            txn.set_status(TransactionStatus::Aborted);
            debug!(transaction_id = %txn.id(), reverted = total, "Compensating transaction rolled back");
            Ok(())
        } else {
            txn.set_status(TransactionStatus::Error);
            counter!("ledgerlink_db.otherdoc.rollback.partial", 1);
            Err(StoreError::PartialRollback(format!(
                "{} of {} compensations failed: {}",
                failures.len(),
                total,
                failures.join("; ")
            )))
        }
    }

    async fn get(
        &self,
        collection: &str,
        id: &str,
        _txn: Option<&TransactionHandle>,
    ) -> Result<Option<StoredDocument>, StoreError> {
        self.ready().await?;
        self.client.find_one(collection, id).await
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        _txn: Option<&TransactionHandle>,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        self.ready().await?;
        self.client.find(collection, filter).await
    }

    async fn insert(
        &self,
        collection: &str,
        doc: StoredDocument,
        txn: Option<&TransactionHandle>,
    ) -> Result<(), StoreError> {
        self.ready().await?;
        if let Some(handle) = txn {
            handle.ensure_pending()?;
        }
        let id = doc.id.clone();
        self.client.insert_one(collection, doc).await?;
        self.log_write(
            txn,
            Compensation::Inserted {
                collection: collection.to_string(),
                id,
            },
        )
        .await
    }

    async fn replace(
        &self,
        collection: &str,
        doc: StoredDocument,
        expected_revision: u64,
        txn: Option<&TransactionHandle>,
    ) -> Result<(), StoreError> {
        self.ready().await?;
        if let Some(handle) = txn {
            handle.ensure_pending()?;
        }
        let previous = self
            .client
            .find_one(collection, &doc.id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: doc.id.clone(),
            })?;

        let written_revision = doc.revision;
        let id = doc.id.clone();
        if previous.revision != expected_revision
            || !self.client.replace_one(collection, doc, expected_revision).await?
        {
            return Err(StoreError::Conflict(format!(
                "{} {} was modified concurrently (expected revision {})",
                collection, id, expected_revision
            )));
        }

        self.log_write(
            txn,
            Compensation::Replaced {
                collection: collection.to_string(),
                previous,
                written_revision,
            },
        )
        .await
    }

    async fn remove(
        &self,
        collection: &str,
        id: &str,
        txn: Option<&TransactionHandle>,
    ) -> Result<bool, StoreError> {
        self.ready().await?;
        if let Some(handle) = txn {
            handle.ensure_pending()?;
        }
        match self.client.delete_one(collection, id).await? {
            Some(previous) => {
                self.log_write(
                    txn,
                    Compensation::Deleted {
                        collection: collection.to_string(),
                        previous,
                    },
                )
                .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDocumentClient;
    use serde_json::json;

    fn backend(client: Arc<MemoryDocumentClient>) -> CompensatingBackend {
        CompensatingBackend::new(client, BackoffPolicy::immediate(1))
    }

    #[tokio::test]
    async fn rollback_restores_every_write_in_reverse() {
        let client = Arc::new(MemoryDocumentClient::new());
        let backend = backend(client.clone());
        backend
            .insert("items", StoredDocument::new("a", json!({"id": "a", "n": 1})), None)
            .await
            .unwrap();
        backend
            .insert("items", StoredDocument::new("gone", json!({"id": "gone"})), None)
            .await
            .unwrap();

        let txn = backend.begin().await.unwrap();
        let current = backend.get("items", "a", Some(&txn)).await.unwrap().unwrap();
        backend
            .replace("items", current.next_revision(json!({"id": "a", "n": 2}), None), 1, Some(&txn))
            .await
            .unwrap();
        backend
            .insert("items", StoredDocument::new("b", json!({"id": "b"})), Some(&txn))
            .await
            .unwrap();
        assert!(backend.remove("items", "gone", Some(&txn)).await.unwrap());
        assert_eq!(txn.compensation_log().unwrap().lock().await.len(), 3);

        backend.rollback(&txn).await.unwrap();
        assert_eq!(txn.status(), TransactionStatus::Aborted);

        let a = backend.get("items", "a", None).await.unwrap().unwrap();
        assert_eq!(a.body, json!({"id": "a", "n": 1}));
        assert_eq!(a.unique_key, None);
        assert!(backend.get("items", "b", None).await.unwrap().is_none());
        assert!(backend.get("items", "gone", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn undone_replaces_keep_revisions_moving_forward() {
        let client = Arc::new(MemoryDocumentClient::new());
        let backend = backend(client.clone());
        let original = StoredDocument::new("a", json!({"id": "a", "sku": "000001"})).with_unique_key(Some("000001".into()));
        backend.insert("items", original.clone(), None).await.unwrap();

        let txn = backend.begin().await.unwrap();
        let aborted = original.next_revision(json!({"id": "a", "sku": "000002"}), Some("000002".into()));
        backend.replace("items", aborted, 1, Some(&txn)).await.unwrap();
        let seen_mid_flight = backend.get("items", "a", None).await.unwrap().unwrap();
        assert_eq!(seen_mid_flight.revision, 2);
        backend.rollback(&txn).await.unwrap();

        let restored = backend.get("items", "a", None).await.unwrap().unwrap();
        assert_eq!(restored.body, original.body);
        assert_eq!(restored.unique_key, original.unique_key);
        assert_eq!(restored.revision, 3);

        let late = seen_mid_flight.next_revision(json!({"id": "a", "sku": "000009"}), None);
        let err = backend.replace("items", late, 2, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn failed_compensation_reports_partial_rollback() {
        let client = Arc::new(MemoryDocumentClient::new());
        let backend = backend(client.clone());
        backend.connect().await.unwrap();

        let txn = backend.begin().await.unwrap();
        backend
            .insert("items", StoredDocument::new("a", json!({"id": "a"})), Some(&txn))
            .await
            .unwrap();
        client.set_available(false);

        let err = backend.rollback(&txn).await.unwrap_err();
        assert!(matches!(err, StoreError::PartialRollback(_)));
        assert_eq!(txn.status(), TransactionStatus::Error);
    }

    #[tokio::test]
    async fn commit_clears_the_log() {
        let backend = backend(Arc::new(MemoryDocumentClient::new()));
        let txn = backend.begin().await.unwrap();
        backend
            .insert("items", StoredDocument::new("a", json!({"id": "a"})), Some(&txn))
            .await
            .unwrap();
        backend.commit(&txn).await.unwrap();
        assert!(txn.compensation_log().unwrap().lock().await.is_empty());
        assert!(backend.get("items", "a", None).await.unwrap().is_some());
    }
}
