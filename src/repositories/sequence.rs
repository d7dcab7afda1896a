//! Named monotonic counters backing generated codes such as SKUs and asset tags.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::db::{Backend, StorageBackend, StoreError, StoredDocument, TransactionHandle};
use crate::errors::ServiceError;
use crate::models::{Counter, Entity};

const MAX_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct SequenceGenerator {
    backend: Arc<Backend>,
}

impl SequenceGenerator {
    pub fn new(backend: Arc<Backend>) -> Self {
        Self { backend }
    }

    /// Claims the next value of `counter`, starting at 1.
    ///
    /// Inside a transaction the increment commits or rolls back with it. A
    /// lost race outside a transaction is retried against the fresh value.
    pub async fn next(&self, counter: &str, txn: Option<&TransactionHandle>) -> Result<u64, ServiceError> {
        let collection = Counter::schema().collection;
        let attempts = if txn.is_some() { 1 } else { MAX_ATTEMPTS };

        let mut last_error = None;
        for _ in 0..attempts {
            let result = match self.backend.get(collection, counter, txn).await? {
                None => {
                    let doc = StoredDocument::new(counter, json!({"id": counter, "value": 1}));
                    self.backend.insert(collection, doc, txn).await.map(|_| 1)
                }
                Some(current) => {
                    let value = current.body.get("value").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
                    let next = current.next_revision(json!({"id": counter, "value": value}), None);
                    self.backend
                        .replace(collection, next, current.revision, txn)
                        .await
                        .map(|_| value)
                }
            };

            match result {
                Ok(value) => {
                    debug!(counter, value, "Sequence advanced");
                    return Ok(value);
                }
                Err(err @ (StoreError::Conflict(_) | StoreError::Duplicate(_))) => last_error = Some(err),
                Err(other) => return Err(other.into()),
            }
        }
        Err(last_error
            .map(ServiceError::from)
            .unwrap_or_else(|| ServiceError::Conflict(format!("counter {} contended", counter))))
    }
}
