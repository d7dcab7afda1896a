//! Backend-agnostic repository for any [`Entity`].
//!
//! Schema defaults, hooks, validation and uniqueness keys are applied here so
//! every backend accepts and rejects exactly the same records.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use serde_json::{Map, Value};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{merge_patch, FindOptions, Repository, SequenceGenerator};
use crate::db::{current_transaction, Backend, Filter, StorageBackend, StoredDocument, TransactionHandle};
use crate::errors::ServiceError;
use crate::models::Entity;
use crate::schema::EntitySchema;

const PROTECTED_FIELDS: [&str; 2] = ["id", "createdAt"];

pub struct EntityRepository<E: Entity> {
    backend: Arc<Backend>,
    sequences: SequenceGenerator,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for EntityRepository<E> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            sequences: self.sequences.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> std::fmt::Debug for EntityRepository<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRepository")
            .field("collection", &E::schema().collection)
            .field("backend", &self.backend)
            .finish()
    }
}

impl<E: Entity> EntityRepository<E> {
    pub fn new(backend: Arc<Backend>) -> Self {
        Self {
            sequences: SequenceGenerator::new(backend.clone()),
            backend,
            _entity: PhantomData,
        }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    fn schema(&self) -> &'static EntitySchema {
        E::schema()
    }

    fn collection(&self) -> &'static str {
        E::schema().collection
    }

    /// The explicit handle, or the task's ambient one when it belongs here.
    fn scope(&self, txn: Option<&TransactionHandle>) -> Option<TransactionHandle> {
        match txn {
            Some(handle) => Some(handle.clone()),
            None => current_transaction().filter(|h| self.backend.is_active(h)),
        }
    }

    fn decode(&self, body: Value) -> Result<E, ServiceError> {
        serde_json::from_value(body).map_err(|e| {
            ServiceError::InternalError(format!("stored {} record is malformed: {}", self.collection(), e))
        })
    }

    fn encode(&self, entity: &E) -> Result<Map<String, Value>, ServiceError> {
        match serde_json::to_value(entity)? {
            Value::Object(map) => Ok(map),
            _ => Err(ServiceError::InternalError(format!(
                "{} records must serialize to objects",
                self.collection()
            ))),
        }
    }

    /// Defaults, pre-save hooks and validation, yielding the final body and
    /// its unique key.
    fn prepare(&self, mut body: Map<String, Value>) -> Result<(Value, Option<String>), ServiceError> {
        let schema = self.schema();
        schema.apply_defaults(&mut body);
        schema.run_pre_save(&mut body);
        let body = Value::Object(body);
        schema.validate(&body)?;
        let unique_key = schema.unique_key(&body);
        Ok((body, unique_key))
    }

    async fn fill_sequence(
        &self,
        body: &mut Map<String, Value>,
        txn: Option<&TransactionHandle>,
    ) -> Result<(), ServiceError> {
        let Some(sequence) = &self.schema().sequence else {
            return Ok(());
        };
        let missing = match body.get(sequence.field) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        };
        if missing {
            let value = self.sequences.next(sequence.counter, txn).await?;
            body.insert(sequence.field.to_string(), Value::String((sequence.format)(value)));
        }
        Ok(())
    }

    async fn documents(
        &self,
        filter: &Filter,
        txn: Option<&TransactionHandle>,
    ) -> Result<Vec<Value>, ServiceError> {
        let txn = self.scope(txn);
        let docs = self.backend.find(self.collection(), filter, txn.as_ref()).await?;
        Ok(docs.into_iter().map(|d| d.body).collect())
    }
}

#[async_trait]
impl<E: Entity> Repository for EntityRepository<E> {
    type Entity = E;

    async fn find_all_in(
        &self,
        filter: &Filter,
        options: &FindOptions,
        txn: Option<&TransactionHandle>,
    ) -> Result<Vec<E>, ServiceError> {
        let docs = self.documents(filter, txn).await?;
        options.apply(docs).into_iter().map(|body| self.decode(body)).collect()
    }

    async fn find_by_id_in(&self, id: &str, txn: Option<&TransactionHandle>) -> Result<Option<E>, ServiceError> {
        let txn = self.scope(txn);
        let found = self.backend.get(self.collection(), id, txn.as_ref()).await?;
        if let (Some(handle), Some(doc)) = (txn.as_ref(), found.as_ref()) {
            handle.observe(self.collection(), id, doc.revision);
        }
        found.map(|doc| self.decode(doc.body)).transpose()
    }

    async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<E>, ServiceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = Filter::all().and(
            "id",
            crate::db::Condition::In(ids.iter().cloned().map(Value::String).collect()),
        );
        let mut found = self.find_all(&filter, &FindOptions::default()).await?;
        found.sort_by_key(|e| ids.iter().position(|id| id == e.id()).unwrap_or(usize::MAX));
        Ok(found)
    }

    #[instrument(skip(self, entity), fields(collection = self.collection()))]
    async fn create(&self, entity: E, txn: Option<&TransactionHandle>) -> Result<E, ServiceError> {
        let txn = self.scope(txn);
        let mut body = self.encode(&entity)?;

        let id = match body.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        body.insert("id".into(), Value::String(id.clone()));
        if body.contains_key("createdAt") {
            let now = serde_json::to_value(Utc::now())?;
            body.insert("createdAt".into(), now.clone());
            body.insert("updatedAt".into(), now);
        }
        self.fill_sequence(&mut body, txn.as_ref()).await?;

        let (body, unique_key) = self.prepare(body)?;
        let doc = StoredDocument::new(id.clone(), body.clone()).with_unique_key(unique_key);
        self.backend.insert(self.collection(), doc, txn.as_ref()).await?;

        counter!("ledgerlink_db.repository.create", 1);
        debug!(id = %id, "Record created");
        self.schema().run_post_save(&body);
        self.decode(body)
    }

    #[instrument(skip(self, patch), fields(collection = self.collection()))]
    async fn update(&self, id: &str, patch: Value, txn: Option<&TransactionHandle>) -> Result<E, ServiceError> {
        let txn = self.scope(txn);
        let current = self
            .backend
            .get(self.collection(), id, txn.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("{} {} not found", self.collection(), id)))?;
        // A record read earlier in this transaction must not have moved since.
        if let Some(seen) = txn.as_ref().and_then(|h| h.observed_revision(self.collection(), id)) {
            if seen != current.revision {
                return Err(ServiceError::Conflict(format!(
                    "{} {} changed since it was read (revision {}, now {})",
                    self.collection(),
                    id,
                    seen,
                    current.revision
                )));
            }
        }

        let mut patch = patch;
        if let Value::Object(map) = &mut patch {
            for field in PROTECTED_FIELDS {
                map.remove(field);
            }
        }
        let mut body = current.body.clone();
        merge_patch(&mut body, &patch);

        let Value::Object(mut body) = body else {
            return Err(ServiceError::ValidationError("update must be an object".into()));
        };
        if body.contains_key("createdAt") {
            body.insert("updatedAt".into(), serde_json::to_value(Utc::now())?);
        }

        let (body, unique_key) = self.prepare(body)?;
        let next = current.next_revision(body.clone(), unique_key);
        let revision = next.revision;
        self.backend
            .replace(self.collection(), next, current.revision, txn.as_ref())
            .await?;
        if let Some(handle) = txn.as_ref() {
            handle.advance(self.collection(), id, revision);
        }

        counter!("ledgerlink_db.repository.update", 1);
        self.schema().run_post_save(&body);
        self.decode(body)
    }

    async fn delete(&self, id: &str, txn: Option<&TransactionHandle>) -> Result<bool, ServiceError> {
        let txn = self.scope(txn);
        let removed = self.backend.remove(self.collection(), id, txn.as_ref()).await?;
        if let Some(handle) = txn.as_ref() {
            handle.forget(self.collection(), id);
        }
        if removed {
            counter!("ledgerlink_db.repository.delete", 1);
            debug!(collection = self.collection(), id, "Record deleted");
        }
        Ok(removed)
    }

    async fn count(&self, filter: &Filter) -> Result<u64, ServiceError> {
        Ok(self.documents(filter, None).await?.len() as u64)
    }

    async fn search(&self, text: &str, options: &FindOptions) -> Result<Vec<E>, ServiceError> {
        let schema = self.schema();
        let docs = self
            .documents(&Filter::all(), None)
            .await?
            .into_iter()
            .filter(|doc| schema.matches_text(doc, text))
            .collect();
        options.apply(docs).into_iter().map(|body| self.decode(body)).collect()
    }
}
