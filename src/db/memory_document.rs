//! In-process [`DocumentClient`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::compensating::DocumentClient;
use super::filter::Filter;
use super::{StoreError, StoredDocument};

#[derive(Default)]
struct Collection {
    docs: BTreeMap<String, StoredDocument>,
}

impl Collection {
    fn unique_key_taken(&self, doc: &StoredDocument) -> bool {
        doc.unique_key.as_ref().is_some_and(|key| {
            self.docs
                .values()
                .any(|other| other.id != doc.id && other.unique_key.as_ref() == Some(key))
        })
    }
}

pub struct MemoryDocumentClient {
    collections: RwLock<HashMap<String, Collection>>,
    available: AtomicBool,
}

impl Default for MemoryDocumentClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentClient {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn up(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("document store unreachable".into()))
        }
    }
}

#[async_trait]
impl DocumentClient for MemoryDocumentClient {
    async fn ping(&self) -> Result<(), StoreError> {
        self.up()
    }

    async fn create_collection(&self, name: &str, _unique: bool) -> Result<(), StoreError> {
        self.up()?;
        self.collections
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn find_one(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>, StoreError> {
        self.up()?;
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|c| c.docs.get(id).cloned()))
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<StoredDocument>, StoreError> {
        self.up()?;
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|c| {
                c.docs
                    .values()
                    .filter(|d| filter.matches(&d.body))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_one(&self, collection: &str, doc: StoredDocument) -> Result<(), StoreError> {
        self.up()?;
        let mut collections = self.collections.write().await;
        let target = collections.entry(collection.to_string()).or_default();
        if target.docs.contains_key(&doc.id) {
            return Err(StoreError::Duplicate(format!("{} {} already exists", collection, doc.id)));
        }
        if target.unique_key_taken(&doc) {
            return Err(StoreError::Duplicate(format!(
                "{} unique key {} already exists",
                collection,
                doc.unique_key.as_deref().unwrap_or_default()
            )));
        }
        target.docs.insert(doc.id.clone(), doc);
        Ok(())
    }

    async fn replace_one(
        &self,
        collection: &str,
        doc: StoredDocument,
        expected_revision: u64,
    ) -> Result<bool, StoreError> {
        self.up()?;
        let mut collections = self.collections.write().await;
        let Some(target) = collections.get_mut(collection) else {
            return Ok(false);
        };
        match target.docs.get(&doc.id) {
            Some(current) if current.revision == expected_revision => {}
            _ => return Ok(false),
        }
        if target.unique_key_taken(&doc) {
            return Err(StoreError::Duplicate(format!(
                "{} unique key {} already exists",
                collection,
                doc.unique_key.as_deref().unwrap_or_default()
            )));
        }
        target.docs.insert(doc.id.clone(), doc);
        Ok(true)
    }

    async fn delete_one(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>, StoreError> {
        self.up()?;
        Ok(self
            .collections
            .write()
            .await
            .get_mut(collection)
            .and_then(|c| c.docs.remove(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unique_keys_are_enforced_on_insert_and_replace() {
        let client = MemoryDocumentClient::new();
        let a = StoredDocument::new("a", json!({})).with_unique_key(Some("k1".into()));
        let b = StoredDocument::new("b", json!({})).with_unique_key(Some("k2".into()));
        client.insert_one("c", a).await.unwrap();
        client.insert_one("c", b.clone()).await.unwrap();

        let dup = StoredDocument::new("x", json!({})).with_unique_key(Some("k1".into()));
        assert!(matches!(client.insert_one("c", dup).await, Err(StoreError::Duplicate(_))));

        let moved = b.next_revision(json!({}), Some("k1".into()));
        assert!(matches!(client.replace_one("c", moved, 1).await, Err(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn replace_requires_the_expected_revision() {
        let client = MemoryDocumentClient::new();
        let doc = StoredDocument::new("a", json!({"n": 1}));
        client.insert_one("c", doc.clone()).await.unwrap();
        assert!(!client.replace_one("c", doc.next_revision(json!({"n": 2}), None), 5).await.unwrap());
        assert!(client.replace_one("c", doc.next_revision(json!({"n": 2}), None), 1).await.unwrap());
    }
}
