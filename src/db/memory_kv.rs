//! In-process [`KvClient`] used for local runs and tests.
//!
//! Behaves like the hosted service where the backend depends on it: tables
//! report `Creating` once before turning `Active`, transactional writes are
//! all-or-nothing, and batches over the service limit are refused.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::filter::{lookup_path, Filter};
use super::key_value::{KvClient, KvCondition, KvError, KvItem, KvWrite, TableStatus, KEY_VALUE_BATCH_LIMIT};
use crate::schema::GlobalSecondaryIndex;

struct MemoryTable {
    indexes: Vec<GlobalSecondaryIndex>,
    status: TableStatus,
    items: BTreeMap<String, KvItem>,
}

pub struct MemoryKvClient {
    region: String,
    tables: RwLock<HashMap<String, MemoryTable>>,
}

impl MemoryKvClient {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Number of items currently stored in `table`.
    pub async fn item_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .await
            .get(table)
            .map(|t| t.items.len())
            .unwrap_or(0)
    }
}

fn revision_of(item: &KvItem) -> Option<u64> {
    item.get("_revision").and_then(Value::as_u64)
}

fn check(condition: Option<&KvCondition>, current: Option<&KvItem>) -> bool {
    match (condition, current) {
        (None, _) => true,
        (Some(KvCondition::NotExists), found) => found.is_none(),
        (Some(KvCondition::Exists), found) => found.is_some(),
        (Some(KvCondition::RevisionEquals(expected)), Some(item)) => {
            revision_of(item) == Some(*expected)
        }
        (Some(KvCondition::RevisionEquals(_)), None) => false,
    }
}

#[async_trait]
impl KvClient for MemoryKvClient {
    async fn list_tables(&self) -> Result<Vec<String>, KvError> {
        let mut names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_table(
        &self,
        table: &str,
        _partition_key: &str,
        indexes: &[GlobalSecondaryIndex],
    ) -> Result<(), KvError> {
        let mut tables = self.tables.write().await;
        if tables.contains_key(table) {
            return Err(KvError::Validation(format!("table {} already exists", table)));
        }
        tables.insert(
            table.to_string(),
            MemoryTable {
                indexes: indexes.to_vec(),
                status: TableStatus::Creating,
                items: BTreeMap::new(),
            },
        );
        debug!(region = %self.region, table, "Table created");
        Ok(())
    }

    async fn describe_table(&self, table: &str) -> Result<TableStatus, KvError> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| KvError::ResourceNotFound(table.to_string()))?;
        let reported = entry.status;
        entry.status = TableStatus::Active;
        Ok(reported)
    }

    async fn get_item(&self, table: &str, key: &str) -> Result<Option<KvItem>, KvError> {
        let tables = self.tables.read().await;
        let entry = tables
            .get(table)
            .ok_or_else(|| KvError::ResourceNotFound(table.to_string()))?;
        Ok(entry.items.get(key).cloned())
    }

    async fn query_index(
        &self,
        table: &str,
        index: &str,
        key: &Value,
        filter: &Filter,
    ) -> Result<Vec<KvItem>, KvError> {
        let tables = self.tables.read().await;
        let entry = tables
            .get(table)
            .ok_or_else(|| KvError::ResourceNotFound(table.to_string()))?;
        let gsi = entry
            .indexes
            .iter()
            .find(|i| i.name == index)
            .ok_or_else(|| KvError::Validation(format!("{} has no index {}", table, index)))?;

        Ok(entry
            .items
            .values()
            .filter(|item| {
                let doc = Value::Object((*item).clone());
                lookup_path(&doc, &gsi.partition_key) == Some(key) && filter.matches(&doc)
            })
            .cloned()
            .collect())
    }

    async fn scan(&self, table: &str, filter: &Filter) -> Result<Vec<KvItem>, KvError> {
        let tables = self.tables.read().await;
        let entry = tables
            .get(table)
            .ok_or_else(|| KvError::ResourceNotFound(table.to_string()))?;
        Ok(entry
            .items
            .values()
            .filter(|item| filter.matches(&Value::Object((*item).clone())))
            .cloned()
            .collect())
    }

    async fn transact_write(&self, writes: Vec<KvWrite>) -> Result<(), KvError> {
        if writes.len() > KEY_VALUE_BATCH_LIMIT {
            return Err(KvError::TransactionTooLarge(writes.len()));
        }

        let mut tables = self.tables.write().await;

        for (i, write) in writes.iter().enumerate() {
            if writes[..i]
                .iter()
                .any(|w| w.table() == write.table() && w.key() == write.key())
            {
                return Err(KvError::Validation(format!(
                    "multiple operations on {} {} in one transaction",
                    write.table(),
                    write.key()
                )));
            }
            let entry = tables
                .get(write.table())
                .ok_or_else(|| KvError::ResourceNotFound(write.table().to_string()))?;
            if !check(write.condition(), entry.items.get(write.key())) {
                return Err(KvError::ConditionalCheckFailed {
                    target: format!("{} {}", write.table(), write.key()),
                    condition: write.condition().cloned(),
                });
            }
        }

        for write in writes {
            let Some(entry) = tables.get_mut(write.table()) else {
                continue;
            };
            match write {
                KvWrite::Put { item, .. } => {
                    let key = item
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    entry.items.insert(key, item);
                }
                KvWrite::Delete { key, .. } => {
                    entry.items.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn item(id: &str, revision: u64) -> KvItem {
        let mut map = Map::new();
        map.insert("id".into(), json!(id));
        map.insert("_revision".into(), json!(revision));
        map
    }

    fn put(id: &str, revision: u64, condition: Option<KvCondition>) -> KvWrite {
        KvWrite::Put {
            table: "items".into(),
            item: item(id, revision),
            condition,
        }
    }

    async fn client() -> MemoryKvClient {
        let client = MemoryKvClient::new("local");
        client.create_table("items", "id", &[]).await.unwrap();
        client
    }

    #[tokio::test]
    async fn tables_report_creating_before_active() {
        let client = client().await;
        assert_eq!(client.describe_table("items").await.unwrap(), TableStatus::Creating);
        assert_eq!(client.describe_table("items").await.unwrap(), TableStatus::Active);
    }

    #[tokio::test]
    async fn failed_condition_discards_the_whole_batch() {
        let client = client().await;
        client
            .transact_write(vec![put("a", 1, Some(KvCondition::NotExists))])
            .await
            .unwrap();

        let err = client
            .transact_write(vec![
                put("b", 1, Some(KvCondition::NotExists)),
                put("a", 2, Some(KvCondition::RevisionEquals(7))),
            ])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KvError::ConditionalCheckFailed { condition: Some(KvCondition::RevisionEquals(7)), .. }
        ));
        assert_eq!(client.item_count("items").await, 1);
    }

    #[tokio::test]
    async fn oversized_batches_are_refused() {
        let client = client().await;
        let writes = (0..=KEY_VALUE_BATCH_LIMIT)
            .map(|i| put(&format!("i{}", i), 1, None))
            .collect();
        let err = client.transact_write(writes).await.unwrap_err();
        assert!(matches!(err, KvError::TransactionTooLarge(101)));
        assert_eq!(client.item_count("items").await, 0);
    }
}
