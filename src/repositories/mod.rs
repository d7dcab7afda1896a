//! Repository contracts shared by every entity and backend.

pub mod entity_repository;
pub mod relationship_repository;
pub mod sequence;

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::filter::{compare_values, lookup_path};
use crate::db::{Condition, Filter, TransactionHandle};
use crate::errors::ServiceError;
use crate::models::Entity;
use crate::schema::EntitySchema;

pub use entity_repository::EntityRepository;
pub use relationship_repository::{EntityRelationships, RelationshipRepository, RelationshipStatistics};
pub use sequence::SequenceGenerator;

/// A repository shared between services, usually behind a cache.
pub type SharedRepository<E> = std::sync::Arc<dyn Repository<Entity = E>>;

/// One sort criterion. Parses from `field` or `-field` (descending).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }
}

impl TryFrom<String> for SortKey {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let (field, descending) = match raw.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (raw.strip_prefix('+').unwrap_or(&raw), false),
        };
        if field.is_empty() {
            return Err(format!("invalid sort key '{}'", raw));
        }
        Ok(Self {
            field: field.to_string(),
            descending,
        })
    }
}

impl From<SortKey> for String {
    fn from(key: SortKey) -> Self {
        if key.descending {
            format!("-{}", key.field)
        } else {
            key.field
        }
    }
}

/// Paging and ordering for list reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindOptions {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub skip: Option<usize>,
    #[serde(default)]
    pub sort: Vec<SortKey>,
}

const RESERVED_PARAMS: [&str; 4] = ["limit", "skip", "sort", "q"];

impl FindOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn sorted_by(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    /// Splits query-string parameters into a filter and options.
    ///
    /// `limit`, `skip` and `sort` (comma separated, `-` for descending) are
    /// options and `q` is left to the caller. Every other parameter is an
    /// equality clause, typed by the field's declaration in `schema`.
    /// Undeclared fields match the raw string or its literal reading.
    pub fn from_params(
        params: &HashMap<String, String>,
        schema: &EntitySchema,
    ) -> Result<(Filter, FindOptions), ServiceError> {
        let parse_count = |name: &str| -> Result<Option<usize>, ServiceError> {
            params
                .get(name)
                .map(|raw| {
                    raw.parse::<usize>().map_err(|_| {
                        ServiceError::ValidationError(format!("{} must be a non-negative integer", name))
                    })
                })
                .transpose()
        };

        let mut options = FindOptions {
            limit: parse_count("limit")?,
            skip: parse_count("skip")?,
            sort: Vec::new(),
        };
        if let Some(raw) = params.get("sort") {
            for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                options
                    .sort
                    .push(SortKey::try_from(part.to_string()).map_err(ServiceError::ValidationError)?);
            }
        }

        let mut keys: Vec<&String> = params
            .keys()
            .filter(|k| !RESERVED_PARAMS.contains(&k.as_str()))
            .collect();
        keys.sort();
        let mut filter = Filter::all();
        for key in keys {
            let raw = &params[key];
            let condition = match schema.field_type(key) {
                Some(field_type) => Condition::Eq(field_type.parse_param(key, raw)?),
                None => Condition::In(param_readings(raw)),
            };
            filter = filter.and(key.clone(), condition);
        }
        Ok((filter, options))
    }

    /// Sorts, skips and truncates `docs`. Without explicit keys the order is
    /// `createdAt` then `id`, so every backend lists in the same order.
    pub fn apply(&self, mut docs: Vec<Value>) -> Vec<Value> {
        let default_keys = [SortKey::asc("createdAt"), SortKey::asc("id")];
        let keys: &[SortKey] = if self.sort.is_empty() { &default_keys } else { &self.sort };

        docs.sort_by(|a, b| {
            for key in keys {
                let left = lookup_path(a, &key.field).unwrap_or(&Value::Null);
                let right = lookup_path(b, &key.field).unwrap_or(&Value::Null);
                let ordering = compare_values(left, right);
                let ordering = if key.descending { ordering.reverse() } else { ordering };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });

        docs.into_iter()
            .skip(self.skip.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

fn param_readings(raw: &str) -> Vec<Value> {
    let literal = match raw {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        _ => raw
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| raw.parse::<f64>().map(Value::from))
            .ok(),
    };
    std::iter::once(Value::String(raw.to_string())).chain(literal).collect()
}

/// JSON query accepted by `find_by_query`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindQuery {
    #[serde(default)]
    pub filter: Filter,
    #[serde(flatten)]
    pub options: FindOptions,
}

/// JSON merge patch: objects merge recursively, `null` removes a key, any
/// other value replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Storage-agnostic access to one entity collection.
///
/// Reads and writes without an explicit handle join the ambient transaction
/// of the current task when one is active on the repository's backend.
#[async_trait]
pub trait Repository: Send + Sync {
    type Entity: Entity;

    async fn find_all_in(
        &self,
        filter: &Filter,
        options: &FindOptions,
        txn: Option<&TransactionHandle>,
    ) -> Result<Vec<Self::Entity>, ServiceError>;

    async fn find_all(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Self::Entity>, ServiceError> {
        self.find_all_in(filter, options, None).await
    }

    async fn find_by_id_in(
        &self,
        id: &str,
        txn: Option<&TransactionHandle>,
    ) -> Result<Option<Self::Entity>, ServiceError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Self::Entity>, ServiceError> {
        self.find_by_id_in(id, None).await
    }

    /// Records for the ids that exist, in the order of `ids`.
    async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<Self::Entity>, ServiceError>;

    async fn create(
        &self,
        entity: Self::Entity,
        txn: Option<&TransactionHandle>,
    ) -> Result<Self::Entity, ServiceError>;

    /// Applies `patch` as a JSON merge patch. Fails with `NotFound` for an
    /// unknown id and `Conflict` when the record changed underneath.
    async fn update(
        &self,
        id: &str,
        patch: Value,
        txn: Option<&TransactionHandle>,
    ) -> Result<Self::Entity, ServiceError>;

    async fn delete(&self, id: &str, txn: Option<&TransactionHandle>) -> Result<bool, ServiceError>;

    async fn count(&self, filter: &Filter) -> Result<u64, ServiceError>;

    async fn search(&self, text: &str, options: &FindOptions) -> Result<Vec<Self::Entity>, ServiceError>;

    async fn find_by_query(&self, query: &FindQuery) -> Result<Vec<Self::Entity>, ServiceError> {
        self.find_all(&query.filter, &query.options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::definitions::ITEM_SCHEMA;
    use serde_json::json;

    #[test]
    fn params_split_into_filter_and_options() {
        let params: HashMap<String, String> = [
            ("category", "metal"),
            ("limit", "5"),
            ("sort", "-createdAt,name"),
            ("quantity", "3"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let (filter, options) = FindOptions::from_params(&params, &ITEM_SCHEMA).unwrap();
        assert_eq!(options.limit, Some(5));
        assert_eq!(options.sort, vec![SortKey::desc("createdAt"), SortKey::asc("name")]);
        assert!(filter.matches(&json!({"category": "metal", "quantity": 3})));
        assert!(!filter.matches(&json!({"category": "metal", "quantity": "3"})));
    }

    #[test]
    fn string_fields_keep_numeric_looking_values() {
        let params: HashMap<String, String> = [("sku".to_string(), "000001".to_string())].into();
        let (filter, _) = FindOptions::from_params(&params, &ITEM_SCHEMA).unwrap();
        assert!(filter.matches(&json!({"sku": "000001"})));
        assert!(!filter.matches(&json!({"sku": 1})));
    }

    #[test]
    fn undeclared_fields_match_either_reading() {
        let params: HashMap<String, String> = [("notes".to_string(), "42".to_string())].into();
        let (filter, _) = FindOptions::from_params(&params, &ITEM_SCHEMA).unwrap();
        assert!(filter.matches(&json!({"notes": "42"})));
        assert!(filter.matches(&json!({"notes": 42})));
        assert!(!filter.matches(&json!({"notes": "042"})));
    }

    #[test]
    fn bad_limit_is_a_validation_error() {
        let params: HashMap<String, String> = [("limit".to_string(), "-1".to_string())].into();
        assert!(FindOptions::from_params(&params, &ITEM_SCHEMA).unwrap_err().is_validation());

        let params: HashMap<String, String> = [("quantity".to_string(), "lots".to_string())].into();
        assert!(FindOptions::from_params(&params, &ITEM_SCHEMA).unwrap_err().is_validation());
    }

    #[test]
    fn apply_sorts_then_pages() {
        let docs = vec![json!({"id": "a", "n": 3}), json!({"id": "b", "n": 1}), json!({"id": "c", "n": 2})];
        let options = FindOptions::default()
            .sorted_by(SortKey::desc("n"))
            .with_skip(1)
            .with_limit(1);
        assert_eq!(options.apply(docs), vec![json!({"id": "c", "n": 2})]);
    }

    #[test]
    fn merge_patch_removes_nulls_and_merges_objects() {
        let mut doc = json!({"a": 1, "nested": {"x": 1, "y": 2}, "gone": true});
        merge_patch(&mut doc, &json!({"nested": {"y": 3}, "gone": null, "b": [1]}));
        assert_eq!(doc, json!({"a": 1, "nested": {"x": 1, "y": 3}, "b": [1]}));
    }

    #[test]
    fn find_query_reads_filter_and_options() {
        let query: FindQuery = serde_json::from_value(json!({
            "filter": {"quantity": {"$gt": 2}},
            "limit": 10,
            "sort": ["-name"]
        }))
        .unwrap();
        assert_eq!(query.options.limit, Some(10));
        assert_eq!(query.options.sort, vec![SortKey::desc("name")]);
        assert!(query.filter.matches(&json!({"quantity": 3})));
    }
}
