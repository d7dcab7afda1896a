//! Neutral entity declarations.
//!
//! Each entity is declared once as an [`EntitySchema`]. Repositories apply
//! defaults, hooks and validation from it before any backend sees a record, so
//! a value rejected on one backend is rejected on all of them. Backends turn the
//! declaration into their own physical layout through [`EntitySchema::compile`].

pub mod definitions;

use std::fmt;

use chrono::DateTime;
use serde_json::{Map, Value};

use crate::db::filter::lookup_path;
use crate::db::BackendKind;
use crate::errors::ServiceError;
use crate::models::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Date,
    Array,
    Object,
}

impl FieldType {
    /// Reads a query-string value as this type. Text-like fields keep the
    /// raw string, so `000001` stays a string.
    pub fn parse_param(&self, field: &str, raw: &str) -> Result<Value, ServiceError> {
        match self {
            FieldType::Number | FieldType::Integer => raw
                .parse::<i64>()
                .map(Value::from)
                .or_else(|_| raw.parse::<f64>().map(Value::from))
                .map_err(|_| ServiceError::ValidationError(format!("{} must be a number", field))),
            FieldType::Boolean => raw
                .parse::<bool>()
                .map(Value::Bool)
                .map_err(|_| ServiceError::ValidationError(format!("{} must be true or false", field))),
            FieldType::String | FieldType::Date | FieldType::Array | FieldType::Object => {
                Ok(Value::String(raw.to_string()))
            }
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value
                .as_f64()
                .map(|n| n.fract() == 0.0)
                .unwrap_or(false),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Date => value
                .as_str()
                .map(|s| DateTime::parse_from_rfc3339(s).is_ok())
                .unwrap_or(false),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Array => "array",
            FieldType::Object => "object",
        }
    }
}

pub type FieldValidator = fn(&Value) -> Result<(), String>;
pub type DocumentValidator = fn(&Value) -> Result<(), ServiceError>;
pub type PreSaveHook = fn(&mut Map<String, Value>);
pub type PostSaveHook = fn(&Value);

#[derive(Clone)]
pub struct FieldDef {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
    pub default: Option<Value>,
    pub enum_values: Option<&'static [&'static str]>,
    pub min: Option<f64>,
    pub validator: Option<FieldValidator>,
    /// Entity type this field points at, for reference fields.
    pub reference: Option<EntityType>,
}

impl FieldDef {
    pub fn new(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            required: false,
            default: None,
            enum_values: None,
            min: None,
            validator: None,
            reference: None,
        }
    }

    pub fn string(name: &'static str) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn number(name: &'static str) -> Self {
        Self::new(name, FieldType::Number)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn one_of(mut self, values: &'static [&'static str]) -> Self {
        self.enum_values = Some(values);
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn validator(mut self, validator: FieldValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn references(mut self, entity_type: EntityType) -> Self {
        self.reference = Some(entity_type);
        self
    }

    fn check(&self, value: Option<&Value>, errors: &mut Vec<String>) {
        let value = match value {
            None | Some(Value::Null) => {
                if self.required {
                    errors.push(format!("{} is required", self.name));
                }
                return;
            }
            Some(v) => v,
        };

        if !self.field_type.accepts(value) {
            errors.push(format!("{} must be a {}", self.name, self.field_type.name()));
            return;
        }

        if let (Some(allowed), Some(s)) = (self.enum_values, value.as_str()) {
            if !allowed.contains(&s) {
                errors.push(format!("{} must be one of: {}", self.name, allowed.join(", ")));
            }
        }

        if let (Some(min), Some(n)) = (self.min, value.as_f64()) {
            if n < min {
                errors.push(format!("{} must be at least {}", self.name, min));
            }
        }

        if let Some(validator) = self.validator {
            if let Err(msg) = validator(value) {
                errors.push(format!("{}: {}", self.name, msg));
            }
        }
    }
}

/// Secondary access path declaration. Dotted paths address nested fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDecl {
    pub name: &'static str,
    pub field: &'static str,
}

/// A field filled from a named counter when a record is created without it.
#[derive(Clone)]
pub struct SequenceDecl {
    pub field: &'static str,
    pub counter: &'static str,
    pub format: fn(u64) -> String,
}

#[derive(Clone)]
pub struct EntitySchema {
    pub collection: &'static str,
    pub entity_type: Option<EntityType>,
    pub fields: Vec<FieldDef>,
    pub indexes: Vec<IndexDecl>,
    /// Fields whose joint value must be unique across the collection.
    pub unique: Vec<&'static str>,
    /// Fields matched by `search`.
    pub searchable: Vec<&'static str>,
    pub sequence: Option<SequenceDecl>,
    pub validators: Vec<DocumentValidator>,
    pub pre_save: Vec<PreSaveHook>,
    pub post_save: Vec<PostSaveHook>,
}

impl fmt::Debug for EntitySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitySchema")
            .field("collection", &self.collection)
            .field("fields", &self.fields.iter().map(|d| d.name).collect::<Vec<_>>())
            .field("indexes", &self.indexes)
            .field("unique", &self.unique)
            .finish()
    }
}

impl EntitySchema {
    pub fn new(collection: &'static str) -> Self {
        Self {
            collection,
            entity_type: None,
            fields: Vec::new(),
            indexes: Vec::new(),
            unique: Vec::new(),
            searchable: Vec::new(),
            sequence: None,
            validators: Vec::new(),
            pre_save: Vec::new(),
            post_save: Vec::new(),
        }
    }

    pub fn entity(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn index(mut self, name: &'static str, field: &'static str) -> Self {
        self.indexes.push(IndexDecl { name, field });
        self
    }

    pub fn unique(mut self, fields: &[&'static str]) -> Self {
        self.unique = fields.to_vec();
        self
    }

    pub fn searchable(mut self, fields: &[&'static str]) -> Self {
        self.searchable = fields.to_vec();
        self
    }

    pub fn sequence(mut self, field: &'static str, counter: &'static str, format: fn(u64) -> String) -> Self {
        self.sequence = Some(SequenceDecl { field, counter, format });
        self
    }

    pub fn validate_with(mut self, validator: DocumentValidator) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn pre_save(mut self, hook: PreSaveHook) -> Self {
        self.pre_save.push(hook);
        self
    }

    pub fn post_save(mut self, hook: PostSaveHook) -> Self {
        self.post_save.push(hook);
        self
    }

    /// Fills declared defaults for absent or null fields.
    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields.iter().find(|d| d.name == name).map(|d| d.field_type)
    }

    pub fn apply_defaults(&self, doc: &mut Map<String, Value>) {
        for field in &self.fields {
            if let Some(default) = &field.default {
                let missing = doc.get(field.name).map(Value::is_null).unwrap_or(true);
                if missing {
                    doc.insert(field.name.to_string(), default.clone());
                }
            }
        }
    }

    pub fn run_pre_save(&self, doc: &mut Map<String, Value>) {
        for hook in &self.pre_save {
            hook(doc);
        }
    }

    pub fn run_post_save(&self, doc: &Value) {
        for hook in &self.post_save {
            hook(doc);
        }
    }

    /// Field checks first, then document-level validators.
    pub fn validate(&self, doc: &Value) -> Result<(), ServiceError> {
        let object = doc.as_object().ok_or_else(|| {
            ServiceError::ValidationError(format!("{} record must be an object", self.collection))
        })?;

        let mut errors = Vec::new();
        for field in &self.fields {
            field.check(object.get(field.name), &mut errors);
        }
        if !errors.is_empty() {
            return Err(ServiceError::ValidationError(errors.join("; ")));
        }

        for validator in &self.validators {
            validator(doc)?;
        }
        Ok(())
    }

    /// Joint value of the unique fields, `None` when any part is absent.
    pub fn unique_key(&self, doc: &Value) -> Option<String> {
        if self.unique.is_empty() {
            return None;
        }
        let mut parts = Vec::with_capacity(self.unique.len());
        for field in &self.unique {
            match lookup_path(doc, field) {
                Some(Value::String(s)) if !s.is_empty() => parts.push(s.clone()),
                Some(Value::Null) | None => return None,
                Some(Value::String(_)) => return None,
                Some(other) => parts.push(other.to_string()),
            }
        }
        Some(parts.join("|"))
    }

    /// Case-insensitive substring match over the searchable fields.
    pub fn matches_text(&self, doc: &Value, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.searchable.iter().any(|path| match lookup_path(doc, path) {
            Some(Value::String(s)) => s.to_lowercase().contains(&needle),
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(Value::as_str)
                .any(|s| s.to_lowercase().contains(&needle)),
            _ => false,
        })
    }

    /// Translates the declaration into the layout a backend kind understands.
    pub fn compile(&self, kind: BackendKind) -> NativeSchema {
        match kind {
            BackendKind::DocumentStore => NativeSchema::Sql(SqlTableSchema {
                collection: self.collection.to_string(),
                enforces_unique: !self.unique.is_empty(),
                indexed_paths: self.indexes.iter().map(|i| i.field.to_string()).collect(),
            }),
            BackendKind::KeyValue => NativeSchema::KeyValue(KeyValueTableSchema {
                table: self.collection.to_string(),
                partition_key: "id".to_string(),
                indexes: self
                    .indexes
                    .iter()
                    .map(|i| GlobalSecondaryIndex {
                        name: i.name.to_string(),
                        partition_key: i.field.to_string(),
                    })
                    .collect(),
                guarded_unique: !self.unique.is_empty(),
            }),
            BackendKind::OtherDoc => NativeSchema::Document(DocumentCollectionSchema {
                collection: self.collection.to_string(),
                unique_fields: self.unique.iter().map(|f| f.to_string()).collect(),
                indexed_paths: self.indexes.iter().map(|i| i.field.to_string()).collect(),
            }),
        }
    }
}

/// Backend-native rendition of an [`EntitySchema`].
#[derive(Debug, Clone, PartialEq)]
pub enum NativeSchema {
    Sql(SqlTableSchema),
    KeyValue(KeyValueTableSchema),
    Document(DocumentCollectionSchema),
}

/// Rows live in the shared `documents` table, partitioned by collection.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlTableSchema {
    pub collection: String,
    pub enforces_unique: bool,
    pub indexed_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalSecondaryIndex {
    pub name: String,
    pub partition_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyValueTableSchema {
    pub table: String,
    pub partition_key: String,
    pub indexes: Vec<GlobalSecondaryIndex>,
    /// Uniqueness is kept with guard items in the constraints table.
    pub guarded_unique: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentCollectionSchema {
    pub collection: String,
    pub unique_fields: Vec<String>,
    pub indexed_paths: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> EntitySchema {
        EntitySchema::new("widgets")
            .field(FieldDef::string("name").required())
            .field(FieldDef::string("kind").one_of(&["a", "b"]).default_value(json!("a")))
            .field(FieldDef::number("size").min(0.0).default_value(json!(0)))
            .index("KindIndex", "kind")
            .unique(&["name"])
            .searchable(&["name", "labels"])
    }

    #[test]
    fn defaults_fill_missing_and_null_fields() {
        let schema = sample();
        let mut doc = json!({"name": "w", "kind": null}).as_object().cloned().unwrap();
        schema.apply_defaults(&mut doc);
        assert_eq!(doc["kind"], json!("a"));
        assert_eq!(doc["size"], json!(0));
    }

    #[test]
    fn validation_reports_every_field_problem() {
        let schema = sample();
        let err = schema
            .validate(&json!({"kind": "z", "size": -1}))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("name is required"));
        assert!(msg.contains("kind must be one of"));
        assert!(msg.contains("size must be at least 0"));
    }

    #[test]
    fn unique_key_requires_every_part() {
        let schema = sample();
        assert_eq!(schema.unique_key(&json!({"name": "w"})), Some("w".into()));
        assert_eq!(schema.unique_key(&json!({"name": ""})), None);
        assert_eq!(schema.unique_key(&json!({})), None);
    }

    #[test]
    fn text_search_is_case_insensitive_and_covers_arrays() {
        let schema = sample();
        let doc = json!({"name": "Walnut Slab", "labels": ["Hardwood"]});
        assert!(schema.matches_text(&doc, "walnut"));
        assert!(schema.matches_text(&doc, "HARD"));
        assert!(!schema.matches_text(&doc, "pine"));
    }

    #[test]
    fn compile_produces_backend_layouts() {
        let schema = sample();
        match schema.compile(BackendKind::KeyValue) {
            NativeSchema::KeyValue(kv) => {
                assert_eq!(kv.partition_key, "id");
                assert_eq!(kv.indexes[0].name, "KindIndex");
                assert!(kv.guarded_unique);
            }
            other => panic!("unexpected layout {:?}", other),
        }
        assert!(matches!(
            schema.compile(BackendKind::DocumentStore),
            NativeSchema::Sql(SqlTableSchema { enforces_unique: true, .. })
        ));
        assert!(matches!(
            schema.compile(BackendKind::OtherDoc),
            NativeSchema::Document(_)
        ));
    }
}
