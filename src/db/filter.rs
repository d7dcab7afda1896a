//! Backend-neutral query filters.
//!
//! A filter is a JSON object mapping (dotted) field paths to either a bare value
//! (equality) or an operator object using `$eq $gt $gte $lt $lte $in $exists`.
//! Nested plain objects are flattened into dotted paths.

use std::cmp::Ordering;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use super::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Exists(bool),
}

impl Condition {
    fn operator(&self) -> &'static str {
        match self {
            Condition::Eq(_) => "$eq",
            Condition::Gt(_) => "$gt",
            Condition::Gte(_) => "$gte",
            Condition::Lt(_) => "$lt",
            Condition::Lte(_) => "$lte",
            Condition::In(_) => "$in",
            Condition::Exists(_) => "$exists",
        }
    }

    fn operand(&self) -> Value {
        match self {
            Condition::Eq(v)
            | Condition::Gt(v)
            | Condition::Gte(v)
            | Condition::Lt(v)
            | Condition::Lte(v) => v.clone(),
            Condition::In(values) => Value::Array(values.clone()),
            Condition::Exists(flag) => Value::Bool(*flag),
        }
    }

    fn matches(&self, found: Option<&Value>) -> bool {
        match self {
            Condition::Exists(expected) => {
                let present = matches!(found, Some(v) if !v.is_null());
                present == *expected
            }
            Condition::Eq(expected) => match found {
                Some(Value::Array(items)) if !expected.is_array() => {
                    items.iter().any(|v| values_equal(v, expected))
                }
                Some(v) => values_equal(v, expected),
                None => expected.is_null(),
            },
            Condition::In(options) => match found {
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|v| options.iter().any(|o| values_equal(v, o))),
                Some(v) => options.iter().any(|o| values_equal(v, o)),
                None => false,
            },
            Condition::Gt(bound) => ordered(found, bound, |o| o == Ordering::Greater),
            Condition::Gte(bound) => ordered(found, bound, |o| o != Ordering::Less),
            Condition::Lt(bound) => ordered(found, bound, |o| o == Ordering::Less),
            Condition::Lte(bound) => ordered(found, bound, |o| o != Ordering::Greater),
        }
    }
}

/// One `(path, condition)` pair; a filter is the conjunction of its clauses.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub path: String,
    pub condition: Condition,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    /// Matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(path, Condition::Eq(value.into()))
    }

    pub fn and(mut self, path: impl Into<String>, condition: Condition) -> Self {
        self.clauses.push(Clause {
            path: path.into(),
            condition,
        });
        self
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Parses the JSON filter vocabulary, rejecting unknown operators.
    pub fn from_value(value: &Value) -> Result<Self, StoreError> {
        match value {
            Value::Null => Ok(Self::all()),
            Value::Object(map) => {
                let mut filter = Self::all();
                collect_clauses(map, "", &mut filter.clauses)?;
                Ok(filter)
            }
            other => Err(StoreError::InvalidFilter(format!(
                "filter must be an object, got {}",
                other
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for clause in &self.clauses {
            let entry = map
                .entry(clause.path.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(ops) = entry {
                ops.insert(
                    clause.condition.operator().to_string(),
                    clause.condition.operand(),
                );
            }
        }
        Value::Object(map)
    }

    /// Arrays of objects along a path are searched element-wise, so
    /// `items.item` matches any line of a purchase.
    pub fn matches(&self, doc: &Value) -> bool {
        self.clauses.iter().all(|clause| {
            if let Some(found) = lookup_path(doc, &clause.path) {
                return clause.condition.matches(Some(found));
            }
            let candidates = lookup_all(doc, &clause.path);
            if candidates.is_empty() {
                clause.condition.matches(None)
            } else {
                clause.condition.matches(Some(&Value::Array(candidates)))
            }
        })
    }

    /// The value of a top-level equality clause on `path`, if there is one.
    pub fn equality_on(&self, path: &str) -> Option<&Value> {
        self.clauses.iter().find_map(|clause| match &clause.condition {
            Condition::Eq(v) if clause.path == path && !v.is_array() && !v.is_null() => Some(v),
            _ => None,
        })
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Filter::from_value(&value).map_err(serde::de::Error::custom)
    }
}

fn collect_clauses(map: &Map<String, Value>, prefix: &str, out: &mut Vec<Clause>) -> Result<(), StoreError> {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };

        match value {
            Value::Object(inner) if inner.keys().any(|k| k.starts_with('$')) => {
                for (op, operand) in inner {
                    out.push(Clause {
                        path: path.clone(),
                        condition: parse_operator(op, operand)?,
                    });
                }
            }
            Value::Object(inner) if !inner.is_empty() => collect_clauses(inner, &path, out)?,
            other => out.push(Clause {
                path,
                condition: Condition::Eq(other.clone()),
            }),
        }
    }
    Ok(())
}

fn parse_operator(op: &str, operand: &Value) -> Result<Condition, StoreError> {
    Ok(match op {
        "$eq" => Condition::Eq(operand.clone()),
        "$gt" => Condition::Gt(operand.clone()),
        "$gte" => Condition::Gte(operand.clone()),
        "$lt" => Condition::Lt(operand.clone()),
        "$lte" => Condition::Lte(operand.clone()),
        "$in" => match operand {
            Value::Array(values) => Condition::In(values.clone()),
            _ => return Err(StoreError::InvalidFilter("$in expects an array".into())),
        },
        "$exists" => match operand {
            Value::Bool(flag) => Condition::Exists(*flag),
            _ => return Err(StoreError::InvalidFilter("$exists expects a boolean".into())),
        },
        other => {
            return Err(StoreError::InvalidFilter(format!(
                "unsupported operator {}",
                other
            )))
        }
    })
}

/// Resolves a dotted path through nested objects.
pub fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            _ => return None,
        };
    }
    Some(current)
}

fn lookup_all(doc: &Value, path: &str) -> Vec<Value> {
    fn walk(value: &Value, segments: &[&str], out: &mut Vec<Value>) {
        match (segments.split_first(), value) {
            (None, v) => out.push(v.clone()),
            (Some(_), Value::Array(items)) => {
                for item in items {
                    walk(item, segments, out);
                }
            }
            (Some((head, rest)), Value::Object(map)) => {
                if let Some(next) = map.get(*head) {
                    walk(next, rest, out);
                }
            }
            _ => {}
        }
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    walk(doc, &segments, &mut out);
    out
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

/// Total order used by range operators and sorting: null < bool < number < string.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn ordered(found: Option<&Value>, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match found {
        Some(v) if comparable(v, bound) => accept(compare_values(v, bound)),
        _ => false,
    }
}

fn comparable(a: &Value, b: &Value) -> bool {
    (a.is_number() && b.is_number()) || (a.is_string() && b.is_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_values_mean_equality() {
        let filter = Filter::from_value(&json!({"category": "wood"})).unwrap();
        assert!(filter.matches(&json!({"category": "wood"})));
        assert!(!filter.matches(&json!({"category": "metal"})));
        assert_eq!(filter.equality_on("category"), Some(&json!("wood")));
    }

    #[test]
    fn operators_combine_conjunctively() {
        let filter = Filter::from_value(&json!({"quantity": {"$gte": 2, "$lt": 5}})).unwrap();
        assert!(filter.matches(&json!({"quantity": 2})));
        assert!(filter.matches(&json!({"quantity": 4.5})));
        assert!(!filter.matches(&json!({"quantity": 5})));
        assert!(!filter.matches(&json!({})));
    }

    #[test]
    fn nested_objects_become_dotted_paths() {
        let filter = Filter::from_value(&json!({"supplier": {"name": "Acme"}})).unwrap();
        assert_eq!(filter.clauses()[0].path, "supplier.name");
        assert!(filter.matches(&json!({"supplier": {"name": "Acme", "email": null}})));
    }

    #[test]
    fn equality_against_an_array_means_contains() {
        let filter = Filter::eq("tags", "oak");
        assert!(filter.matches(&json!({"tags": ["pine", "oak"]})));
        assert!(!filter.matches(&json!({"tags": ["pine"]})));
    }

    #[test]
    fn in_and_exists() {
        let filter = Filter::from_value(&json!({
            "status": {"$in": ["received", "partially_received"]},
            "imageUrl": {"$exists": false}
        }))
        .unwrap();
        assert!(filter.matches(&json!({"status": "received"})));
        assert!(filter.matches(&json!({"status": "received", "imageUrl": null})));
        assert!(!filter.matches(&json!({"status": "received", "imageUrl": "x"})));
        assert!(!filter.matches(&json!({"status": "pending"})));
    }

    #[test]
    fn unknown_operators_are_rejected() {
        let err = Filter::from_value(&json!({"name": {"$regex": "a.*"}})).unwrap_err();
        assert!(matches!(err, StoreError::InvalidFilter(_)));
    }

    #[test]
    fn deep_matching_reaches_into_line_arrays() {
        let filter = Filter::eq("items.item", "i1");
        let doc = json!({"items": [{"item": "i0"}, {"item": "i1"}]});
        assert!(filter.matches(&doc));
        assert!(!filter.matches(&json!({"items": [{"item": "i0"}]})));
    }

    #[test]
    fn filters_serialize_back_to_the_vocabulary() {
        let filter = Filter::eq("primaryId", "p1").and("weight", Condition::Gt(json!(0)));
        let back = Filter::from_value(&filter.to_value()).unwrap();
        assert_eq!(back, filter);
    }

    #[test]
    fn dates_compare_as_strings() {
        let filter = Filter::from_value(&json!({"createdAt": {"$gte": "2024-01-01T00:00:00Z"}})).unwrap();
        assert!(filter.matches(&json!({"createdAt": "2024-03-05T10:00:00Z"})));
        assert!(!filter.matches(&json!({"createdAt": "2023-12-31T23:59:59Z"})));
    }
}
