use std::collections::HashMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::db::Filter;
use crate::errors::ServiceError;
use crate::repositories::FindOptions;
use crate::schema::EntitySchema;

/// Standard success response
pub fn success_response<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(data)).into_response()
}

/// Standard created response
pub fn created_response<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(data)).into_response()
}

/// Standard no content response
pub fn no_content_response() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

/// Decodes a request body into `T`; shape errors are the client's fault.
pub fn parse_body<T: DeserializeOwned>(body: Value) -> Result<T, ServiceError> {
    serde_json::from_value(body).map_err(|e| ServiceError::ValidationError(format!("Invalid request body: {}", e)))
}

/// List parameters: the free-text `q` plus filter and paging options.
#[derive(Debug, Default)]
pub struct ListParams {
    pub search: Option<String>,
    pub filter: Filter,
    pub options: FindOptions,
}

impl ListParams {
    pub fn from_query(params: &HashMap<String, String>, schema: &EntitySchema) -> Result<Self, ServiceError> {
        let (filter, options) = FindOptions::from_params(params, schema)?;
        Ok(Self {
            search: params.get("q").map(|q| q.trim().to_string()).filter(|q| !q.is_empty()),
            filter,
            options,
        })
    }
}

/// Rejects a body that tries to set an id different from the path.
pub fn ensure_matching_id(path_id: &str, body: &Value) -> Result<(), ServiceError> {
    match body.get("id").and_then(Value::as_str) {
        Some(id) if id != path_id => Err(ServiceError::ValidationError(format!(
            "body id '{}' does not match path id '{}'",
            id, path_id
        ))),
        _ => Ok(()),
    }
}
