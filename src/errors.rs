use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::db::StoreError;
use crate::models::{Axis, EntityType, RelationshipType};

/// Error body returned by every handler
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Numeric HTTP status
    pub status: u16,
    /// Human-readable error description
    pub message: String,
    /// Machine-readable error kind (e.g. "NotFound", "Conflict")
    pub code: String,
    /// ISO 8601 timestamp when error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Lost update: the record changed between read and write. Retryable.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A unique key or id is already taken. Reported as `Conflict`, never retried.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Transaction required: {0}")]
    TransactionRequired(String),

    #[error("Transaction too large: {size} writes exceeds the backend limit of {limit}")]
    TransactionTooLarge { size: usize, limit: usize },

    #[error("Partial rollback: {0}")]
    PartialRollback(String),

    #[error("Insufficient source {axis}: requested {requested}, available {available}")]
    InsufficientSource {
        axis: Axis,
        requested: f64,
        available: f64,
    },

    #[error("Invalid relationship combination: {relationship_type} does not permit {primary_type} -> {secondary_type}")]
    InvalidRelationshipCombination {
        relationship_type: RelationshipType,
        primary_type: EntityType,
        secondary_type: EntityType,
    },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { collection, id } => {
                ServiceError::NotFound(format!("{} {} not found", collection, id))
            }
            StoreError::Conflict(msg) => ServiceError::Conflict(msg),
            StoreError::Duplicate(msg) => ServiceError::Duplicate(msg),
            StoreError::TransactionTooLarge { size, limit } => {
                ServiceError::TransactionTooLarge { size, limit }
            }
            StoreError::PartialRollback(msg) => ServiceError::PartialRollback(msg),
            StoreError::Unavailable(msg) => ServiceError::BackendUnavailable(msg),
            other => ServiceError::InternalError(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::InternalError(format!("Serialization error: {}", err))
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Error kind reported in the `code` field of error responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::ValidationError(_) => "Validation",
            Self::Conflict(_) | Self::Duplicate(_) => "Conflict",
            Self::TransactionRequired(_) => "TransactionRequired",
            Self::TransactionTooLarge { .. } => "TransactionTooLarge",
            Self::PartialRollback(_) => "PartialRollback",
            Self::InsufficientSource { .. } => "InsufficientSource",
            Self::InvalidRelationshipCombination { .. } => "InvalidRelationshipCombination",
            Self::BackendUnavailable(_) => "BackendUnavailable",
            Self::ConfigurationError(_) => "ConfigurationError",
            Self::InternalError(_) => "Internal",
        }
    }

    /// Validation-class errors are rejected input, never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::ValidationError(_) | Self::InvalidRelationshipCombination { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::InvalidRelationshipCombination { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::Conflict(_) | Self::Duplicate(_) => StatusCode::CONFLICT,
            Self::InsufficientSource { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::TransactionTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::TransactionRequired(_)
            | Self::PartialRollback(_)
            | Self::ConfigurationError(_)
            | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::InternalError(_) | Self::TransactionRequired(_) | Self::ConfigurationError(_) => {
                "Internal server error".to_string()
            }
            Self::PartialRollback(_) => {
                "Operation failed and could not be fully rolled back".to_string()
            }
            Self::BackendUnavailable(_) => "Storage backend temporarily unavailable".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(code = self.code(), error = %self, "request failed");
        }

        let body = ErrorResponse {
            status: status.as_u16(),
            message: self.response_message(),
            code: self.code().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn error_response_carries_status_message_and_code() {
        let response = ServiceError::NotFound("Item abc not found".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.status, 404);
        assert_eq!(payload.code, "NotFound");
        assert_eq!(payload.message, "Not found: Item abc not found");
    }

    #[test]
    fn service_error_status_code_mapping() {
        assert_eq!(
            ServiceError::ValidationError("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::InsufficientSource {
                axis: Axis::Weight,
                requested: 11.0,
                available: 10.0
            }
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServiceError::BackendUnavailable("down".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServiceError::TransactionTooLarge { size: 101, limit: 100 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn internal_errors_hide_their_cause() {
        assert_eq!(
            ServiceError::InternalError("sqlite: disk I/O".into()).response_message(),
            "Internal server error"
        );
        assert_eq!(ServiceError::InternalError("x".into()).code(), "Internal");
    }

    #[test]
    fn store_errors_map_onto_the_taxonomy() {
        let err: ServiceError = StoreError::Conflict("stale revision".into()).into();
        assert!(err.is_conflict());

        let err: ServiceError = StoreError::Duplicate("sku 000001".into()).into();
        assert!(err.is_duplicate());
        assert!(!err.is_conflict());
        assert_eq!(err.code(), "Conflict");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let err: ServiceError = StoreError::Unavailable("gone".into()).into();
        assert_eq!(err.code(), "BackendUnavailable");

        let err: ServiceError = StoreError::TransactionTooLarge { size: 120, limit: 100 }.into();
        assert_eq!(err.code(), "TransactionTooLarge");
    }
}
