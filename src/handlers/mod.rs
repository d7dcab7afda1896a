//! HTTP surface.

pub mod common;
pub mod factory;

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Json, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::db::StorageBackend;
use crate::errors::ServiceError;
use crate::models::EntityType;
use crate::services::{derivation::parse_specs, ServiceContainer};
use common::{created_response, success_response};
use factory::{controlled_router, crud_router, Assets, Items, Purchases, Relationships, Sales};

/// Shared state handed to every handler.
#[derive(Clone, Debug)]
pub struct AppState {
    pub services: ServiceContainer,
}

impl AppState {
    pub fn new(services: ServiceContainer) -> Self {
        Self { services }
    }
}

/// Builds the full router: CRUD for every collection plus the derivation,
/// image, relationship maintenance and health routes.
pub fn router(state: AppState) -> Router {
    let items = controlled_router::<Items>()
        .route("/:id/derive", post(derive_items))
        .route("/:id/image", post(upload_image));

    let relationships = crud_router::<Relationships>()
        .route("/statistics", get(relationship_statistics))
        .route("/rebuild", post(rebuild_relationships))
        .route("/entity/:id", get(entity_relationships))
        .route("/between/:first/:second", get(direct_relationships))
        .route("/convert/:entity_type/:id", post(convert_legacy));

    Router::new()
        .route("/health", get(health))
        .nest("/api/items", items)
        .nest("/api/purchases", controlled_router::<Purchases>())
        .nest("/api/sales", controlled_router::<Sales>())
        .nest("/api/assets", controlled_router::<Assets>())
        .nest("/api/relationships", relationships)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `POST /api/items/:id/derive` with an array of specs or `{items: [...]}`.
async fn derive_items(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Response, ServiceError> {
    let specs = parse_specs(body)?;
    let result = state.services.derivation.create_derived_items(&id, specs, None).await?;
    Ok(created_response(result))
}

/// `POST /api/items/:id/image?fileName=...` with the raw image as the body.
async fn upload_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServiceError> {
    if body.is_empty() {
        return Err(ServiceError::ValidationError("image body is empty".into()));
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");
    let file_name = params.get("fileName").map(String::as_str).unwrap_or("image");
    let item = state
        .services
        .items
        .upload_image(&id, body.to_vec(), file_name, content_type)
        .await?;
    Ok(success_response(item))
}

async fn relationship_statistics(State(state): State<AppState>) -> Result<Response, ServiceError> {
    Ok(success_response(state.services.relationships.statistics().await?))
}

async fn rebuild_relationships(State(state): State<AppState>) -> Result<Response, ServiceError> {
    let report = state.services.relationships.rebuild_relationships().await?;
    info!(examined = report.examined, created = report.created, failed = report.failed, "Relationship rebuild finished");
    Ok(success_response(report))
}

async fn entity_relationships(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    Ok(success_response(state.services.relationships.find_all_for_entity(&id).await?))
}

async fn direct_relationships(
    State(state): State<AppState>,
    Path((first, second)): Path<(String, String)>,
) -> Result<Response, ServiceError> {
    Ok(success_response(
        state.services.relationships.find_direct_relationships(&first, &second).await?,
    ))
}

async fn convert_legacy(
    State(state): State<AppState>,
    Path((entity_type, id)): Path<(String, String)>,
) -> Result<Response, ServiceError> {
    let entity_type = EntityType::from_str(&entity_type)
        .map_err(|_| ServiceError::ValidationError(format!("unknown entity type '{}'", entity_type)))?;
    let report = state
        .services
        .relationships
        .convert_legacy_relationships(&id, entity_type)
        .await?;
    Ok(success_response(report))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let start = Instant::now();
    let backend = &state.services.backend;
    let (status, database) = match backend.health_check().await {
        Ok(()) => (StatusCode::OK, json!({"status": "up", "kind": backend.kind().to_string()})),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"status": "down", "kind": backend.kind().to_string(), "message": e.to_string()}),
        ),
    };
    (
        status,
        Json(json!({
            "status": if status.is_success() { "up" } else { "down" },
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "database": database,
            "responseTimeMs": start.elapsed().as_millis() as u64,
        })),
    )
}
