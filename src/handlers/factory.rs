//! Generic CRUD handlers.
//!
//! A [`Resource`] names a collection and picks its repository out of the
//! application state; every handler here is generic over it. Resources whose
//! writes touch stock or edges implement [`ControlledResource`] and route
//! create, update and delete through their controller instead.

use std::collections::HashMap;

use axum::{
    extract::{Json, Path, Query, State},
    response::Response,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::common::{created_response, ensure_matching_id, no_content_response, parse_body, success_response, ListParams};
use super::AppState;
use crate::errors::ServiceError;
use crate::models::{Asset, Entity, Item, Purchase, Relationship, Sale};
use crate::repositories::{EntityRelationships, FindQuery, SharedRepository};
use crate::services::{AssetService, ItemService, PurchaseService, RelationshipAwareController, SaleService};

pub trait Resource: Send + Sync + 'static {
    type Entity: Entity;

    /// Singular name used in error messages.
    const NAME: &'static str;

    fn repository(state: &AppState) -> &SharedRepository<Self::Entity>;
}

pub trait ControlledResource: Resource {
    type Controller: RelationshipAwareController<Entity = Self::Entity> + 'static;

    fn controller(state: &AppState) -> &Self::Controller;
}

pub struct Items;
pub struct Purchases;
pub struct Sales;
pub struct Assets;
pub struct Relationships;

impl Resource for Items {
    type Entity = Item;
    const NAME: &'static str = "Item";

    fn repository(state: &AppState) -> &SharedRepository<Item> {
        &state.services.repos.items
    }
}

impl ControlledResource for Items {
    type Controller = ItemService;

    fn controller(state: &AppState) -> &ItemService {
        &state.services.items
    }
}

impl Resource for Purchases {
    type Entity = Purchase;
    const NAME: &'static str = "Purchase";

    fn repository(state: &AppState) -> &SharedRepository<Purchase> {
        &state.services.repos.purchases
    }
}

impl ControlledResource for Purchases {
    type Controller = PurchaseService;

    fn controller(state: &AppState) -> &PurchaseService {
        &state.services.purchases
    }
}

impl Resource for Sales {
    type Entity = Sale;
    const NAME: &'static str = "Sale";

    fn repository(state: &AppState) -> &SharedRepository<Sale> {
        &state.services.repos.sales
    }
}

impl ControlledResource for Sales {
    type Controller = SaleService;

    fn controller(state: &AppState) -> &SaleService {
        &state.services.sales
    }
}

impl Resource for Assets {
    type Entity = Asset;
    const NAME: &'static str = "Asset";

    fn repository(state: &AppState) -> &SharedRepository<Asset> {
        &state.services.repos.assets
    }
}

impl ControlledResource for Assets {
    type Controller = AssetService;

    fn controller(state: &AppState) -> &AssetService {
        &state.services.assets
    }
}

impl Resource for Relationships {
    type Entity = Relationship;
    const NAME: &'static str = "Relationship";

    fn repository(state: &AppState) -> &SharedRepository<Relationship> {
        state.services.repos.relationship_store()
    }
}

fn not_found<R: Resource>(id: &str) -> ServiceError {
    ServiceError::NotFound(format!("{} {} not found", R::NAME, id))
}

/// An entity with the edges it takes part in.
#[derive(Debug, Serialize)]
pub struct WithRelationships<E> {
    #[serde(flatten)]
    pub entity: E,
    pub relationships: EntityRelationships,
}

/// Lists records. `q` runs a text search; other parameters filter and page.
pub async fn get_all<R: Resource>(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ServiceError> {
    let list = ListParams::from_query(&params, R::Entity::schema())?;
    let repo = R::repository(&state);
    let records = match list.search.as_deref() {
        Some(text) => repo.search(text, &list.options).await?,
        None => repo.find_all(&list.filter, &list.options).await?,
    };
    debug!(resource = R::NAME, count = records.len(), "Listed records");
    Ok(success_response(records))
}

/// Runs a JSON query (`{filter, limit, skip, sort}`).
pub async fn query<R: Resource>(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ServiceError> {
    let query: FindQuery = parse_body(body)?;
    Ok(success_response(R::repository(&state).find_by_query(&query).await?))
}

pub async fn count<R: Resource>(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ServiceError> {
    let list = ListParams::from_query(&params, R::Entity::schema())?;
    let count = R::repository(&state).count(&list.filter).await?;
    Ok(success_response(serde_json::json!({ "count": count })))
}

pub async fn get_one<R: Resource>(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    let record = R::repository(&state)
        .find_by_id(&id)
        .await?
        .ok_or_else(|| not_found::<R>(&id))?;
    Ok(success_response(record))
}

pub async fn create_one<R: Resource>(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ServiceError> {
    let entity: R::Entity = parse_body(body)?;
    let created = R::repository(&state).create(entity, None).await?;
    Ok(created_response(created))
}

pub async fn update_one<R: Resource>(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<Value>,
) -> Result<Response, ServiceError> {
    ensure_matching_id(&id, &patch)?;
    let updated = R::repository(&state).update(&id, patch, None).await?;
    Ok(success_response(updated))
}

pub async fn delete_one<R: Resource>(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    if R::repository(&state).delete(&id, None).await? {
        Ok(no_content_response())
    } else {
        Err(not_found::<R>(&id))
    }
}

pub async fn get_one_with_relationships<R: Resource>(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    let entity = R::repository(&state)
        .find_by_id(&id)
        .await?
        .ok_or_else(|| not_found::<R>(&id))?;
    let relationships = state.services.relationships.find_all_for_entity(&id).await?;
    Ok(success_response(WithRelationships { entity, relationships }))
}

pub async fn create_one_with_relationships<R: ControlledResource>(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ServiceError> {
    let entity: R::Entity = parse_body(body)?;
    let created = R::controller(&state).create(entity).await?;
    let relationships = state.services.relationships.find_all_for_entity(created.id()).await?;
    Ok(created_response(WithRelationships {
        entity: created,
        relationships,
    }))
}

pub async fn update_one_with_relationships<R: ControlledResource>(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<Value>,
) -> Result<Response, ServiceError> {
    ensure_matching_id(&id, &patch)?;
    let updated = R::controller(&state).update(&id, patch).await?;
    let relationships = state.services.relationships.find_all_for_entity(&id).await?;
    Ok(success_response(WithRelationships {
        entity: updated,
        relationships,
    }))
}

pub async fn delete_one_with_relationships<R: ControlledResource>(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    if R::controller(&state).delete(&id).await? {
        Ok(no_content_response())
    } else {
        Err(not_found::<R>(&id))
    }
}

/// Plain CRUD routes for a resource.
pub fn crud_router<R: Resource>() -> Router<AppState> {
    Router::new()
        .route("/", get(get_all::<R>).post(create_one::<R>))
        .route("/count", get(count::<R>))
        .route("/query", post(query::<R>))
        .route(
            "/:id",
            get(get_one::<R>).put(update_one::<R>).delete(delete_one::<R>),
        )
}

/// CRUD routes whose writes go through the resource's controller.
pub fn controlled_router<R: ControlledResource>() -> Router<AppState> {
    Router::new()
        .route("/", get(get_all::<R>).post(create_one_with_relationships::<R>))
        .route("/count", get(count::<R>))
        .route("/query", post(query::<R>))
        .route(
            "/:id",
            get(get_one_with_relationships::<R>)
                .put(update_one_with_relationships::<R>)
                .delete(delete_one_with_relationships::<R>),
        )
}
