#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use ledgerlink_core::{
    cache::CacheSettings,
    db::{
        connect_backend, Backend, BackendKind, BackendSettings, BackoffPolicy, KeyValueBackend,
        MemoryDocumentClient, MemoryKvClient, RetryPolicy, StorageBackend, TransactionCoordinator,
    },
    models::{Axis, Item, PurchaseLine, PurchaseStatus, Purchase, Sale, SaleLine, SaleStatus},
    providers::MetricsMonitor,
    services::{RelationshipAwareController, ServiceContainer, ServiceFactory},
    storage::MemoryObjectStorage,
    AppState,
};
use rust_decimal::Decimal;
use serde_json::Value;
use tower::ServiceExt;

pub const ALL_BACKENDS: [BackendKind; 3] = [BackendKind::DocumentStore, BackendKind::KeyValue, BackendKind::OtherDoc];

/// Every service wired over one fresh backend.
pub struct TestApp {
    pub kind: BackendKind,
    pub backend: Arc<Backend>,
    pub storage: Arc<MemoryObjectStorage>,
    pub services: ServiceContainer,
    /// Set for the non-transactional document backend, to simulate outages.
    pub doc_client: Option<Arc<MemoryDocumentClient>>,
}

pub async fn backend(kind: BackendKind) -> (Arc<Backend>, Option<Arc<MemoryDocumentClient>>) {
    let (backend, doc_client) = match kind {
        BackendKind::DocumentStore => {
            let mut settings = BackendSettings::new(kind, "sqlite::memory:");
            // One connection, so every handle sees the same in-memory database.
            settings.max_connections = 1;
            settings.min_connections = 1;
            settings.backoff = BackoffPolicy::immediate(1);
            (connect_backend(&settings).await.expect("connect sqlite"), None)
        }
        BackendKind::KeyValue => {
            let client = Arc::new(MemoryKvClient::new("local"));
            let backend = Backend::KeyValue(
                KeyValueBackend::new(client, BackoffPolicy::immediate(3)).with_table_poll_interval(Duration::ZERO),
            );
            backend.connect().await.expect("connect key-value");
            (backend, None)
        }
        BackendKind::OtherDoc => {
            let client = Arc::new(MemoryDocumentClient::new());
            let backend = Backend::other_doc(client.clone(), BackoffPolicy::immediate(3));
            backend.connect().await.expect("connect document store");
            (backend, Some(client))
        }
    };
    backend.ensure_schema().await.expect("ensure schema");
    (Arc::new(backend), doc_client)
}

impl TestApp {
    pub async fn new(kind: BackendKind) -> Self {
        Self::with_cache(kind, CacheSettings::default()).await
    }

    pub async fn with_cache(kind: BackendKind, cache: CacheSettings) -> Self {
        let (backend, doc_client) = backend(kind).await;
        let storage = Arc::new(MemoryObjectStorage::new());
        let coordinator = TransactionCoordinator::new(backend.clone(), Arc::new(MetricsMonitor))
            .with_retry_policy(RetryPolicy::immediate());
        let factory = ServiceFactory::with_coordinator(backend.clone(), storage.clone(), Arc::new(coordinator), cache);
        Self {
            kind,
            backend,
            storage,
            services: ServiceContainer::new(&factory),
            doc_client,
        }
    }

    pub fn router(&self) -> Router {
        ledgerlink_core::router(AppState::new(self.services.clone()))
    }

    /// Sends one request through the router and decodes the JSON reply.
    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).unwrap())
            }
            None => Body::empty(),
        };
        let response = self.router().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    pub async fn item(&self, name: &str, axis: Axis, amount: f64) -> Item {
        self.services
            .items
            .create(Item::new(name, axis).with_measurement(axis, amount))
            .await
            .expect("create item")
    }

    pub async fn stored_item(&self, id: &str) -> Item {
        self.services
            .repos
            .items
            .find_by_id(id)
            .await
            .expect("read item")
            .expect("item exists")
    }

    pub async fn stock(&self, id: &str, axis: Axis) -> f64 {
        self.stored_item(id).await.measurements.get(axis)
    }

    pub async fn receive(&self, lines: Vec<PurchaseLine>) -> Purchase {
        self.services
            .purchases
            .create(Purchase::new("Acme Supply", PurchaseStatus::Received, lines))
            .await
            .expect("create purchase")
    }

    pub async fn sell(&self, lines: Vec<SaleLine>) -> Sale {
        self.services
            .sales
            .create(Sale::new("Walk-in", SaleStatus::Completed, lines))
            .await
            .expect("create sale")
    }
}

pub fn line(item: &Item, axis: Axis, amount: f64, cost_per_unit: Decimal) -> PurchaseLine {
    PurchaseLine::inventory(&item.id, axis, amount, cost_per_unit)
}

pub fn sold(item: &Item, axis: Axis, amount: f64, price: Decimal) -> SaleLine {
    SaleLine::new(&item.id, axis, amount, price)
}
