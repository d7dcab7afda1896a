//! Document store on a SQL database via sea-orm.
//!
//! Every collection lives in the shared `documents` table keyed by
//! `(collection, id)`. Bodies are stored as JSON text. Filters push the id
//! and string equality on the schema's indexed paths down to SQL, then
//! re-check the whole filter in-process. Transactions are native database
//! transactions.

use std::fmt;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::{counter, histogram};
use sea_orm::sea_query::{Expr, Index};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Schema, Statement, TransactionTrait,
};
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::filter::{Condition, Filter};
use super::transaction::{HandleKind, TransactionHandle, TransactionStatus};
use super::{BackendKind, BackendSettings, StorageBackend, StoreError, StoredDocument};
use crate::entities::document;
use crate::schema::{EntitySchema, NativeSchema};

/// Runs `$body` with `$conn` bound to the transaction's connection when a
/// handle is given, otherwise to the pool. The body is cut off after the
/// configured statement timeout.
macro_rules! with_conn {
    ($self:ident, $txn:expr, |$conn:ident| $body:expr) => {{
        let timeout = $self.settings.statement_timeout;
        let bounded = async {
            match $txn {
                Some(handle) => {
                    handle.ensure_pending()?;
                    let session = handle.native_session()?.lock().await;
                    let $conn = session.as_ref().ok_or_else(|| {
                        StoreError::Transaction(format!("transaction {} already finished", handle.id()))
                    })?;
                    $body
                }
                None => {
                    let $conn = $self.pool().await?;
                    $body
                }
            }
        };
        match tokio::time::timeout(timeout, bounded).await {
            Ok(result) => result,
            Err(_) => {
                counter!("ledgerlink_db.documentstore.statement.timeout", 1);
                Err(StoreError::Unavailable(format!("statement exceeded {:?}", timeout)))
            }
        }
    }};
}

pub struct SqlDocumentBackend {
    id: String,
    settings: BackendSettings,
    pool: OnceCell<DatabaseConnection>,
    /// Indexed JSON paths per collection, filled by `ensure_collection`.
    indexed_paths: DashMap<String, Vec<String>>,
}

impl fmt::Debug for SqlDocumentBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlDocumentBackend")
            .field("id", &self.id)
            .field("max_connections", &self.settings.max_connections)
            .finish()
    }
}

fn to_document(model: document::Model) -> Result<StoredDocument, StoreError> {
    Ok(StoredDocument {
        id: model.id,
        revision: u64::try_from(model.revision)
            .map_err(|_| StoreError::Corrupt(format!("negative revision {}", model.revision)))?,
        unique_key: model.unique_key,
        body: serde_json::from_str(&model.body)?,
    })
}

/// Restricts the SQL query to the ids the filter names, when it names any.
fn id_restriction(filter: &Filter) -> Option<Vec<String>> {
    filter.clauses().iter().find_map(|clause| {
        if clause.path != "id" {
            return None;
        }
        match &clause.condition {
            Condition::Eq(Value::String(id)) => Some(vec![id.clone()]),
            Condition::In(values) => Some(
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        }
    })
}

async fn fetch_one<C: ConnectionTrait>(
    conn: &C,
    collection: &str,
    id: &str,
) -> Result<Option<StoredDocument>, StoreError> {
    document::Entity::find_by_id((collection.to_string(), id.to_string()))
        .one(conn)
        .await?
        .map(to_document)
        .transpose()
}

/// Paths come from schema declarations; anything else is never spliced
/// into SQL.
fn is_plain_path(path: &str) -> bool {
    !path.is_empty()
        && path
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

/// SQL expression reading the text at `path` inside the JSON body.
fn json_text(backend: DatabaseBackend, path: &str) -> String {
    match backend {
        DatabaseBackend::Postgres => format!("(body::jsonb #>> '{{{}}}')", path.replace('.', ",")),
        DatabaseBackend::MySql => format!("JSON_UNQUOTE(JSON_EXTRACT(body, '$.{}'))", path),
        _ => format!("json_extract(body, '$.{}')", path),
    }
}

/// String values an indexed clause can be matched against in SQL.
fn indexed_strings(condition: &Condition) -> Option<Vec<String>> {
    match condition {
        Condition::Eq(Value::String(value)) => Some(vec![value.clone()]),
        Condition::In(values) if values.iter().all(Value::is_string) => {
            Some(values.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        }
        _ => None,
    }
}

async fn fetch_many<C: ConnectionTrait>(
    conn: &C,
    collection: &str,
    filter: &Filter,
    indexed: &[String],
) -> Result<Vec<StoredDocument>, StoreError> {
    let mut query = document::Entity::find().filter(document::Column::Collection.eq(collection));
    if let Some(ids) = id_restriction(filter) {
        query = query.filter(document::Column::Id.is_in(ids));
    }
    let backend = conn.get_database_backend();
    for clause in filter.clauses() {
        if !indexed.contains(&clause.path) || !is_plain_path(&clause.path) {
            continue;
        }
        if let Some(values) = indexed_strings(&clause.condition) {
            query = query.filter(Expr::expr(Expr::cust(json_text(backend, &clause.path))).is_in(values));
        }
    }
    let rows = query.order_by_asc(document::Column::Id).all(conn).await?;

    let mut docs = Vec::with_capacity(rows.len());
    for row in rows {
        let doc = to_document(row)?;
        if filter.matches(&doc.body) {
            docs.push(doc);
        }
    }
    Ok(docs)
}

async fn insert_row<C: ConnectionTrait>(
    conn: &C,
    collection: &str,
    doc: StoredDocument,
) -> Result<(), StoreError> {
    let row = document::ActiveModel {
        collection: Set(collection.to_string()),
        id: Set(doc.id),
        revision: Set(doc.revision as i64),
        unique_key: Set(doc.unique_key),
        body: Set(serde_json::to_string(&doc.body)?),
    };
    document::Entity::insert(row)
        .exec_without_returning(conn)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::Duplicate(msg) => StoreError::Duplicate(format!("{}: {}", collection, msg)),
            other => other,
        })?;
    Ok(())
}

async fn replace_row<C: ConnectionTrait>(
    conn: &C,
    collection: &str,
    doc: StoredDocument,
    expected_revision: u64,
) -> Result<(), StoreError> {
    let result = document::Entity::update_many()
        .col_expr(document::Column::Revision, Expr::value(doc.revision as i64))
        .col_expr(document::Column::UniqueKey, Expr::value(doc.unique_key.clone()))
        .col_expr(document::Column::Body, Expr::value(serde_json::to_string(&doc.body)?))
        .filter(document::Column::Collection.eq(collection))
        .filter(document::Column::Id.eq(doc.id.as_str()))
        .filter(document::Column::Revision.eq(expected_revision as i64))
        .exec(conn)
        .await?;

    if result.rows_affected > 0 {
        return Ok(());
    }
    match fetch_one(conn, collection, &doc.id).await? {
        Some(current) => Err(StoreError::Conflict(format!(
            "{} {} was modified concurrently (expected revision {}, found {})",
            collection, doc.id, expected_revision, current.revision
        ))),
        None => Err(StoreError::NotFound {
            collection: collection.to_string(),
            id: doc.id,
        }),
    }
}

async fn delete_row<C: ConnectionTrait>(conn: &C, collection: &str, id: &str) -> Result<bool, StoreError> {
    let result = document::Entity::delete_many()
        .filter(document::Column::Collection.eq(collection))
        .filter(document::Column::Id.eq(id))
        .exec(conn)
        .await?;
    Ok(result.rows_affected > 0)
}

impl SqlDocumentBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self {
            id: format!("documentstore-{}", Uuid::new_v4()),
            settings,
            pool: OnceCell::new(),
            indexed_paths: DashMap::new(),
        }
    }

    fn indexed(&self, collection: &str) -> Vec<String> {
        self.indexed_paths
            .get(collection)
            .map(|paths| paths.clone())
            .unwrap_or_default()
    }

    /// Expression indexes over the collection's indexed paths.
    async fn create_path_indexes(&self, collection: &str, paths: &[String]) -> Result<(), StoreError> {
        let db = self.pool().await?;
        let backend = db.get_database_backend();
        if backend == DatabaseBackend::MySql {
            return Ok(());
        }
        for path in paths.iter().filter(|p| is_plain_path(p) && is_plain_path(collection)) {
            let name = format!("idx_documents_{}_{}", collection, path.replace('.', "_"));
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS {} ON documents (collection, ({}))",
                name,
                json_text(backend, path)
            );
            db.execute(Statement::from_string(backend, sql)).await?;
        }
        Ok(())
    }

    fn connect_options(&self) -> ConnectOptions {
        let mut opt = ConnectOptions::new(self.settings.uri.clone());
        opt.max_connections(self.settings.max_connections)
            .min_connections(self.settings.min_connections)
            .connect_timeout(self.settings.connect_timeout)
            .acquire_timeout(self.settings.acquire_timeout)
            .idle_timeout(self.settings.idle_timeout)
            .sqlx_logging(false);
        opt
    }

    async fn pool(&self) -> Result<&DatabaseConnection, StoreError> {
        self.pool
            .get_or_try_init(|| async {
                info!(
                    max_connections = self.settings.max_connections,
                    "Connecting to document database"
                );
                let db = self
                    .settings
                    .backoff
                    .run("database connect", || Database::connect(self.connect_options()))
                    .await
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                Self::create_documents_table(&db).await?;
                Ok::<_, StoreError>(db)
            })
            .await
    }

    async fn create_documents_table(db: &DatabaseConnection) -> Result<(), StoreError> {
        let builder = db.get_database_backend();
        let schema = Schema::new(builder);

        let mut table = schema.create_table_from_entity(document::Entity);
        table.if_not_exists();
        db.execute(builder.build(&table)).await?;

        let mut unique = Index::create();
        unique
            .name("idx_documents_unique_key")
            .table(document::Entity)
            .col(document::Column::Collection)
            .col(document::Column::UniqueKey)
            .unique()
            .if_not_exists();
        db.execute(builder.build(&unique)).await?;
        debug!("documents table ready");
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SqlDocumentBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DocumentStore
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<(), StoreError> {
        self.pool().await.map(|_| ())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.pool()
            .await?
            .ping()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn close(&self) -> Result<(), StoreError> {
        if let Some(db) = self.pool.get() {
            db.clone().close().await?;
            info!("Document database connection closed");
        }
        Ok(())
    }

    async fn ensure_collection(&self, schema: &EntitySchema) -> Result<(), StoreError> {
        self.pool().await?;
        if let NativeSchema::Sql(table) = schema.compile(BackendKind::DocumentStore) {
            self.create_path_indexes(&table.collection, &table.indexed_paths).await?;
            debug!(
                collection = %table.collection,
                enforces_unique = table.enforces_unique,
                indexed_paths = ?table.indexed_paths,
                "Collection mapped onto documents table"
            );
            self.indexed_paths.insert(table.collection, table.indexed_paths);
        }
        Ok(())
    }

    async fn begin(&self) -> Result<TransactionHandle, StoreError> {
        let txn = self.pool().await?.begin().await?;
        counter!("ledgerlink_db.documentstore.transaction.started", 1);
        Ok(TransactionHandle::new(
            &self.id,
            HandleKind::NativeSession(Mutex::new(Some(txn))),
        ))
    }

    async fn commit(&self, txn: &TransactionHandle) -> Result<(), StoreError> {
        txn.ensure_pending()?;
        let session = txn
            .native_session()?
            .lock()
            .await
            .take()
            .ok_or_else(|| StoreError::Transaction(format!("transaction {} already finished", txn.id())))?;

        let start = Instant::now();
        match session.commit().await {
            Ok(()) => {
                histogram!("ledgerlink_db.documentstore.commit.duration", start.elapsed());
                txn.set_status(TransactionStatus::Committed);
                Ok(())
            }
            Err(err) => {
                txn.set_status(TransactionStatus::Error);
                warn!(transaction_id = %txn.id(), error = %err, "Commit failed");
                Err(err.into())
            }
        }
    }

    async fn rollback(&self, txn: &TransactionHandle) -> Result<(), StoreError> {
        if !txn.is_pending() {
            return Ok(());
        }
        let session = txn.native_session()?.lock().await.take();
        txn.set_status(TransactionStatus::Aborted);
        if let Some(session) = session {
            session.rollback().await?;
        }
        Ok(())
    }

    async fn get(
        &self,
        collection: &str,
        id: &str,
        txn: Option<&TransactionHandle>,
    ) -> Result<Option<StoredDocument>, StoreError> {
        with_conn!(self, txn, |conn| fetch_one(conn, collection, id).await)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        txn: Option<&TransactionHandle>,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let indexed = self.indexed(collection);
        with_conn!(self, txn, |conn| fetch_many(conn, collection, filter, &indexed).await)
    }

    async fn insert(
        &self,
        collection: &str,
        doc: StoredDocument,
        txn: Option<&TransactionHandle>,
    ) -> Result<(), StoreError> {
        with_conn!(self, txn, |conn| insert_row(conn, collection, doc).await)
    }

    async fn replace(
        &self,
        collection: &str,
        doc: StoredDocument,
        expected_revision: u64,
        txn: Option<&TransactionHandle>,
    ) -> Result<(), StoreError> {
        with_conn!(self, txn, |conn| replace_row(conn, collection, doc, expected_revision).await)
    }

    async fn remove(
        &self,
        collection: &str,
        id: &str,
        txn: Option<&TransactionHandle>,
    ) -> Result<bool, StoreError> {
        with_conn!(self, txn, |conn| delete_row(conn, collection, id).await)
    }
}
