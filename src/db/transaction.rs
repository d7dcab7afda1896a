/*!
 * Transaction Coordinator
 *
 * Scoped transactions across every backend kind. A scope acquires a handle,
 * runs the caller's work with it, commits on success and rolls back on error.
 * Scopes nest by joining: an inner scope sees the outer handle through a
 * task-local and leaves finalization to the outermost scope.
 */

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use sea_orm::DatabaseTransaction;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::compensating::CompensationLog;
use super::key_value::PendingBatch;
use super::retry::RetryPolicy;
use super::{Backend, StorageBackend, StoreError};
use crate::errors::ServiceError;
use crate::providers::Monitor;

tokio::task_local! {
    static ACTIVE_TRANSACTION: TransactionHandle;
}

/// The handle of the innermost transaction scope running on this task.
pub fn current_transaction() -> Option<TransactionHandle> {
    ACTIVE_TRANSACTION.try_with(|handle| handle.clone()).ok()
}

/// Runs `future` with `handle` as the ambient transaction.
pub async fn scope_transaction<Fut, R>(handle: TransactionHandle, future: Fut) -> R
where
    Fut: Future<Output = R>,
{
    ACTIVE_TRANSACTION.scope(handle, future).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionStatus {
    Pending = 0,
    Committed = 1,
    Aborted = 2,
    Error = 3,
}

impl TransactionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransactionStatus::Pending,
            1 => TransactionStatus::Committed,
            2 => TransactionStatus::Aborted,
            _ => TransactionStatus::Error,
        }
    }
}

/// Backend-specific transaction state.
pub enum HandleKind {
    /// Native SQL transaction; taken out on commit or rollback.
    NativeSession(Mutex<Option<DatabaseTransaction>>),
    /// Buffered writes flushed as one batch on commit.
    PendingBatch(Mutex<PendingBatch>),
    /// Immediate writes plus the records needed to undo them.
    CompensationLog(Mutex<CompensationLog>),
}

impl HandleKind {
    fn name(&self) -> &'static str {
        match self {
            HandleKind::NativeSession(_) => "native_session",
            HandleKind::PendingBatch(_) => "pending_batch",
            HandleKind::CompensationLog(_) => "compensation_log",
        }
    }
}

struct HandleInner {
    id: Uuid,
    backend_id: String,
    status: AtomicU8,
    kind: HandleKind,
    /// Revision of each record as this transaction first read it, keyed by
    /// `collection/id`. Writes are checked against it.
    observed: DashMap<String, u64>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if TransactionStatus::from_u8(self.status.load(Ordering::SeqCst)) != TransactionStatus::Pending {
            return;
        }
        match &self.kind {
            HandleKind::CompensationLog(log) => {
                let outstanding = log.try_lock().map(|l| l.len()).unwrap_or(0);
                if outstanding > 0 {
                    error!(
                        transaction_id = %self.id,
                        outstanding,
                        "Compensating transaction dropped while pending; writes were not reverted"
                    );
                }
            }
            HandleKind::PendingBatch(_) => {
                debug!(transaction_id = %self.id, "Pending batch discarded");
            }
            HandleKind::NativeSession(_) => {
                debug!(transaction_id = %self.id, "Native session dropped; rolled back by the driver");
            }
        }
    }
}

/// Opaque, cheaply cloneable transaction scope marker.
#[derive(Clone)]
pub struct TransactionHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.inner.id)
            .field("backend_id", &self.inner.backend_id)
            .field("kind", &self.inner.kind.name())
            .field("status", &self.status())
            .finish()
    }
}

impl TransactionHandle {
    pub fn new(backend_id: &str, kind: HandleKind) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: Uuid::new_v4(),
                backend_id: backend_id.to_string(),
                status: AtomicU8::new(TransactionStatus::Pending as u8),
                kind,
                observed: DashMap::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn backend_id(&self) -> &str {
        &self.inner.backend_id
    }

    pub fn status(&self) -> TransactionStatus {
        TransactionStatus::from_u8(self.inner.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, status: TransactionStatus) {
        self.inner.status.store(status as u8, Ordering::SeqCst);
    }

    pub fn is_pending(&self) -> bool {
        self.status() == TransactionStatus::Pending
    }

    pub fn kind(&self) -> &HandleKind {
        &self.inner.kind
    }

    /// Remembers the revision a read returned. Later reads of the same
    /// record keep the first one.
    pub fn observe(&self, collection: &str, id: &str, revision: u64) {
        self.inner
            .observed
            .entry(observed_key(collection, id))
            .or_insert(revision);
    }

    /// Moves the remembered revision past this transaction's own write.
    pub fn advance(&self, collection: &str, id: &str, revision: u64) {
        self.inner.observed.insert(observed_key(collection, id), revision);
    }

    pub fn forget(&self, collection: &str, id: &str) {
        self.inner.observed.remove(&observed_key(collection, id));
    }

    pub fn observed_revision(&self, collection: &str, id: &str) -> Option<u64> {
        self.inner.observed.get(&observed_key(collection, id)).map(|r| *r)
    }

    /// Fails unless the handle is still open.
    pub fn ensure_pending(&self) -> Result<(), StoreError> {
        match self.status() {
            TransactionStatus::Pending => Ok(()),
            other => Err(StoreError::Transaction(format!(
                "transaction {} is {:?}",
                self.id(),
                other
            ))),
        }
    }

    pub fn native_session(&self) -> Result<&Mutex<Option<DatabaseTransaction>>, StoreError> {
        match &self.inner.kind {
            HandleKind::NativeSession(session) => Ok(session),
            other => Err(self.wrong_kind(other)),
        }
    }

    pub fn pending_batch(&self) -> Result<&Mutex<PendingBatch>, StoreError> {
        match &self.inner.kind {
            HandleKind::PendingBatch(batch) => Ok(batch),
            other => Err(self.wrong_kind(other)),
        }
    }

    pub fn compensation_log(&self) -> Result<&Mutex<CompensationLog>, StoreError> {
        match &self.inner.kind {
            HandleKind::CompensationLog(log) => Ok(log),
            other => Err(self.wrong_kind(other)),
        }
    }

    fn wrong_kind(&self, kind: &HandleKind) -> StoreError {
        StoreError::Transaction(format!(
            "transaction {} is a {} handle",
            self.id(),
            kind.name()
        ))
    }
}

fn observed_key(collection: &str, id: &str) -> String {
    format!("{}/{}", collection, id)
}

/// Per-scope options.
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Re-run the whole scope on `Conflict`. Only honored by the outermost scope.
    pub retry_on_conflict: bool,
    pub label: &'static str,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            retry_on_conflict: false,
            label: "transaction",
        }
    }
}

impl TransactionOptions {
    pub fn labeled(label: &'static str) -> Self {
        Self {
            label,
            ..Default::default()
        }
    }

    pub fn retrying(label: &'static str) -> Self {
        Self {
            retry_on_conflict: true,
            label,
        }
    }
}

/// Hands out transaction scopes on one backend.
#[derive(Clone)]
pub struct TransactionCoordinator {
    backend: Arc<Backend>,
    policy: RetryPolicy,
    log_transactions: bool,
    monitor: Arc<dyn Monitor>,
}

impl fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("backend", &self.backend)
            .field("policy", &self.policy)
            .field("log_transactions", &self.log_transactions)
            .finish()
    }
}

macro_rules! txn_log {
    ($enabled:expr, $($arg:tt)+) => {
        if $enabled {
            info!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

impl TransactionCoordinator {
    pub fn new(backend: Arc<Backend>, monitor: Arc<dyn Monitor>) -> Self {
        Self {
            backend,
            policy: RetryPolicy::default(),
            log_transactions: false,
            monitor,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Logs begin/commit/rollback at `info` instead of `debug`.
    pub fn with_transaction_logging(mut self, enabled: bool) -> Self {
        self.log_transactions = enabled;
        self
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Runs `f` inside a transaction scope.
    ///
    /// When a scope on the same backend is already active on this task, `f`
    /// joins it and the outer scope decides the outcome. Otherwise a new
    /// handle is started, committed when `f` returns `Ok` and rolled back
    /// when it returns `Err`. With `retry_on_conflict`, a `Conflict` from
    /// either `f` or the commit re-runs the scope per the retry policy.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let purchase = coordinator
    ///     .with_transaction(TransactionOptions::retrying("purchase.create"), |txn| {
    ///         let (purchases, inventory, purchase) = (purchases.clone(), inventory.clone(), purchase.clone());
    ///         async move {
    ///             let created = purchases.create(purchase, Some(&txn)).await?;
    ///             inventory.apply_purchase(&created.items, &txn).await?;
    ///             Ok(created)
    ///         }
    ///     })
    ///     .await?;
    /// ```
    pub async fn with_transaction<F, Fut, T>(
        &self,
        options: TransactionOptions,
        mut f: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut(TransactionHandle) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        if let Some(active) = current_transaction() {
            if self.backend.is_active(&active) {
                debug!(transaction_id = %active.id(), label = options.label, "Joining active transaction");
                return f(active).await;
            }
        }

        let mut retry = 0;
        loop {
            match self.run_once(&options, &mut f).await {
                Err(err) if options.retry_on_conflict && err.is_conflict() => {
                    match self.policy.delay(retry) {
                        Some(delay) => {
                            retry += 1;
                            warn!(
                                label = options.label,
                                retry,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "Transaction conflict, retrying"
                            );
                            self.monitor.increment("ledgerlink_db.transaction.retried");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            warn!(label = options.label, retries = retry, "Transaction conflict retries exhausted");
                            return Err(err);
                        }
                    }
                }
                other => return other,
            }
        }
    }

    /// Joins `txn` when given, otherwise behaves like [`Self::with_transaction`].
    pub async fn with_transaction_in<F, Fut, T>(
        &self,
        txn: Option<&TransactionHandle>,
        options: TransactionOptions,
        mut f: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut(TransactionHandle) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        match txn {
            Some(handle) => {
                if !self.backend.is_active(handle) {
                    return Err(ServiceError::TransactionRequired(format!(
                        "transaction {} is not active on this backend",
                        handle.id()
                    )));
                }
                scope_transaction(handle.clone(), f(handle.clone())).await
            }
            None => self.with_transaction(options, f).await,
        }
    }

    async fn run_once<F, Fut, T>(&self, options: &TransactionOptions, f: &mut F) -> Result<T, ServiceError>
    where
        F: FnMut(TransactionHandle) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let start = Instant::now();
        let handle = self.backend.begin().await?;
        let transaction_id = handle.id();
        self.monitor.increment("ledgerlink_db.transaction.started");
        txn_log!(self.log_transactions, transaction_id = %transaction_id, label = options.label, "Starting transaction");

        let result = scope_transaction(handle.clone(), f(handle.clone())).await;

        match result {
            Ok(value) => match self.backend.commit(&handle).await {
                Ok(()) => {
                    self.monitor.increment("ledgerlink_db.transaction.committed");
                    self.monitor
                        .observe("ledgerlink_db.transaction.duration", start.elapsed());
                    txn_log!(
                        self.log_transactions,
                        transaction_id = %transaction_id,
                        label = options.label,
                        "Transaction committed in {:?}",
                        start.elapsed()
                    );
                    Ok(value)
                }
                Err(err) => {
                    handle.set_status(TransactionStatus::Error);
                    self.monitor.increment("ledgerlink_db.transaction.failed");
                    warn!(transaction_id = %transaction_id, label = options.label, error = %err, "Commit failed");
                    Err(err.into())
                }
            },
            Err(err) => {
                self.monitor.increment("ledgerlink_db.transaction.rolled_back");
                match self.backend.rollback(&handle).await {
                    Ok(()) => {
                        txn_log!(
                            self.log_transactions,
                            transaction_id = %transaction_id,
                            label = options.label,
                            error = %err,
                            "Transaction rolled back after {:?}",
                            start.elapsed()
                        );
                        Err(err)
                    }
                    Err(StoreError::PartialRollback(detail)) => {
                        error!(
                            transaction_id = %transaction_id,
                            label = options.label,
                            cause = %err,
                            detail = %detail,
                            "Rollback incomplete; store may be inconsistent"
                        );
                        Err(ServiceError::PartialRollback(format!(
                            "{} (while rolling back: {})",
                            detail, err
                        )))
                    }
                    Err(rollback_err) => {
                        error!(
                            transaction_id = %transaction_id,
                            label = options.label,
                            cause = %err,
                            error = %rollback_err,
                            "Rollback failed"
                        );
                        Err(err)
                    }
                }
            }
        }
    }
}
