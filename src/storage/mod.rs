pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;

use crate::config::{StorageBackend, StorageConfig};
use crate::types::{Alert, AlertKind, CostRecord};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Failures surfaced by the cost and alert stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no cost recorded for {service} on {date}")]
    NotFound { date: NaiveDate, service: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Keyed daily cost storage.
///
/// Every call is atomic on its own; nothing here spans keys. Callers that
/// run concurrently (the scheduler and request handlers) rely only on that.
#[async_trait]
pub trait CostStore: Send + Sync {
    /// Insert the record, or replace amount and currency of the record that
    /// already holds its `(date, service)` key.
    async fn upsert(&self, record: CostRecord) -> StoreResult<()>;

    /// Amount recorded for `service` on `date`.
    async fn get(&self, date: NaiveDate, service: &str) -> StoreResult<f64>;

    /// Mean amount for `service` over days in `[date - window_days, date)`.
    ///
    /// Days without a record are left out, not counted as zero. Returns
    /// `0.0` when no record falls in the window.
    async fn trailing_average(
        &self,
        service: &str,
        date: NaiveDate,
        window_days: u32,
    ) -> StoreResult<f64>;

    /// Records with `from <= date <= to`, ordered by date then service.
    async fn query_range(&self, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<CostRecord>>;
}

/// Append-only alert log.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Persist a new alert, assigning its id and creation time.
    async fn append(
        &self,
        date: NaiveDate,
        service: &str,
        kind: AlertKind,
        message: String,
    ) -> StoreResult<Alert>;

    /// Alerts dated within `[from, to]`, newest first.
    async fn query_range(&self, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<Alert>>;
}

/// Both stores behind one handle, as the configured backend provides them.
#[derive(Clone)]
pub struct Stores {
    pub costs: Arc<dyn CostStore>,
    pub alerts: Arc<dyn AlertStore>,
}

impl Stores {
    pub fn from_backend<S>(store: Arc<S>) -> Self
    where
        S: CostStore + AlertStore + 'static,
    {
        Self {
            costs: store.clone(),
            alerts: store,
        }
    }
}

/// Open the backend selected in the configuration
pub fn open(config: &StorageConfig) -> Result<Stores> {
    let stores = match config.backend {
        StorageBackend::Memory => Stores::from_backend(Arc::new(MemoryStore::new())),
        StorageBackend::Sqlite => {
            Stores::from_backend(Arc::new(SqliteStore::open_with_pool_size(
                &config.sqlite_path,
                config.pool_size,
            )?))
        }
    };

    tracing::info!(backend = ?config.backend, "Initialized storage");
    Ok(stores)
}

/// First day of the trailing window ending (exclusive) at `date`.
pub(crate) fn window_start(date: NaiveDate, window_days: u32) -> NaiveDate {
    date.checked_sub_days(chrono::Days::new(u64::from(window_days)))
        .unwrap_or(NaiveDate::MIN)
}
