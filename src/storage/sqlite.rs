//! SQLite persistence for daily costs and alerts.
//!
//! All SQL lives here. Calls check a connection out of an r2d2 pool and run
//! on the blocking pool. A file database runs in WAL mode, so request
//! handlers read on their own connections while the scheduler writes.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};

use super::{window_start, AlertStore, CostStore, StoreError, StoreResult};
use crate::types::{Alert, AlertKind, CostRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS daily_costs (
    date       TEXT NOT NULL,
    service    TEXT NOT NULL,
    amount     REAL NOT NULL CHECK (amount >= 0),
    currency   TEXT NOT NULL DEFAULT 'USD',
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    PRIMARY KEY (date, service)
);

CREATE TABLE IF NOT EXISTS alerts (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    date       TEXT NOT NULL,
    service    TEXT NOT NULL,
    type       TEXT NOT NULL,
    message    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_alerts_date ON alerts (date);
";

pub const DEFAULT_POOL_SIZE: u32 = 8;

/// How long a connection waits on another writer's lock before failing
const BUSY_TIMEOUT_MS: u32 = 5_000;

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with_pool_size(path, DEFAULT_POOL_SIZE)
    }

    /// Open the file database with up to `max_connections` pooled connections.
    pub fn open_with_pool_size(path: impl AsRef<Path>, max_connections: u32) -> StoreResult<Self> {
        let path = path.as_ref();

        // Journal mode is persistent; switch once before the pool opens its
        // connections so they never race for the exclusive lock it takes.
        let bootstrap = Connection::open(path)?;
        bootstrap.execute_batch(&format!(
            "PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}; PRAGMA journal_mode = WAL;"
        ))?;
        bootstrap.execute_batch(SCHEMA)?;
        drop(bootstrap);

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};"))
        });
        let pool = Pool::builder()
            .max_size(max_connections.max(1))
            .connection_timeout(Duration::from_secs(10))
            .build(manager)?;

        tracing::debug!(path = %path.display(), max_connections, "Opened sqlite pool");
        Ok(Self { pool })
    }

    /// In-memory database, used by tests and throwaway runs.
    ///
    /// Each in-memory connection is its own database, so the pool holds
    /// exactly one connection and never recycles it.
    pub fn in_memory() -> StoreResult<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .min_idle(Some(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .build(SqliteConnectionManager::memory())?;
        pool.get()?.execute_batch(SCHEMA)?;
        Ok(Self { pool })
    }

    /// Upper bound on connections used concurrently
    pub fn max_connections(&self) -> u32 {
        self.pool.max_size()
    }

    /// Run `f` on a pooled connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&*conn)
        })
        .await?
    }
}

fn parse_kind(raw: String) -> rusqlite::Result<AlertKind> {
    AlertKind::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown alert type {raw:?}").into(),
        )
    })
}

#[async_trait]
impl CostStore for SqliteStore {
    async fn upsert(&self, record: CostRecord) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO daily_costs (date, service, amount, currency)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (date, service) DO UPDATE
                 SET amount = excluded.amount, currency = excluded.currency",
                params![record.date, record.service, record.amount, record.currency],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, date: NaiveDate, service: &str) -> StoreResult<f64> {
        let service = service.to_string();
        self.with_conn(move |conn| {
            let amount: Option<f64> = conn
                .query_row(
                    "SELECT amount FROM daily_costs WHERE date = ?1 AND service = ?2",
                    params![date, service],
                    |row| row.get(0),
                )
                .optional()?;
            amount.ok_or(StoreError::NotFound { date, service })
        })
        .await
    }

    async fn trailing_average(
        &self,
        service: &str,
        date: NaiveDate,
        window_days: u32,
    ) -> StoreResult<f64> {
        let service = service.to_string();
        let start = window_start(date, window_days);
        self.with_conn(move |conn| {
            let avg: Option<f64> = conn.query_row(
                "SELECT AVG(amount) FROM daily_costs
                 WHERE service = ?1 AND date < ?2 AND date >= ?3",
                params![service, date, start],
                |row| row.get(0),
            )?;
            Ok(avg.unwrap_or(0.0))
        })
        .await
    }

    async fn query_range(&self, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<CostRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT date, service, amount, currency FROM daily_costs
                 WHERE date BETWEEN ?1 AND ?2
                 ORDER BY date ASC, service ASC",
            )?;
            let rows = stmt
                .query_map(params![from, to], |row| {
                    Ok(CostRecord {
                        date: row.get(0)?,
                        service: row.get(1)?,
                        amount: row.get(2)?,
                        currency: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

#[async_trait]
impl AlertStore for SqliteStore {
    async fn append(
        &self,
        date: NaiveDate,
        service: &str,
        kind: AlertKind,
        message: String,
    ) -> StoreResult<Alert> {
        let service = service.to_string();
        self.with_conn(move |conn| {
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO alerts (date, service, type, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![date, service, kind.as_str(), message, created_at],
            )?;
            Ok(Alert {
                id: conn.last_insert_rowid(),
                date,
                service,
                kind,
                message,
                created_at,
            })
        })
        .await
    }

    async fn query_range(&self, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<Alert>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, date, service, type, message, created_at FROM alerts
                 WHERE date BETWEEN ?1 AND ?2
                 ORDER BY created_at DESC, id DESC",
            )?;
            let rows = stmt
                .query_map(params![from, to], |row| {
                    Ok(Alert {
                        id: row.get(0)?,
                        date: row.get(1)?,
                        service: row.get(2)?,
                        kind: parse_kind(row.get(3)?)?,
                        message: row.get(4)?,
                        created_at: row.get::<_, DateTime<Utc>>(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[tokio::test]
    async fn upsert_on_conflict_keeps_one_row() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert(CostRecord::new(day(2), "storage", 0.8)).await.unwrap();
        store.upsert(CostRecord::new(day(2), "storage", 0.9)).await.unwrap();

        let rows = CostStore::query_range(&store, day(1), day(3)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, 0.9);
        assert_eq!(store.get(day(2), "storage").await.unwrap(), 0.9);
    }

    #[tokio::test]
    async fn trailing_average_without_history_is_zero() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert(CostRecord::new(day(10), "compute", 50.0)).await.unwrap();
        assert_eq!(store.trailing_average("compute", day(10), 7).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn alert_round_trips_through_table() {
        let store = SqliteStore::in_memory().unwrap();
        let appended = store
            .append(day(4), "db", AlertKind::Anomaly, "db cost spike".into())
            .await
            .unwrap();

        let alerts = AlertStore::query_range(&store, day(4), day(4)).await.unwrap();
        assert_eq!(alerts, vec![appended]);
    }

    #[tokio::test]
    async fn in_memory_store_is_one_shared_database() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.max_connections(), 1);

        let writes: Vec<_> = (1..=8)
            .map(|d| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.upsert(CostRecord::new(day(d), "compute", f64::from(d))).await
                })
            })
            .collect();
        for write in writes {
            write.await.unwrap().unwrap();
        }

        let rows = CostStore::query_range(&store, day(1), day(8)).await.unwrap();
        assert_eq!(rows.len(), 8);
    }

    #[tokio::test]
    async fn reads_proceed_while_a_write_transaction_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("costs.db")).unwrap();
        assert!(store.max_connections() > 1);
        store.upsert(CostRecord::new(day(1), "network", 0.6)).await.unwrap();

        // Hold the write lock on one pooled connection, as a slow scheduler write would.
        let writer = store.pool.get().unwrap();
        writer
            .execute_batch(
                "BEGIN IMMEDIATE;
                 INSERT INTO daily_costs (date, service, amount) VALUES ('2024-03-05', 'db', 9.0);",
            )
            .unwrap();

        let read = tokio::time::timeout(Duration::from_secs(5), store.get(day(1), "network"))
            .await
            .expect("read blocked behind the open write transaction");
        assert_eq!(read.unwrap(), 0.6);

        let uncommitted = store.get(day(5), "db").await.unwrap_err();
        assert!(uncommitted.is_not_found());

        writer.execute_batch("COMMIT;").unwrap();
        drop(writer);
        assert_eq!(store.get(day(5), "db").await.unwrap(), 9.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reads_and_writes_on_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_with_pool_size(dir.path().join("costs.db"), 4).unwrap();

        let tasks: Vec<_> = (0..32u32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let date = day(1 + i % 7);
                    store.upsert(CostRecord::new(date, "compute", f64::from(i))).await?;
                    store.trailing_average("compute", day(8), 7).await?;
                    CostStore::query_range(&store, day(1), day(7)).await.map(|_| ())
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let rows = CostStore::query_range(&store, day(1), day(7)).await.unwrap();
        assert_eq!(rows.len(), 7);
    }

    #[tokio::test]
    async fn reopening_file_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("costs.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert(CostRecord::new(day(1), "network", 0.6)).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get(day(1), "network").await.unwrap(), 0.6);
    }
}
