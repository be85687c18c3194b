use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use super::{window_start, AlertStore, CostStore, StoreError, StoreResult};
use crate::types::{Alert, AlertKind, CostRecord};

/// Thread-safe in-process storage for costs and alerts
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    // Keyed by (date, service) so iteration order is the range-query order.
    costs: BTreeMap<(NaiveDate, String), CostRecord>,
    alerts: Vec<Alert>,
    next_alert_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, MemoryInner>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, MemoryInner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl CostStore for MemoryStore {
    async fn upsert(&self, record: CostRecord) -> StoreResult<()> {
        let mut inner = self.write()?;
        inner
            .costs
            .insert((record.date, record.service.clone()), record);
        Ok(())
    }

    async fn get(&self, date: NaiveDate, service: &str) -> StoreResult<f64> {
        let inner = self.read()?;
        inner
            .costs
            .get(&(date, service.to_string()))
            .map(|r| r.amount)
            .ok_or_else(|| StoreError::NotFound {
                date,
                service: service.to_string(),
            })
    }

    async fn trailing_average(
        &self,
        service: &str,
        date: NaiveDate,
        window_days: u32,
    ) -> StoreResult<f64> {
        let start = window_start(date, window_days);
        let inner = self.read()?;

        let (sum, count) = inner
            .costs
            .range((start, String::new())..(date, String::new()))
            .filter(|((_, s), _)| s == service)
            .fold((0.0, 0usize), |(sum, n), (_, r)| (sum + r.amount, n + 1));

        if count == 0 {
            return Ok(0.0);
        }
        Ok(sum / count as f64)
    }

    async fn query_range(&self, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<CostRecord>> {
        if from > to {
            return Ok(Vec::new());
        }
        let inner = self.read()?;
        Ok(inner
            .costs
            .range((from, String::new())..)
            .take_while(|((d, _), _)| *d <= to)
            .map(|(_, r)| r.clone())
            .collect())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn append(
        &self,
        date: NaiveDate,
        service: &str,
        kind: AlertKind,
        message: String,
    ) -> StoreResult<Alert> {
        let mut inner = self.write()?;
        inner.next_alert_id += 1;

        let alert = Alert {
            id: inner.next_alert_id,
            date,
            service: service.to_string(),
            kind,
            message,
            created_at: Utc::now(),
        };
        inner.alerts.push(alert.clone());
        Ok(alert)
    }

    async fn query_range(&self, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<Alert>> {
        let inner = self.read()?;
        let mut alerts: Vec<Alert> = inner
            .alerts
            .iter()
            .filter(|a| a.date >= from && a.date <= to)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[tokio::test]
    async fn upsert_overwrites_same_key() {
        let store = MemoryStore::new();
        store.upsert(CostRecord::new(day(1), "compute", 1.0)).await.unwrap();
        store.upsert(CostRecord::new(day(1), "compute", 2.5).with_currency("EUR")).await.unwrap();

        let rows = CostStore::query_range(&store, day(1), day(1)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, 2.5);
        assert_eq!(rows[0].currency, "EUR");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get(day(1), "db").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn trailing_average_ignores_other_services_and_same_day() {
        let store = MemoryStore::new();
        store.upsert(CostRecord::new(day(5), "db", 2.0)).await.unwrap();
        store.upsert(CostRecord::new(day(6), "db", 4.0)).await.unwrap();
        store.upsert(CostRecord::new(day(6), "network", 100.0)).await.unwrap();
        store.upsert(CostRecord::new(day(8), "db", 1000.0)).await.unwrap();

        let avg = store.trailing_average("db", day(8), 7).await.unwrap();
        assert!((avg - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn alerts_get_increasing_ids() {
        let store = MemoryStore::new();
        let a = store.append(day(1), "db", AlertKind::Anomaly, "one".into()).await.unwrap();
        let b = store.append(day(1), "db", AlertKind::Anomaly, "two".into()).await.unwrap();
        assert!(b.id > a.id);
    }
}
