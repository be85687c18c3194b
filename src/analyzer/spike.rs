use std::sync::Arc;

use chrono::NaiveDate;

use crate::config::DetectorConfig;
use crate::storage::{AlertStore, CostStore, StoreResult};
use crate::types::{Alert, AlertKind};
use super::{DEFAULT_SPIKE_MULTIPLIER, DEFAULT_WINDOW_DAYS};

/// Trailing-average spike detection.
/// Compares each service's cost for a day against the mean of the days before
/// it and appends an alert when the day exceeds `multiplier` times that mean.
pub struct SpikeDetector {
    costs: Arc<dyn CostStore>,
    alerts: Arc<dyn AlertStore>,
    services: Vec<String>,
    window_days: u32,
    multiplier: f64,
}

/// Outcome of one evaluation pass
#[derive(Debug, Default, Clone)]
pub struct DetectionReport {
    pub date: Option<NaiveDate>,
    /// Alerts appended during this pass
    pub alerts: Vec<Alert>,
    /// Services skipped because the day had no cost sample
    pub missing: Vec<String>,
}

impl DetectionReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

impl SpikeDetector {
    pub fn new(
        costs: Arc<dyn CostStore>,
        alerts: Arc<dyn AlertStore>,
        services: Vec<String>,
    ) -> Self {
        Self {
            costs,
            alerts,
            services,
            window_days: DEFAULT_WINDOW_DAYS,
            multiplier: DEFAULT_SPIKE_MULTIPLIER,
        }
    }

    pub fn with_config(mut self, config: &DetectorConfig) -> Self {
        self.window_days = config.window_days;
        self.multiplier = config.spike_multiplier;
        self
    }

    /// The spike rule. A zero average means no history and never fires.
    pub fn is_spike(&self, today: f64, average: f64) -> bool {
        average > 0.0 && today > self.multiplier * average
    }

    pub fn message(&self, service: &str, today: f64, average: f64) -> String {
        format!(
            "{} cost spike: today={:.2}, {}d_avg={:.2}",
            service, today, self.window_days, average
        )
    }

    /// Evaluate every tracked service for `date`.
    ///
    /// A service with no sample for the day is skipped and listed in the
    /// report; store failures abort the pass.
    pub async fn evaluate(&self, date: NaiveDate) -> StoreResult<DetectionReport> {
        let mut report = DetectionReport {
            date: Some(date),
            ..Default::default()
        };

        for service in &self.services {
            let today = match self.costs.get(date, service).await {
                Ok(amount) => amount,
                Err(e) if e.is_not_found() => {
                    tracing::warn!(%date, service = %service, "No cost sample, skipping detection");
                    report.missing.push(service.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };

            let average = self
                .costs
                .trailing_average(service, date, self.window_days)
                .await?;

            if !self.is_spike(today, average) {
                tracing::debug!(%date, service = %service, today, average, "Within baseline");
                continue;
            }

            let message = self.message(service, today, average);
            let alert = self
                .alerts
                .append(date, service, AlertKind::Anomaly, message)
                .await?;
            tracing::warn!(
                %date,
                service = %service,
                alert_id = alert.id,
                message = %alert.message,
                "Cost anomaly detected"
            );
            report.alerts.push(alert);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::CostRecord;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn detector(store: &Arc<MemoryStore>, services: &[&str]) -> SpikeDetector {
        SpikeDetector::new(
            store.clone(),
            store.clone(),
            services.iter().map(|s| s.to_string()).collect(),
        )
    }

    async fn seed(store: &MemoryStore, service: &str, days: std::ops::RangeInclusive<u32>, amount: f64) {
        for d in days {
            store.upsert(CostRecord::new(day(d), service, amount)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn exactly_at_threshold_is_not_a_spike() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "compute", 1..=7, 10.0).await;
        store.upsert(CostRecord::new(day(8), "compute", 15.0)).await.unwrap();

        let report = detector(&store, &["compute"]).evaluate(day(8)).await.unwrap();
        assert!(report.alerts.is_empty());
    }

    #[tokio::test]
    async fn just_above_threshold_raises_alert_with_evidence() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "compute", 1..=7, 10.0).await;
        store.upsert(CostRecord::new(day(8), "compute", 15.01)).await.unwrap();

        let report = detector(&store, &["compute"]).evaluate(day(8)).await.unwrap();
        assert_eq!(report.alerts.len(), 1);
        let alert = &report.alerts[0];
        assert_eq!(alert.kind, AlertKind::Anomaly);
        assert!(alert.message.contains("15.01"));
        assert!(alert.message.contains("10.00"));
    }

    #[tokio::test]
    async fn cold_start_never_alerts() {
        let store = Arc::new(MemoryStore::new());
        store.upsert(CostRecord::new(day(1), "compute", 1_000_000.0)).await.unwrap();

        let report = detector(&store, &["compute"]).evaluate(day(1)).await.unwrap();
        assert!(report.alerts.is_empty());
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn missing_sample_skips_only_that_service() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "compute", 1..=7, 3.0).await;
        store.upsert(CostRecord::new(day(8), "compute", 9.0)).await.unwrap();

        let report = detector(&store, &["db", "compute"]).evaluate(day(8)).await.unwrap();
        assert_eq!(report.missing, vec!["db".to_string()]);
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.alerts[0].service, "compute");
    }

    #[tokio::test]
    async fn history_outside_window_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        // Day 1 is eight days before day 9, outside the seven-day window.
        store.upsert(CostRecord::new(day(1), "db", 100.0)).await.unwrap();
        seed(&store, "db", 2..=8, 1.0).await;
        store.upsert(CostRecord::new(day(9), "db", 2.0)).await.unwrap();

        let report = detector(&store, &["db"]).evaluate(day(9)).await.unwrap();
        assert_eq!(report.alerts.len(), 1);
        assert!(report.alerts[0].message.contains("7d_avg=1.00"));
    }

    #[tokio::test]
    async fn overridden_parameters_apply() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "network", 5..=7, 1.0).await;
        store.upsert(CostRecord::new(day(8), "network", 1.8)).await.unwrap();

        let config = DetectorConfig { window_days: 3, spike_multiplier: 2.0 };
        let report = detector(&store, &["network"])
            .with_config(&config)
            .evaluate(day(8))
            .await
            .unwrap();
        assert!(report.alerts.is_empty());

        let config = DetectorConfig { window_days: 3, spike_multiplier: 1.2 };
        let report = detector(&store, &["network"])
            .with_config(&config)
            .evaluate(day(8))
            .await
            .unwrap();
        assert_eq!(report.alerts.len(), 1);
        assert!(report.alerts[0].message.contains("3d_avg=1.00"));
    }

    #[tokio::test]
    async fn repeated_evaluation_appends_duplicate_alerts() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "compute", 1..=7, 3.0).await;
        store.upsert(CostRecord::new(day(8), "compute", 5.0)).await.unwrap();

        let detector = detector(&store, &["compute"]);
        detector.evaluate(day(8)).await.unwrap();
        detector.evaluate(day(8)).await.unwrap();

        let alerts = AlertStore::query_range(&*store, day(8), day(8)).await.unwrap();
        assert_eq!(alerts.len(), 2);
        assert!(alerts[0].id > alerts[1].id);
    }
}
