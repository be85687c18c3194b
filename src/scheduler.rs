use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Days, NaiveDate, Utc};
use tokio::time::{Instant, MissedTickBehavior};

use crate::analyzer::{DetectionReport, SpikeDetector};
use crate::config::{SchedulerConfig, MAX_BACKFILL_DAYS, MIN_BACKFILL_DAYS};
use crate::sampler::CostSampler;
use crate::storage::{CostStore, StoreError};
use crate::types::CostRecord;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("backfill depth must be between 1 and 365 days, got {0}")]
    InvalidDepth(u32),

    #[error("sampling {date} failed: {cause}")]
    Sampler { date: NaiveDate, cause: anyhow::Error },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Summary of a completed backfill
#[derive(Debug, Clone)]
pub struct BackfillSummary {
    pub days: u32,
    pub first: NaiveDate,
    pub last: NaiveDate,
    /// Detection result for the tail day
    pub detection: DetectionReport,
}

/// Drives the sample → upsert → detect cycle.
///
/// Holds no state between cycles: seeds are derived per call and everything
/// durable lives in the stores.
pub struct Scheduler {
    sampler: Arc<dyn CostSampler>,
    costs: Arc<dyn CostStore>,
    detector: SpikeDetector,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        sampler: Arc<dyn CostSampler>,
        costs: Arc<dyn CostStore>,
        detector: SpikeDetector,
        config: SchedulerConfig,
    ) -> Self {
        Self { sampler, costs, detector, config }
    }

    /// Seed used when backfilling `date`: stable across runs and distinct per day.
    pub fn backfill_seed(&self, date: NaiveDate) -> u64 {
        self.config
            .backfill_seed
            .wrapping_add(date.num_days_from_ce() as u64)
    }

    /// Seed for a live tick; varies on every call.
    pub fn live_seed() -> u64 {
        let now = Utc::now();
        now.timestamp_nanos_opt()
            .map(|n| n as u64)
            .unwrap_or_else(|| now.timestamp() as u64)
    }

    /// Sample `date` with `seed` and upsert every amount.
    pub async fn ingest_day(&self, date: NaiveDate, seed: u64) -> SchedulerResult<usize> {
        let amounts = self
            .sampler
            .sample_day(date, seed)
            .await
            .map_err(|cause| SchedulerError::Sampler { date, cause })?;

        let count = amounts.len();
        for (service, amount) in amounts {
            let record = CostRecord::new(date, service, amount).with_currency(&self.config.currency);
            self.costs.upsert(record).await?;
        }

        tracing::debug!(%date, services = count, "Ingested daily costs");
        Ok(count)
    }

    /// Seed the `days` days ending at `today` in chronological order, then
    /// run detection on `today` alone.
    pub async fn backfill(&self, days: u32, today: NaiveDate) -> SchedulerResult<BackfillSummary> {
        if !(MIN_BACKFILL_DAYS..=MAX_BACKFILL_DAYS).contains(&days) {
            return Err(SchedulerError::InvalidDepth(days));
        }

        let first = today
            .checked_sub_days(Days::new(u64::from(days - 1)))
            .ok_or(SchedulerError::InvalidDepth(days))?;

        for date in first.iter_days().take(days as usize) {
            self.ingest_day(date, self.backfill_seed(date)).await?;
        }

        let detection = self.detector.evaluate(today).await?;

        tracing::info!(
            days,
            %first,
            last = %today,
            alerts = detection.alerts.len(),
            "Backfill complete"
        );

        Ok(BackfillSummary { days, first, last: today, detection })
    }

    /// One steady-state cycle for `today` with a fresh seed.
    pub async fn tick(&self, today: NaiveDate) -> SchedulerResult<DetectionReport> {
        self.ingest_day(today, Self::live_seed()).await?;
        Ok(self.detector.evaluate(today).await?)
    }

    /// Backfill once, then tick forever on the configured interval.
    ///
    /// Errors are logged and never end the loop. A tick that overruns
    /// pushes the next one back instead of bursting to catch up.
    pub async fn run(self: Arc<Self>) {
        let today = Utc::now().date_naive();
        if let Err(e) = self.backfill(self.config.backfill_days, today).await {
            tracing::error!(error = %e, "Backfill failed");
        }

        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_secs = period.as_secs(), "Scheduler running");

        loop {
            ticker.tick().await;
            let today = Utc::now().date_naive();
            match self.tick(today).await {
                Ok(report) => {
                    tracing::debug!(%today, alerts = report.alerts.len(), "Tick complete");
                }
                Err(e) => {
                    tracing::error!(%today, error = %e, "Scheduler tick failed");
                }
            }
        }
    }
}
