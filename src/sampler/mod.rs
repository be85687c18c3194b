pub mod simulated;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;

use crate::config::Config;

pub use simulated::SimulatedSampler;

/// Per-service amounts for one day
pub type DailyAmounts = BTreeMap<String, f64>;

/// Source of daily per-service cost figures.
///
/// Implementations return exactly one amount for every tracked service. The
/// same `(date, seed)` must yield the same amounts; sources backed by real
/// billing data are free to ignore the seed.
#[async_trait]
pub trait CostSampler: Send + Sync {
    /// Human-readable name for this sampler (e.g., "simulated")
    fn name(&self) -> &str;

    /// Produce the cost of every tracked service on `date`.
    async fn sample_day(&self, date: NaiveDate, seed: u64) -> Result<DailyAmounts>;
}

/// Create the configured sampler
pub fn create_sampler(config: &Config) -> Result<Arc<dyn CostSampler>> {
    let sampler = SimulatedSampler::new(&config.services, &config.sampler);
    tracing::info!(
        sampler = sampler.name(),
        services = config.services.len(),
        "Initialized cost sampler"
    );
    Ok(Arc::new(sampler))
}
