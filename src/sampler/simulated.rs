use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::{SamplerConfig, ServiceConfig};
use super::{CostSampler, DailyAmounts};

/// Synthetic cost feed for demos and tests.
///
/// Each service gets its baseline plus uniform noise, floored at a small
/// positive minimum. Occasionally one service is multiplied by a spike factor
/// so the detector has something to find.
pub struct SimulatedSampler {
    services: Vec<ServiceConfig>,
    noise: f64,
    min_amount: f64,
    spike_one_in: u32,
    spike_factor: f64,
}

impl SimulatedSampler {
    pub fn new(services: &[ServiceConfig], config: &SamplerConfig) -> Self {
        Self {
            services: services.to_vec(),
            noise: config.noise,
            min_amount: config.min_amount,
            spike_one_in: config.spike_one_in.max(1),
            spike_factor: config.spike_factor,
        }
    }

    /// Draw one day of amounts. Pure in `seed`; the date does not move the
    /// stream, so callers that want per-day variety fold it into the seed.
    pub fn draw(&self, seed: u64) -> DailyAmounts {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let spiked = if !self.services.is_empty() && rng.gen_range(0..self.spike_one_in) == 0 {
            Some(rng.gen_range(0..self.services.len()))
        } else {
            None
        };

        self.services
            .iter()
            .enumerate()
            .map(|(i, service)| {
                // Scale a unit draw rather than sampling a range, whose width
                // overflows for very large noise.
                let noise = if self.noise > 0.0 {
                    (rng.gen::<f64>() * 2.0 - 1.0) * self.noise
                } else {
                    0.0
                };
                let mut amount = (service.baseline + noise).max(self.min_amount);
                if spiked == Some(i) {
                    amount *= self.spike_factor;
                }
                (service.name.clone(), amount)
            })
            .collect()
    }
}

#[async_trait]
impl CostSampler for SimulatedSampler {
    fn name(&self) -> &str { "simulated" }

    async fn sample_day(&self, date: NaiveDate, seed: u64) -> Result<DailyAmounts> {
        let amounts = self.draw(seed);
        if let Some((service, amount)) = amounts.iter().find(|(_, a)| !a.is_finite()) {
            bail!("simulated {} cost for {} is not finite: {}", service, date, amount);
        }
        Ok(amounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services() -> Vec<ServiceConfig> {
        vec![
            ServiceConfig::new("compute", 3.0),
            ServiceConfig::new("storage", 0.8),
            ServiceConfig::new("db", 1.5),
            ServiceConfig::new("network", 0.6),
        ]
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[tokio::test]
    async fn same_seed_same_amounts() {
        let sampler = SimulatedSampler::new(&services(), &SamplerConfig::default());
        let a = sampler.sample_day(today(), 42).await.unwrap();
        let b = sampler.sample_day(today(), 42).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn covers_every_service_once() {
        let sampler = SimulatedSampler::new(&services(), &SamplerConfig::default());
        let amounts = sampler.sample_day(today(), 7).await.unwrap();
        let names: Vec<_> = amounts.keys().cloned().collect();
        assert_eq!(names, vec!["compute", "db", "network", "storage"]);
    }

    #[test]
    fn amounts_stay_positive_and_bounded() {
        let config = SamplerConfig::default();
        let sampler = SimulatedSampler::new(&services(), &config);
        for seed in 0..500 {
            for (name, amount) in sampler.draw(seed) {
                let baseline = services().into_iter().find(|s| s.name == name).unwrap().baseline;
                assert!(amount >= config.min_amount, "{name} drew {amount}");
                assert!(amount <= (baseline + config.noise) * config.spike_factor);
            }
        }
    }

    #[test]
    fn floor_applies_to_tiny_baselines() {
        let config = SamplerConfig { noise: 0.3, ..Default::default() };
        let sampler = SimulatedSampler::new(&[ServiceConfig::new("idle", 0.0)], &config);
        for seed in 0..200 {
            assert!(sampler.draw(seed)["idle"] >= 0.05);
        }
    }

    #[tokio::test]
    async fn huge_noise_never_panics() {
        let config = SamplerConfig { noise: 1e308, ..Default::default() };
        let sampler = SimulatedSampler::new(&services(), &config);
        for seed in 0..200 {
            let amounts = sampler.draw(seed);
            assert_eq!(amounts.len(), 4);
            assert!(amounts.values().all(|a| *a >= config.min_amount));
        }
    }

    #[tokio::test]
    async fn overflowing_spike_is_reported_as_error() {
        let config = SamplerConfig {
            noise: 0.0,
            spike_one_in: 1,
            spike_factor: f64::MAX,
            ..Default::default()
        };
        let sampler = SimulatedSampler::new(&[ServiceConfig::new("compute", 3.0)], &config);
        let err = sampler.sample_day(today(), 1).await.unwrap_err();
        assert!(err.to_string().contains("not finite"));
    }

    #[test]
    fn spikes_are_injected_eventually() {
        let config = SamplerConfig { noise: 0.0, spike_one_in: 2, ..Default::default() };
        let sampler = SimulatedSampler::new(&services(), &config);
        let spiked = (0..100)
            .filter(|seed| sampler.draw(*seed)["compute"] > 3.0)
            .count();
        assert!(spiked > 0);
    }
}
