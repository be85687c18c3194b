use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::analyzer::{DEFAULT_SPIKE_MULTIPLIER, DEFAULT_WINDOW_DAYS};
use crate::types::DEFAULT_CURRENCY;

/// Environment variables that override the loaded file
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_PORT: &str = "PORT";

/// Bounds on how many days a backfill may seed
pub const MIN_BACKFILL_DAYS: u32 = 1;
pub const MAX_BACKFILL_DAYS: u32 = 365;

/// Top-level configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default = "default_services")]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub api: ApiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            storage: StorageConfig::default(),
            scheduler: SchedulerConfig::default(),
            detector: DetectorConfig::default(),
            sampler: SamplerConfig::default(),
            services: default_services(),
            api: ApiConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { log_level: default_log_level() }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    /// Connections kept open against a file database
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite_path: default_sqlite_path(),
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_backfill_days")]
    pub backfill_days: u32,
    /// Base seed for backfilled history; live ticks derive theirs from the clock
    #[serde(default = "default_backfill_seed")]
    pub backfill_seed: u64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            backfill_days: default_backfill_days(),
            backfill_seed: default_backfill_seed(),
            currency: default_currency(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    #[serde(default = "default_spike_multiplier")]
    pub spike_multiplier: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_days: DEFAULT_WINDOW_DAYS,
            spike_multiplier: DEFAULT_SPIKE_MULTIPLIER,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SamplerConfig {
    /// Half-width of the uniform noise added to each baseline
    #[serde(default = "default_noise")]
    pub noise: f64,
    #[serde(default = "default_min_amount")]
    pub min_amount: f64,
    /// One day in this many gets an injected spike
    #[serde(default = "default_spike_one_in")]
    pub spike_one_in: u32,
    #[serde(default = "default_spike_factor")]
    pub spike_factor: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            noise: default_noise(),
            min_amount: default_min_amount(),
            spike_one_in: default_spike_one_in(),
            spike_factor: default_spike_factor(),
        }
    }
}

/// A tracked service and its simulated daily baseline
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub baseline: f64,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, baseline: f64) -> Self {
        Self { name: name.into(), baseline }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand environment variables
        let expanded = expand_env_vars(content)?;

        let config: Config = toml::from_str(&expanded)
            .with_context(|| "Failed to parse configuration")?;
        config.validate()?;

        Ok(config)
    }

    /// Apply deployment overrides on top of the file.
    ///
    /// `DATABASE_URL` replaces `storage.sqlite_path` (a `sqlite://` prefix is
    /// accepted) and `PORT` rebinds the API to `0.0.0.0:{PORT}`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_DATABASE_URL).filter(|v| !v.trim().is_empty()) {
            let url = url.trim();
            let path = url
                .strip_prefix("sqlite://")
                .or_else(|| url.strip_prefix("sqlite:"))
                .unwrap_or(url);
            self.storage.sqlite_path = path.to_string();
        }

        if let Some(port) = lookup(ENV_PORT).filter(|v| !v.trim().is_empty()) {
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("{} must be a port number, got {:?}", ENV_PORT, port))?;
            self.api.bind = format!("0.0.0.0:{}", port);
        }

        Ok(())
    }

    /// Names of the tracked services, in configured order
    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            bail!("at least one service must be configured");
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                bail!("service names must not be empty");
            }
            if !seen.insert(service.name.as_str()) {
                bail!("service {:?} is configured more than once", service.name);
            }
            if !(service.baseline.is_finite() && service.baseline >= 0.0) {
                bail!("service {:?} needs a finite, non-negative baseline", service.name);
            }
        }

        if !(MIN_BACKFILL_DAYS..=MAX_BACKFILL_DAYS).contains(&self.scheduler.backfill_days) {
            bail!(
                "scheduler.backfill_days must be {}..{}, got {}",
                MIN_BACKFILL_DAYS,
                MAX_BACKFILL_DAYS,
                self.scheduler.backfill_days
            );
        }
        if self.scheduler.interval_secs == 0 {
            bail!("scheduler.interval_secs must be positive");
        }
        if self.detector.window_days == 0 {
            bail!("detector.window_days must be positive");
        }
        if !(self.detector.spike_multiplier.is_finite() && self.detector.spike_multiplier > 0.0) {
            bail!("detector.spike_multiplier must be finite and positive");
        }
        if !(self.sampler.noise.is_finite() && self.sampler.noise >= 0.0) {
            bail!("sampler.noise must be finite and non-negative, got {}", self.sampler.noise);
        }
        if !(self.sampler.min_amount.is_finite() && self.sampler.min_amount > 0.0) {
            bail!("sampler.min_amount must be finite and positive");
        }
        if self.sampler.spike_one_in == 0 {
            bail!("sampler.spike_one_in must be positive");
        }
        if !(self.sampler.spike_factor.is_finite() && self.sampler.spike_factor >= 3.0) {
            bail!("sampler.spike_factor must be finite and at least 3");
        }
        if self.storage.pool_size == 0 {
            bail!("storage.pool_size must be positive");
        }

        Ok(())
    }
}

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .to_string())
}

// Default value functions
fn default_log_level() -> String { "info".to_string() }
fn default_backend() -> StorageBackend { StorageBackend::Sqlite }
fn default_sqlite_path() -> String { "costguard.db".to_string() }
fn default_pool_size() -> u32 { 8 }
fn default_interval() -> u64 { 30 }
fn default_backfill_days() -> u32 { 14 }
fn default_backfill_seed() -> u64 { 42 }
fn default_currency() -> String { DEFAULT_CURRENCY.to_string() }
fn default_window_days() -> u32 { DEFAULT_WINDOW_DAYS }
fn default_spike_multiplier() -> f64 { DEFAULT_SPIKE_MULTIPLIER }
fn default_noise() -> f64 { 0.3 }
fn default_min_amount() -> f64 { 0.05 }
fn default_spike_one_in() -> u32 { 14 }
fn default_spike_factor() -> f64 { 3.0 }
fn default_bind() -> String { "0.0.0.0:8080".to_string() }
fn default_services() -> Vec<ServiceConfig> {
    vec![
        ServiceConfig::new("compute", 3.0),
        ServiceConfig::new("storage", 0.8),
        ServiceConfig::new("db", 1.5),
        ServiceConfig::new("network", 0.6),
    ]
}
