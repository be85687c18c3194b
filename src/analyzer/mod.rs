pub mod spike;

pub use spike::{DetectionReport, SpikeDetector};

/// Days before the evaluated date that form the comparison baseline
pub const DEFAULT_WINDOW_DAYS: u32 = 7;

/// A day is a spike when its cost is strictly greater than this multiple of
/// the trailing average
pub const DEFAULT_SPIKE_MULTIPLIER: f64 = 1.5;
