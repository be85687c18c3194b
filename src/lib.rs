pub mod analyzer;
pub mod api;
pub mod config;
pub mod sampler;
pub mod scheduler;
pub mod storage;

/// Common types used across modules
pub mod types {
    use chrono::{DateTime, NaiveDate, Utc};
    use serde::{Deserialize, Serialize};

    /// Currency used when the configuration does not name one
    pub const DEFAULT_CURRENCY: &str = "USD";

    /// One service's spend for one calendar day.
    ///
    /// `(date, service)` is the identity key: stores keep at most one record
    /// per pair and an upsert overwrites `amount` and `currency`.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct CostRecord {
        pub date: NaiveDate,
        pub service: String,
        pub amount: f64,
        pub currency: String,
    }

    impl CostRecord {
        pub fn new(date: NaiveDate, service: impl Into<String>, amount: f64) -> Self {
            Self {
                date,
                service: service.into(),
                amount,
                currency: DEFAULT_CURRENCY.to_string(),
            }
        }

        pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
            self.currency = currency.into();
            self
        }
    }

    /// Alert classification
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum AlertKind {
        /// Day's cost exceeded the trailing average by the spike multiplier
        #[serde(rename = "ANOMALY")]
        Anomaly,
    }

    impl AlertKind {
        pub fn as_str(&self) -> &'static str {
            match self {
                AlertKind::Anomaly => "ANOMALY",
            }
        }

        pub fn parse(s: &str) -> Option<Self> {
            match s {
                "ANOMALY" => Some(AlertKind::Anomaly),
                _ => None,
            }
        }
    }

    impl std::fmt::Display for AlertKind {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.as_str())
        }
    }

    /// A persisted alert. Ids are assigned by the alert store and only grow.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Alert {
        pub id: i64,
        pub date: NaiveDate,
        pub service: String,
        #[serde(rename = "type")]
        pub kind: AlertKind,
        pub message: String,
        pub created_at: DateTime<Utc>,
    }
}
