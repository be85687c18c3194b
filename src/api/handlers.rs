use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::config::{MAX_BACKFILL_DAYS, MIN_BACKFILL_DAYS};
use crate::scheduler::SchedulerError;
use crate::storage::StoreError;
use crate::types::{Alert, CostRecord};

const DEFAULT_BACKFILL_DAYS: u32 = 30;

/// Query parameters shared by the range endpoints.
#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BackfillQuery {
    pub days: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BackfillResponse {
    pub ok: bool,
    pub days: u32,
}

/// Error response structure.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Errors a handler can answer with.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(SchedulerError),
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::InvalidDepth(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Scheduler(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) | ApiError::Scheduler(_) => {
                tracing::error!(error = %self, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

impl RangeQuery {
    /// Parse and check the `from`/`to` pair.
    pub fn parse(&self) -> Result<(NaiveDate, NaiveDate), ApiError> {
        let (Some(from), Some(to)) = (self.from.as_deref(), self.to.as_deref()) else {
            return Err(ApiError::BadRequest("missing from/to query params".into()));
        };
        let from = parse_date("from", from)?;
        let to = parse_date("to", to)?;
        if from > to {
            return Err(ApiError::BadRequest("from must not be after to".into()));
        }
        Ok((from, to))
    }
}

fn parse_date(name: &str, raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest(format!("{name} must be a YYYY-MM-DD date, got {raw:?}")))
}

/// Liveness probe.
pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// `GET /costs?from=&to=`, ordered by date then service.
pub async fn costs_handler(
    State(state): State<AppState>,
    Query(params): Query<RangeQuery>,
) -> Result<Json<Vec<CostRecord>>, ApiError> {
    let (from, to) = params.parse()?;
    Ok(Json(state.costs.query_range(from, to).await?))
}

/// `GET /alerts?from=&to=`, newest first.
pub async fn alerts_handler(
    State(state): State<AppState>,
    Query(params): Query<RangeQuery>,
) -> Result<Json<Vec<Alert>>, ApiError> {
    let (from, to) = params.parse()?;
    Ok(Json(state.alerts.query_range(from, to).await?))
}

/// `POST /simulate/backfill?days=N`, synchronous with the request.
pub async fn backfill_handler(
    State(state): State<AppState>,
    Query(params): Query<BackfillQuery>,
) -> Result<Json<BackfillResponse>, ApiError> {
    let days = match params.days.as_deref() {
        None | Some("") => DEFAULT_BACKFILL_DAYS,
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| ApiError::BadRequest(format!("days must be an integer, got {raw:?}")))?,
    };
    if !(MIN_BACKFILL_DAYS..=MAX_BACKFILL_DAYS).contains(&days) {
        return Err(ApiError::BadRequest(format!(
            "days must be {MIN_BACKFILL_DAYS}..{MAX_BACKFILL_DAYS}"
        )));
    }

    let today = Utc::now().date_naive();
    state.scheduler.backfill(days, today).await?;

    Ok(Json(BackfillResponse { ok: true, days }))
}
