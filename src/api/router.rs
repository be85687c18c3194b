use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::{handlers, AppState};

/// Create the API router with all endpoints.
///
/// # Routes
///
/// - `GET /healthz` - Liveness probe
/// - `GET /costs?from=YYYY-MM-DD&to=YYYY-MM-DD` - Daily costs in range
/// - `GET /alerts?from=YYYY-MM-DD&to=YYYY-MM-DD` - Alerts in range, newest first
/// - `POST /simulate/backfill?days=N` - Reseed N days of history (1..=365)
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health_handler))
        .route("/costs", get(handlers::costs_handler))
        .route("/alerts", get(handlers::alerts_handler))
        .route("/simulate/backfill", post(handlers::backfill_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind `addr` and serve until the process exits.
pub async fn start_server(state: AppState, addr: &str) -> std::io::Result<()> {
    let app = create_router(state);

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
