pub mod error;
pub mod routes;
pub mod state;

use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use taxflow_core::scheduler::Scheduler;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve_on()` and available for integration testing.
pub fn build_router(scheduler: Arc<Scheduler>) -> Router {
    let app_state = state::AppState::new(scheduler);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(routes::status::get_status))
        // Cycles
        .route("/api/cycles", get(routes::cycles::list_cycles))
        .route("/api/cycles/latest", get(routes::cycles::latest_cycle))
        // Payouts
        .route("/api/payouts/pending", get(routes::payouts::list_pending))
        .route("/api/payouts/dropped", get(routes::payouts::list_dropped))
        .route(
            "/api/settlements/unreconciled",
            get(routes::payouts::list_unreconciled),
        )
        .route(
            "/api/settlements/{key}",
            get(routes::payouts::get_settlement),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Serve the status API on a pre-bound listener until the process exits.
///
/// Accepting a bound `TcpListener` lets the caller read the actual port
/// first (useful when `port = 0` and the OS picks a free port).
pub async fn serve_on(
    scheduler: Arc<Scheduler>,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let port = listener.local_addr()?.port();
    let app = build_router(scheduler);

    tracing::info!("taxflow status API listening on http://localhost:{port}");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Bind `0.0.0.0:{port}` and serve the status API.
pub async fn serve(scheduler: Arc<Scheduler>, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    serve_on(scheduler, listener).await
}
