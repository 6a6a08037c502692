use axum::extract::State;
use axum::Json;
use taxflow_core::scheduler::StatusSnapshot;

use super::blocking;
use crate::error::AppError;
use crate::state::AppState;

/// GET /api/status: where the scheduler stands and what it owes.
pub async fn get_status(State(app): State<AppState>) -> Result<Json<StatusSnapshot>, AppError> {
    let scheduler = app.scheduler.clone();
    let snapshot = blocking(move || scheduler.status()).await?;
    Ok(Json(snapshot))
}
