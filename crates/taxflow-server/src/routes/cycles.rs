use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use taxflow_core::cycle::CycleResult;

use super::blocking;
use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct CyclesQuery {
    pub limit: Option<usize>,
}

/// GET /api/cycles?limit=N: recorded cycles, newest first.
pub async fn list_cycles(
    State(app): State<AppState>,
    Query(q): Query<CyclesQuery>,
) -> Result<Json<Vec<CycleResult>>, AppError> {
    let limit = q.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let store = app.store();
    let cycles = blocking(move || store.recent_cycles(limit)).await?;
    Ok(Json(cycles))
}

/// GET /api/cycles/latest
pub async fn latest_cycle(State(app): State<AppState>) -> Result<Json<CycleResult>, AppError> {
    let store = app.store();
    match blocking(move || store.last_cycle()).await? {
        Some(result) => Ok(Json(result)),
        None => Err(AppError::not_found("no cycles recorded yet")),
    }
}
