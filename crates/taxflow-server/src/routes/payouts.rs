use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use taxflow_core::store::{DroppedPayout, PendingPayout, SettlementRecord};
use taxflow_core::TaxflowError;

use super::blocking;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DroppedQuery {
    pub limit: Option<usize>,
}

/// GET /api/payouts/pending: queued payouts, held ones included.
pub async fn list_pending(
    State(app): State<AppState>,
) -> Result<Json<Vec<PendingPayout>>, AppError> {
    let store = app.store();
    Ok(Json(blocking(move || store.pending()).await?))
}

/// GET /api/payouts/dropped?limit=N: payouts that exhausted their retries,
/// most recent first.
pub async fn list_dropped(
    State(app): State<AppState>,
    Query(q): Query<DroppedQuery>,
) -> Result<Json<Vec<DroppedPayout>>, AppError> {
    let limit = q.limit.unwrap_or(100);
    let store = app.store();
    Ok(Json(blocking(move || store.dropped(limit)).await?))
}

/// GET /api/settlements/unreconciled: transfers whose outcome is unknown
/// after a restart. These stay held until an operator reconciles them.
pub async fn list_unreconciled(
    State(app): State<AppState>,
) -> Result<Json<Vec<SettlementRecord>>, AppError> {
    let store = app.store();
    Ok(Json(blocking(move || store.unreconciled()).await?))
}

/// GET /api/settlements/{key}
pub async fn get_settlement(
    State(app): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<SettlementRecord>, AppError> {
    let store = app.store();
    let record = blocking(move || {
        store
            .settlement(&key)?
            .ok_or(TaxflowError::SettlementNotFound(key))
    })
    .await?;
    Ok(Json(record))
}
