use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use taxflow_core::TaxflowError;

// ---------------------------------------------------------------------------
// Internal sentinel for explicit 404 Not Found errors
// ---------------------------------------------------------------------------

/// Carries an explicit HTTP 404 through the `anyhow::Error` chain for
/// lookups that have no `TaxflowError` of their own.
#[derive(Debug)]
struct NotFoundError(String);

impl std::fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NotFoundError {}

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    /// Construct a 404 Not Found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self(NotFoundError(msg.into()).into())
    }
}

fn status_for(err: &TaxflowError) -> StatusCode {
    match err {
        TaxflowError::SettlementNotFound(_) | TaxflowError::ConfigNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        TaxflowError::SettlementState { .. } => StatusCode::CONFLICT,
        TaxflowError::Configuration(_) => StatusCode::BAD_REQUEST,
        TaxflowError::Upstream(_) => StatusCode::BAD_GATEWAY,
        TaxflowError::InsufficientFunds { .. }
        | TaxflowError::PartialBatchFailure { .. }
        | TaxflowError::NoEligibleHolders
        | TaxflowError::Store(_)
        | TaxflowError::Panicked(_)
        | TaxflowError::Io(_)
        | TaxflowError::Yaml(_)
        | TaxflowError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(n) = self.0.downcast_ref::<NotFoundError>() {
            let body = serde_json::json!({ "error": n.0.clone() });
            return (StatusCode::NOT_FOUND, axum::Json(body)).into_response();
        }

        let status = self
            .0
            .downcast_ref::<TaxflowError>()
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settlement_not_found_maps_to_404() {
        let err = AppError(TaxflowError::SettlementNotFound("2026-03-01:1:A".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn settlement_state_maps_to_409() {
        let err = AppError(
            TaxflowError::SettlementState {
                key: "k".into(),
                status: "confirmed".into(),
                expected: "unreconciled".into(),
            }
            .into(),
        );
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn configuration_maps_to_400() {
        let err = AppError(TaxflowError::Configuration("interval_secs must be > 0".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn upstream_maps_to_502() {
        let err = AppError(
            TaxflowError::from(taxflow_core::UpstreamError::Unavailable("down".into())).into(),
        );
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn store_error_maps_to_500() {
        let err = AppError(TaxflowError::Store("corrupt".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn non_taxflow_error_maps_to_500() {
        let err = AppError(anyhow::anyhow!("something unexpected"));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn not_found_constructor_maps_to_404() {
        let err = AppError::not_found("no cycles recorded yet");
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}
