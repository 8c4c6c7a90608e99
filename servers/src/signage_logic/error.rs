use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use lib_signage::EngineError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// # Application Error
///
/// Every failure a schedule handler can return, mapped to an HTTP status and
/// a JSON body with an `error_type`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_json) = match self {
            AppError::Engine(EngineError::Validation(e)) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error_type": "ValidationError",
                    "message": e.to_string(),
                }),
            ),
            AppError::Engine(EngineError::Conflict { conflicts }) => (
                StatusCode::CONFLICT,
                json!({
                    "error_type": "ScheduleConflict",
                    "message": format!("The schedule overlaps {} existing schedule(s).", conflicts.len()),
                    "conflicts": conflicts,
                }),
            ),
            AppError::Engine(EngineError::NotFound(id)) => (
                StatusCode::NOT_FOUND,
                json!({
                    "error_type": "NotFound",
                    "message": format!("Schedule {id} not found."),
                }),
            ),
            AppError::Engine(EngineError::Store(e)) => {
                error!("Store error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "error_type": "StoreError",
                        "message": "The schedule store is unavailable.",
                        "detail": e.to_string(),
                    }),
                )
            }
        };
        (status, Json(error_json)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_signage::core::ValidationError;
    use lib_signage::store::StoreError;

    #[test]
    fn statuses() {
        let cases = [
            (EngineError::Validation(ValidationError::MissingTarget), StatusCode::BAD_REQUEST),
            (EngineError::Conflict { conflicts: Vec::new() }, StatusCode::CONFLICT),
            (EngineError::NotFound(3), StatusCode::NOT_FOUND),
            (
                EngineError::Store(StoreError::Backend("down".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).into_response().status(), status);
        }
    }
}
