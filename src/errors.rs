//! Errors returned by the HTTP API
use crate::switcher::SwitchError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Switch(#[from] SwitchError),

    #[error("switch task failed: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Switch(SwitchError::NotFound(_) | SwitchError::Disabled(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Switch(SwitchError::Cancelled) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Switch(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Endpoint;
    use crate::client::{ClientError, Operation};
    use rstest::rstest;

    #[rstest]
    #[case::not_found(SwitchError::NotFound("x".into()), StatusCode::NOT_FOUND)]
    #[case::disabled(SwitchError::Disabled("x".into()), StatusCode::NOT_FOUND)]
    #[case::cancelled(SwitchError::Cancelled, StatusCode::SERVICE_UNAVAILABLE)]
    #[case::unhealthy(
        SwitchError::Unhealthy { backend: "x".into(), attempts: 3 },
        StatusCode::INTERNAL_SERVER_ERROR
    )]
    #[case::sleep_failed(
        SwitchError::SleepCurrent {
            backend: "x".into(),
            source: ClientError::transport(Operation::Sleep, &Endpoint::new("h", 1), "refused"),
        },
        StatusCode::INTERNAL_SERVER_ERROR
    )]
    fn test_status_codes(#[case] error: SwitchError, #[case] expected: StatusCode) {
        assert_eq!(ApiError::from(error).status_code(), expected);
    }
}
