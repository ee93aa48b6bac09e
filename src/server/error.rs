//! HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::ServiceError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl ServerError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ServerError::Service(ServiceError::PromptTooLong { .. }) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error")
            }
            ServerError::Service(ServiceError::NotConfigured) => {
                (StatusCode::CONFLICT, "not_configured")
            }
            ServerError::Service(ServiceError::Busy) => {
                (StatusCode::SERVICE_UNAVAILABLE, "busy")
            }
            ServerError::Service(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!("Request failed: {}", self);
        }

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ServiceError::PromptTooLong { tokens: 9, max: 4 }, StatusCode::BAD_REQUEST),
            (ServiceError::NotConfigured, StatusCode::CONFLICT),
            (ServiceError::Busy, StatusCode::SERVICE_UNAVAILABLE),
            (
                ServiceError::ModelLoadFailed {
                    path: "m".to_string(),
                    reason: "missing".to_string(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            let response = ServerError::from(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
