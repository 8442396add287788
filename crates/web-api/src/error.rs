use application::ApplicationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.body.code
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        let detail = error.client_detail();
        match error {
            ApplicationError::Domain(_) | ApplicationError::Validation { .. } => {
                ApiError::new(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", detail)
            }
            ApplicationError::Authorization { .. } => {
                ApiError::new(StatusCode::FORBIDDEN, "AUTHORIZATION_FAILED", detail)
            }
            ApplicationError::RateLimited(_) => {
                ApiError::new(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", detail)
            }
            ApplicationError::Repository(domain::RepositoryError::NotFound) => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "requested resource not found",
            ),
            ApplicationError::Repository(_) | ApplicationError::Persistence { .. } => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", detail)
            }
            ApplicationError::Outbound(_) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", detail)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use application::{DenyReason, RateLimitError};

    #[test]
    fn application_errors_map_to_status_codes() {
        let err = ApiError::from(ApplicationError::authorization(DenyReason::Blocked));
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.body.message, "blocked");

        let err = ApiError::from(ApplicationError::from(RateLimitError::TooManyConnections {
            current: 10,
            max: 10,
        }));
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);

        let err = ApiError::from(ApplicationError::persistence("disk full"));
        assert_eq!(err.code(), "DATABASE_ERROR");
        assert!(!err.body.message.contains("disk full"));
    }
}
