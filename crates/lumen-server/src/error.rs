//! Error handling for the API surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized { reason: &'static str },

    #[error("database error: {0}")]
    Store(lumen_store::StoreError),

    #[error("job error: {0}")]
    Job(lumen_jobs::JobError),

    #[error("storage error: {0}")]
    Media(lumen_media::MediaError),
}

impl From<lumen_store::StoreError> for ApiError {
    fn from(err: lumen_store::StoreError) -> Self {
        match err {
            lumen_store::StoreError::NotFound(what) => ApiError::NotFound(what),
            lumen_store::StoreError::Invalid(msg) => ApiError::BadRequest(msg),
            other => ApiError::Store(other),
        }
    }
}

impl From<lumen_jobs::JobError> for ApiError {
    fn from(err: lumen_jobs::JobError) -> Self {
        match err {
            lumen_jobs::JobError::UnknownType(t) => {
                ApiError::BadRequest(format!("unknown job type: {t}"))
            }
            lumen_jobs::JobError::BatchTooLarge { got, max } => {
                ApiError::BadRequest(format!("batch of {got} items exceeds the {max} item cap"))
            }
            lumen_jobs::JobError::Invalid(msg) => ApiError::BadRequest(msg),
            lumen_jobs::JobError::NotFound(id) => ApiError::NotFound(format!("job {id}")),
            lumen_jobs::JobError::Store(e) => e.into(),
        }
    }
}

impl From<lumen_media::MediaError> for ApiError {
    fn from(err: lumen_media::MediaError) -> Self {
        match err {
            lumen_media::MediaError::NotFound(path) => {
                ApiError::NotFound(path.display().to_string())
            }
            other => ApiError::Media(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, format!("not found: {what}")),
            ApiError::Unauthorized { reason } => {
                let body = serde_json::json!({
                    "error": "unauthorized",
                    "reason": reason,
                    "status": StatusCode::UNAUTHORIZED.as_u16(),
                });
                return (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response();
            }
            ApiError::Store(e) => {
                tracing::error!(error = %e, "store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
            ApiError::Job(e) => {
                tracing::error!(error = %e, "job error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
            ApiError::Media(e) => {
                tracing::error!(error = %e, "storage error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let body = serde_json::json!({
            "error": message,
            "status": status.as_u16(),
        });
        (status, axum::Json(body)).into_response()
    }
}
