use crate::services::{
    object_gateway::{GatewayError, LinkError},
    resource_service::ResourceError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing or invalid bearer token")
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "admin role required")
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::ObjectNotFound(_) => AppError::not_found(err.to_string()),
            GatewayError::InvalidObjectKey => AppError::bad_request(err.to_string()),
            GatewayError::Signing { .. } => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            GatewayError::Io(_) => {
                tracing::error!("object store I/O failure: {}", err);
                AppError::internal("object store I/O failure")
            }
        }
    }
}

impl From<ResourceError> for AppError {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::NotFound(_) => AppError::not_found(err.to_string()),
            ResourceError::SigningFailed(_) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            ResourceError::PersistenceFailed(_) => {
                tracing::error!("{}", err);
                AppError::internal("storage failure")
            }
            ResourceError::AlreadyExists(_) => AppError::new(StatusCode::CONFLICT, err.to_string()),
            ResourceError::InvalidInput(_) => AppError::bad_request(err.to_string()),
            ResourceError::Gateway(inner) => inner.into(),
        }
    }
}

impl From<LinkError> for AppError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::BadSignature => AppError::new(StatusCode::FORBIDDEN, err.to_string()),
            LinkError::Expired => AppError::new(StatusCode::GONE, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn resource_errors_map_to_statuses() {
        let cases = [
            (ResourceError::NotFound(Uuid::nil()), StatusCode::NOT_FOUND),
            (
                ResourceError::SigningFailed("down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ResourceError::PersistenceFailed("locked".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ResourceError::AlreadyExists("cv.pdf".into()),
                StatusCode::CONFLICT,
            ),
            (
                ResourceError::Gateway(GatewayError::InvalidObjectKey),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn link_errors_map_to_statuses() {
        assert_eq!(AppError::from(LinkError::BadSignature).status, StatusCode::FORBIDDEN);
        assert_eq!(AppError::from(LinkError::Expired).status, StatusCode::GONE);
    }
}
