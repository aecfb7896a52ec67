//! Mapping of failures onto HTTP responses.

use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::store::StoreError;

/// Error returned by API handlers.
///
/// Rendered as `{"error": <message>, "kind": <category>}`.
#[derive(Debug)]
pub enum ApiError {
    Store(StoreError),
    /// The multipart body could not be read.
    Multipart(MultipartError),
    BadRequest(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Store(err) => match err {
                StoreError::UnsupportedType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
                StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                StoreError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                StoreError::Io { source, .. } => source
                    .get_ref()
                    .and_then(|inner| inner.downcast_ref::<MultipartError>())
                    .map(MultipartError::status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            },
            ApiError::Multipart(err) => err.status(),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn kind(&self) -> &'static str {
        match self.status() {
            StatusCode::PAYLOAD_TOO_LARGE => "payload_too_large",
            StatusCode::BAD_REQUEST => "bad_request",
            _ => match self {
                ApiError::Store(err) => err.kind(),
                _ => "bad_request",
            },
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Store(StoreError::UnsupportedType { content_type }) => format!(
                "File type not allowed: {}. Allowed types: images, PDFs, documents, videos, audio, archives",
                content_type
            ),
            ApiError::Store(StoreError::NotFound { .. }) => "File not found".to_string(),
            ApiError::Store(StoreError::PayloadTooLarge { limit }) => {
                format!("File too large: the limit is {} bytes", limit)
            }
            ApiError::Store(err @ StoreError::Io { .. }) => {
                if self.status().is_server_error() {
                    error!(error = %err, "storage failure");
                    "Storage failure".to_string()
                } else {
                    "Upload interrupted".to_string()
                }
            }
            ApiError::Multipart(err) => err.body_text(),
            ApiError::BadRequest(message) => message.clone(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::Multipart(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message(),
            "kind": self.kind(),
        }));
        (self.status(), body).into_response()
    }
}
