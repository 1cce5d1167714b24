//! Failure taxonomy for the action endpoint.
//!
//! Every variant is reported to the client as `{success:false, error}`;
//! I/O faults are reported without internal detail.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;
use tracing::error;

use screenreel_common::format::format_bytes;
use screenreel_common::protocol::ErrorResponse;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid security token")]
    InvalidToken,

    #[error("Too many requests, try again later")]
    RateLimited,

    #[error("File too large ({} max)", format_bytes(*.max))]
    FileTooLarge { size: u64, max: u64 },

    #[error("Storage limit reached ({} total)", format_bytes(*.quota))]
    QuotaExceeded { needed: u64, quota: u64 },

    #[error("A file named {0} already exists")]
    NameCollision(String),

    #[error("Access denied")]
    PathEscape(String),

    #[error("File {0} does not exist")]
    NotFound(String),

    #[error("Extension not allowed: {0}")]
    InvalidExtension(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Internal storage error")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidToken | Self::PathEscape(_) => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::QuotaExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            Self::NameCollision(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidExtension(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        if let Self::Io(e) = &self {
            error!("Store I/O failure: {e}");
        }
        (self.status(), Json(ErrorResponse::new(self.to_string()))).into_response()
    }
}
