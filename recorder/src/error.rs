//! Failures of the client-side capture pipeline.

use thiserror::Error;

use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Permission to capture was denied")]
    PermissionDenied,

    #[error("No capture source available: {0}")]
    SourceUnavailable(String),

    #[error("Not supported by this platform: {0}")]
    Unsupported(String),

    #[error("Cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: SessionState,
    },

    #[error("Region selection timed out")]
    SelectionTimedOut,

    #[error("Region selection cancelled")]
    SelectionCancelled,

    #[error("Recording aborted")]
    Aborted,

    #[error("No data was recorded")]
    NoData,

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Server refused the request: {0}")]
    UploadRejected(String),
}

impl From<reqwest::Error> for CaptureError {
    fn from(e: reqwest::Error) -> Self {
        Self::UploadFailed(e.to_string())
    }
}
