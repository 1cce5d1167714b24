//! JSON wire types exchanged between the recorder and the server.
//!
//! Every response to the action endpoint is one of these shapes; failures
//! always use [`ErrorResponse`].

use serde::{Deserialize, Serialize};

/// Value of the `action` form field for each request kind.
pub mod action {
    pub const UPLOAD: &str = "upload";
    pub const LIST: &str = "list";
    pub const RENAME: &str = "rename";
    pub const DELETE: &str = "delete";
    pub const CLEAN_OLD: &str = "clean_old";
    pub const GET_TOKEN: &str = "get_token";
}

/// A single stored recording as reported by `list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingInfo {
    pub filename: String,
    /// Public, read-only URL of the file.
    pub url: String,
    pub size: u64,
    pub size_formatted: String,
    /// Unix timestamp (seconds) of the last write.
    pub created: i64,
    pub created_formatted: String,
    pub extension: String,
}

/// Response to `list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse {
    pub recordings: Vec<RecordingInfo>,
    pub total_files: usize,
    pub total_size: u64,
    pub total_size_formatted: String,
    pub space_limit: u64,
    pub space_limit_formatted: String,
    pub space_available: u64,
    pub space_available_formatted: String,
    pub percentage_used: f64,
}

/// Response to a successful `upload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    pub filename: String,
    pub size: u64,
    /// Echo of the client's advisory duration hint.
    pub duration: u64,
}

/// Response to a successful `rename` or `delete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

/// Response to a successful `clean_old`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanResponse {
    pub success: bool,
    pub deleted_files: usize,
    /// Human-readable amount of reclaimed space.
    pub deleted_size: String,
    pub message: String,
}

/// Response to `get_token`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

/// Error body for any failed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// Either the expected success body or the server's error body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Reply<T> {
    Ok(T),
    Err(ErrorResponse),
}

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
}
