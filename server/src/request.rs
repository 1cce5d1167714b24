//! Parsing of the multipart action form into a typed request.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::multipart::{Multipart, MultipartError};
use axum::http::StatusCode;

use screenreel_common::protocol::action;

use crate::error::StoreError;
use crate::rate_limit::LimitedAction;

/// Default age threshold for `clean_old`.
pub const DEFAULT_CLEAN_DAYS: u32 = 30;

/// The uploaded file and its client-declared metadata.
#[derive(Debug, Clone)]
pub struct UploadForm {
    pub bytes: Bytes,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    /// Advisory recording length reported by the client, in seconds.
    pub duration: u64,
}

#[derive(Debug, Clone)]
pub enum StoreRequest {
    Upload(UploadForm),
    List,
    Rename { old_name: String, new_name: String },
    Delete { filename: String },
    CleanOld { days: u32 },
    GetToken,
}

impl StoreRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Upload(_) => action::UPLOAD,
            Self::List => action::LIST,
            Self::Rename { .. } => action::RENAME,
            Self::Delete { .. } => action::DELETE,
            Self::CleanOld { .. } => action::CLEAN_OLD,
            Self::GetToken => action::GET_TOKEN,
        }
    }

    /// Rate-limit budget for mutating requests; `None` for reads.
    pub fn limited_action(&self) -> Option<LimitedAction> {
        match self {
            Self::Upload(_) => Some(LimitedAction::Upload),
            Self::Rename { .. } => Some(LimitedAction::Rename),
            Self::Delete { .. } => Some(LimitedAction::Delete),
            Self::CleanOld { .. } => Some(LimitedAction::Clean),
            Self::List | Self::GetToken => None,
        }
    }

    /// Whether the request changes the store and so needs the CSRF token.
    pub fn is_mutating(&self) -> bool {
        self.limited_action().is_some()
    }
}

/// A parsed action form.
#[derive(Debug, Clone)]
pub struct ActionForm {
    pub request: StoreRequest,
    pub csrf_token: Option<String>,
}

impl ActionForm {
    /// Drain the multipart body.
    ///
    /// The `csrf_token` field must precede the `video` part: `authorize` is
    /// called with the token seen so far before any file bytes are read, and
    /// the file is read chunk by chunk up to `max_file_size`.
    pub async fn from_multipart(
        mut multipart: Multipart,
        max_file_size: u64,
        authorize: impl Fn(Option<&str>) -> Result<(), StoreError>,
    ) -> Result<Self, StoreError> {
        let mut fields = HashMap::new();
        let mut video = None;

        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|e| multipart_error(e, max_file_size))?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            if name == "video" {
                let token = fields
                    .get("csrf_token")
                    .map(String::as_str)
                    .filter(|t: &&str| !t.is_empty());
                authorize(token)?;

                let file_name = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let mut buf = Vec::new();
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| multipart_error(e, max_file_size))?
                {
                    let size = (buf.len() + chunk.len()) as u64;
                    if size > max_file_size {
                        return Err(StoreError::FileTooLarge {
                            size,
                            max: max_file_size,
                        });
                    }
                    buf.extend_from_slice(&chunk);
                }
                video = Some((Bytes::from(buf), file_name, content_type));
            } else {
                let value = field
                    .text()
                    .await
                    .map_err(|e| multipart_error(e, max_file_size))?;
                fields.insert(name, value);
            }
        }

        Self::from_fields(fields, video)
    }

    /// Build the request from already-collected text fields and file part.
    pub fn from_fields(
        mut fields: HashMap<String, String>,
        video: Option<(Bytes, Option<String>, Option<String>)>,
    ) -> Result<Self, StoreError> {
        let csrf_token = fields.remove("csrf_token").filter(|t| !t.is_empty());
        let kind = fields.remove("action").unwrap_or_default();

        let request = match kind.as_str() {
            action::UPLOAD => {
                let (bytes, file_name, content_type) =
                    video.ok_or_else(|| StoreError::BadRequest("No file uploaded".into()))?;
                if bytes.is_empty() {
                    return Err(StoreError::BadRequest("Uploaded file is empty".into()));
                }
                let duration = fields
                    .get("duration")
                    .and_then(|d| d.trim().parse::<f64>().ok())
                    .filter(|d| d.is_finite() && *d > 0.0)
                    .map(|d| d as u64)
                    .unwrap_or(0);
                StoreRequest::Upload(UploadForm {
                    bytes,
                    file_name,
                    content_type,
                    duration,
                })
            }
            action::LIST => StoreRequest::List,
            action::RENAME => StoreRequest::Rename {
                old_name: required(&mut fields, "old_name")?,
                new_name: required(&mut fields, "new_name")?,
            },
            action::DELETE => StoreRequest::Delete {
                filename: required(&mut fields, "filename")?,
            },
            action::CLEAN_OLD => {
                let days = match fields.get("days").map(|d| d.trim()) {
                    None | Some("") => DEFAULT_CLEAN_DAYS,
                    Some(raw) => raw
                        .parse()
                        .map_err(|_| StoreError::BadRequest(format!("Invalid days: {raw}")))?,
                };
                StoreRequest::CleanOld { days }
            }
            action::GET_TOKEN => StoreRequest::GetToken,
            "" => return Err(StoreError::BadRequest("Missing field: action".into())),
            other => return Err(StoreError::BadRequest(format!("Unknown action: {other}"))),
        };

        Ok(Self {
            request,
            csrf_token,
        })
    }
}

fn required(fields: &mut HashMap<String, String>, key: &str) -> Result<String, StoreError> {
    fields
        .remove(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| StoreError::BadRequest(format!("Missing field: {key}")))
}

fn multipart_error(err: MultipartError, max_file_size: u64) -> StoreError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        StoreError::FileTooLarge {
            size: max_file_size.saturating_add(1),
            max: max_file_size,
        }
    } else {
        StoreError::BadRequest(format!("Malformed form data: {}", err.body_text()))
    }
}
