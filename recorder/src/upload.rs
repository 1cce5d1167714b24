//! HTTP client for the recording server's action endpoint.
//!
//! The client keeps the server's session cookie, so the CSRF token fetched
//! with `get_token` stays valid for every later call made through it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use screenreel_common::config::Config;
use screenreel_common::protocol::{
    action, CleanResponse, ListResponse, MessageResponse, Reply, TokenResponse, UploadResponse,
};

use crate::encoder::Artifact;
use crate::error::CaptureError;

/// Somewhere a finished recording is delivered.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn deliver(&self, artifact: &Artifact) -> Result<UploadResponse, CaptureError>;
}

/// Local "save a copy" of every artifact.
#[async_trait]
pub trait LocalCopy: Send + Sync {
    async fn save(&self, file_name: &str, bytes: &[u8]) -> std::io::Result<PathBuf>;
}

/// Saves copies into a directory.
#[derive(Debug, Clone)]
pub struct SaveDir {
    dir: PathBuf,
}

impl SaveDir {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl LocalCopy for SaveDir {
    async fn save(&self, file_name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(file_name);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

pub struct UploadClient {
    http: reqwest::Client,
    endpoint: String,
    token: Mutex<Option<String>>,
    local_copy: Option<Arc<dyn LocalCopy>>,
}

impl UploadClient {
    pub fn new(server_url: &str) -> Result<Self, CaptureError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/", server_url.trim_end_matches('/')),
            token: Mutex::new(None),
            local_copy: None,
        })
    }

    /// Client for `SERVER_URL` that keeps local copies in `SAVE_DIR`.
    pub fn from_config(config: &Config) -> Result<Self, CaptureError> {
        Ok(Self::new(&config.server_url)?.with_local_copy(Arc::new(SaveDir::new(&config.save_dir))))
    }

    pub fn with_local_copy(mut self, local_copy: Arc<dyn LocalCopy>) -> Self {
        self.local_copy = Some(local_copy);
        self
    }

    /// Ask the server for this session's CSRF token.
    pub async fn fetch_token(&self) -> Result<String, CaptureError> {
        let form = Form::new().text("action", action::GET_TOKEN);
        let reply: TokenResponse = self.post(form).await?;
        *self.token.lock().await = Some(reply.token.clone());
        debug!("Obtained CSRF token");
        Ok(reply.token)
    }

    async fn token(&self) -> Result<String, CaptureError> {
        if let Some(token) = self.token.lock().await.clone() {
            return Ok(token);
        }
        self.fetch_token().await
    }

    pub async fn upload(&self, artifact: &Artifact) -> Result<UploadResponse, CaptureError> {
        let token = self.token().await?;
        let file_name = artifact.client_filename();
        let part = Part::bytes(artifact.bytes.clone())
            .file_name(file_name.clone())
            .mime_str(artifact.essence())?;
        let form = Form::new()
            .text("action", action::UPLOAD)
            .text("duration", artifact.duration_secs.to_string())
            .text("csrf_token", token)
            .part("video", part);

        info!("Uploading {file_name} ({} bytes)", artifact.bytes.len());
        let stored: UploadResponse = self.post(form).await?;
        info!("Server stored {} ({} bytes)", stored.filename, stored.size);
        Ok(stored)
    }

    pub async fn list(&self) -> Result<ListResponse, CaptureError> {
        self.post(Form::new().text("action", action::LIST)).await
    }

    pub async fn rename(
        &self,
        old_name: &str,
        new_name: &str,
    ) -> Result<MessageResponse, CaptureError> {
        let form = Form::new()
            .text("action", action::RENAME)
            .text("old_name", old_name.to_string())
            .text("new_name", new_name.to_string())
            .text("csrf_token", self.token().await?);
        self.post(form).await
    }

    pub async fn delete(&self, filename: &str) -> Result<MessageResponse, CaptureError> {
        let form = Form::new()
            .text("action", action::DELETE)
            .text("filename", filename.to_string())
            .text("csrf_token", self.token().await?);
        self.post(form).await
    }

    pub async fn clean_old(&self, days: u32) -> Result<CleanResponse, CaptureError> {
        let form = Form::new()
            .text("action", action::CLEAN_OLD)
            .text("days", days.to_string())
            .text("csrf_token", self.token().await?);
        self.post(form).await
    }

    async fn post<T: DeserializeOwned>(&self, form: Form) -> Result<T, CaptureError> {
        let resp = self.http.post(&self.endpoint).multipart(form).send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;

        match serde_json::from_slice::<Reply<T>>(&body) {
            Ok(Reply::Ok(value)) => Ok(value),
            Ok(Reply::Err(e)) => {
                warn!("Server refused request ({status}): {}", e.error);
                Err(CaptureError::UploadRejected(e.error))
            }
            Err(_) if !status.is_success() => Err(CaptureError::UploadRejected(format!(
                "server returned {status}"
            ))),
            Err(e) => Err(CaptureError::UploadFailed(format!(
                "unexpected response: {e}"
            ))),
        }
    }
}

#[async_trait]
impl ArtifactSink for UploadClient {
    /// Save the local copy first, then upload. A failed copy is only logged.
    async fn deliver(&self, artifact: &Artifact) -> Result<UploadResponse, CaptureError> {
        if let Some(local) = &self.local_copy {
            match local.save(&artifact.client_filename(), &artifact.bytes).await {
                Ok(path) => info!("Saved local copy to {}", path.display()),
                Err(e) => warn!("Cannot save local copy: {e}"),
            }
        }
        self.upload(artifact).await
    }
}
