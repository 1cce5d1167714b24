//! Streaming encoder wrapper: codec negotiation, chunk collection and
//! assembly of the finished artifact.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use screenreel_common::format::format_duration;

use crate::error::CaptureError;
use crate::media::{MediaPlatform, MediaStream, StreamEncoder};

/// Encoder output formats in order of preference.
pub const PREFERRED_TYPES: [&str; 8] = [
    "video/mp4;codecs=h264",
    "video/mp4;codecs=avc1",
    "video/mp4",
    "video/webm;codecs=h264",
    "video/webm;codecs=vp9,opus",
    "video/webm;codecs=vp8,opus",
    "video/webm",
    "video/x-matroska;codecs=avc1",
];

/// Tried when the platform reports none of [`PREFERRED_TYPES`].
pub const FALLBACK_TYPE: &str = "video/webm";

/// Interval at which the platform encoder emits chunks.
pub const TIMESLICE: Duration = Duration::from_secs(1);

/// How long finalization waits for the encoder's last chunk.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// One piece of encoder output.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub bytes: Vec<u8>,
    pub emitted_at: Instant,
}

/// Where a platform encoder delivers its output.
#[derive(Debug, Clone)]
pub struct ChunkSink {
    tx: mpsc::UnboundedSender<Chunk>,
}

impl ChunkSink {
    /// Hand over one chunk. Empty chunks are dropped. Returns `false` once
    /// nobody is collecting anymore.
    pub fn emit(&self, bytes: Vec<u8>) -> bool {
        if bytes.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx
            .send(Chunk {
                bytes,
                emitted_at: Instant::now(),
            })
            .is_ok()
    }
}

/// The finished recording, ready to be saved and uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub duration_secs: u64,
    pub extension: &'static str,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>, duration_secs: u64) -> Self {
        let mime_type = mime_type.into();
        Self {
            extension: extension_for(&mime_type),
            bytes,
            mime_type,
            duration_secs,
            created_at: Utc::now(),
        }
    }

    /// `screen_<UTC timestamp>_<duration>.<ext>`, e.g.
    /// `screen_2024-03-01T09-30-00_1m5s.webm`.
    pub fn client_filename(&self) -> String {
        format!(
            "screen_{}_{}.{}",
            self.created_at.format("%Y-%m-%dT%H-%M-%S"),
            format_duration(self.duration_secs),
            self.extension
        )
    }

    /// MIME type without codec parameters.
    pub fn essence(&self) -> &str {
        self.mime_type
            .split(';')
            .next()
            .unwrap_or(&self.mime_type)
            .trim()
    }
}

/// File extension for an encoder MIME type.
pub fn extension_for(mime: &str) -> &'static str {
    let mime = mime.to_ascii_lowercase();
    if mime.contains("webm") {
        "webm"
    } else if mime.contains("matroska") || mime.contains("mkv") {
        "mkv"
    } else {
        "mp4"
    }
}

/// First preferred type the platform supports, else [`FALLBACK_TYPE`].
pub fn negotiate_type(platform: &dyn MediaPlatform) -> &'static str {
    PREFERRED_TYPES
        .iter()
        .copied()
        .find(|mime| platform.is_type_supported(mime))
        .unwrap_or_else(|| {
            warn!("No preferred encoder type supported, trying {FALLBACK_TYPE}");
            FALLBACK_TYPE
        })
}

/// A running platform encoder and the chunks it has produced.
pub struct ArtifactEncoder {
    encoder: Box<dyn StreamEncoder>,
    chunks: mpsc::UnboundedReceiver<Chunk>,
    mime_type: String,
}

impl ArtifactEncoder {
    /// Negotiate a format and start encoding `stream`.
    pub fn start(
        platform: &dyn MediaPlatform,
        stream: &MediaStream,
        bitrate: u64,
    ) -> Result<Self, CaptureError> {
        let requested = negotiate_type(platform);
        let mut encoder = platform.create_encoder(stream, requested, bitrate)?;
        let mime_type = match encoder.mime_type() {
            "" => requested.to_string(),
            negotiated => negotiated.to_string(),
        };

        let (tx, chunks) = mpsc::unbounded_channel();
        encoder.start(TIMESLICE, ChunkSink { tx })?;
        info!("Encoding {mime_type} at {bitrate} bit/s");

        Ok(Self {
            encoder,
            chunks,
            mime_type,
        })
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn pause(&mut self) {
        self.encoder.pause();
    }

    pub fn resume(&mut self) {
        self.encoder.resume();
    }

    /// Stop the encoder, wait for its flush and assemble the chunks in
    /// emission order.
    pub async fn finalize(mut self, duration_secs: u64) -> Result<Artifact, CaptureError> {
        self.encoder.stop();

        let mut collected: Vec<Chunk> = Vec::new();
        let chunks = &mut self.chunks;
        let flushed = tokio::time::timeout(FLUSH_TIMEOUT, async {
            while let Some(chunk) = chunks.recv().await {
                collected.push(chunk);
            }
        })
        .await;
        if flushed.is_err() {
            warn!(
                "Encoder did not flush within {}s, keeping {} chunk(s)",
                FLUSH_TIMEOUT.as_secs(),
                collected.len()
            );
        }

        if collected.is_empty() {
            warn!("Encoder produced no data");
            return Err(CaptureError::NoData);
        }

        let total: usize = collected.iter().map(|c| c.bytes.len()).sum();
        let mut bytes = Vec::with_capacity(total);
        for chunk in &collected {
            bytes.extend_from_slice(&chunk.bytes);
        }
        debug!("Assembled {} chunk(s), {total} bytes", collected.len());

        Ok(Artifact::new(bytes, self.mime_type.clone(), duration_secs))
    }
}

impl Drop for ArtifactEncoder {
    fn drop(&mut self) {
        self.encoder.stop();
    }
}
