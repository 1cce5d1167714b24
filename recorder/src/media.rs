//! Seams to the capture platform.
//!
//! Display media, the microphone, audio mixing, compositing surfaces and the
//! streaming encoder all live outside this crate; the pipeline only talks to
//! them through the traits below.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::encoder::ChunkSink;
use crate::error::CaptureError;
use crate::region::{Region, SelectionEvent};

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

#[derive(Debug)]
struct TrackInner {
    id: u64,
    kind: TrackKind,
    label: String,
    stopped: AtomicBool,
    ended: CancellationToken,
}

/// Shared handle to one platform media track.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                label: label.into(),
                stopped: AtomicBool::new(false),
                ended: CancellationToken::new(),
            }),
        }
    }

    pub fn video(label: impl Into<String>) -> Self {
        Self::new(TrackKind::Video, label)
    }

    pub fn audio(label: impl Into<String>) -> Self {
        Self::new(TrackKind::Audio, label)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Release the track. Idempotent.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            debug!("Stopped {:?} track {} ({})", self.kind(), self.id(), self.label());
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Called by the platform when the source goes away, e.g. the user
    /// revoked sharing.
    pub fn end(&self) {
        self.inner.ended.cancel();
    }

    /// Cancelled once the platform ends the track.
    pub fn ended(&self) -> CancellationToken {
        self.inner.ended.clone()
    }
}

/// A bundle of tracks with the pixel size of its video.
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    tracks: Vec<MediaTrack>,
    width: u32,
    height: u32,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>, width: u32, height: u32) -> Self {
        Self {
            tracks,
            width,
            height,
        }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// End-of-source signal of the primary video track.
    pub fn ended(&self) -> Option<CancellationToken> {
        self.video_tracks().next().map(MediaTrack::ended)
    }
}

/// What to ask the platform for when acquiring the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Request system/tab audio alongside the display.
    pub audio: bool,
}

/// A still frame of a stream, used as the region-selection backdrop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub width: u32,
    pub height: u32,
}

/// The capture platform.
#[async_trait]
pub trait MediaPlatform: Send + Sync {
    /// Prompt for and acquire a display stream.
    async fn display_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<MediaStream, CaptureError>;

    /// Acquire the default microphone.
    async fn microphone(&self) -> Result<MediaStream, CaptureError>;

    /// Mix several audio tracks into one combined track.
    fn mix_audio(&self, tracks: &[MediaTrack]) -> Result<MediaTrack, CaptureError>;

    /// Whether the platform encoder can produce `mime`.
    fn is_type_supported(&self, mime: &str) -> bool;

    fn create_encoder(
        &self,
        stream: &MediaStream,
        mime: &str,
        bitrate: u64,
    ) -> Result<Box<dyn StreamEncoder>, CaptureError>;

    fn snapshot(&self, stream: &MediaStream) -> Result<Snapshot, CaptureError>;

    /// Interactive overlay the user drags a rectangle on.
    fn selection_surface(&self) -> Result<Box<dyn SelectionSurface>, CaptureError>;

    /// Off-screen surface of the given size to composite frames into.
    fn draw_surface(&self, width: u32, height: u32) -> Result<Box<dyn DrawSurface>, CaptureError>;

    /// Time between display refreshes.
    fn frame_interval(&self) -> Duration {
        Duration::from_micros(16_667)
    }
}

/// The platform's streaming encoder bound to one stream.
pub trait StreamEncoder: Send {
    /// Negotiated container/codec.
    fn mime_type(&self) -> &str;

    /// Start emitting chunks into `sink` every `timeslice`. The encoder must
    /// drop the sink once it has flushed after [`stop`](Self::stop).
    fn start(&mut self, timeslice: Duration, sink: ChunkSink) -> Result<(), CaptureError>;

    fn pause(&mut self);

    fn resume(&mut self);

    /// Stop and flush. Idempotent.
    fn stop(&mut self);
}

/// Destination of the region compositor.
pub trait DrawSurface: Send {
    /// Copy `region` of the current source frame onto the whole surface.
    fn draw_region(&mut self, source: &MediaStream, region: Region) -> Result<(), CaptureError>;

    /// Live stream of the surface's contents.
    fn capture_stream(&mut self, fps: u32) -> MediaStream;
}

/// Overlay that shows a snapshot and reports the user's pointer input.
#[async_trait]
pub trait SelectionSurface: Send {
    /// Show the snapshot and return its displayed size in surface pixels.
    fn show(&mut self, snapshot: &Snapshot) -> (f64, f64);

    /// Next user input; `None` once the overlay was dismissed.
    async fn next_event(&mut self) -> Option<SelectionEvent>;

    fn close(&mut self);
}
