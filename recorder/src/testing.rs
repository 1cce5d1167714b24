//! In-process capture platform for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use screenreel_common::protocol::UploadResponse;

use crate::encoder::{Artifact, ChunkSink};
use crate::error::CaptureError;
use crate::media::{
    CaptureConstraints, DrawSurface, MediaPlatform, MediaStream, MediaTrack, SelectionSurface,
    Snapshot, StreamEncoder,
};
use crate::region::{Region, SelectionEvent};
use crate::upload::ArtifactSink;

pub const CHUNK_LEN: usize = 100;
pub const CHUNK_BYTE: u8 = 0xAB;
pub const FLUSH_LEN: usize = 10;
pub const FLUSH_BYTE: u8 = 0xEE;

pub struct FakePlatform {
    pub deny_display: bool,
    /// Hand out a tab-audio track when audio is requested.
    pub display_audio: bool,
    pub deny_microphone: bool,
    pub supported: Vec<&'static str>,
    pub snapshot: Snapshot,
    pub display_size: (f64, f64),
    /// `None` leaves the user idle on the overlay.
    pub selection: Option<Vec<SelectionEvent>>,
    pub silent_encoder: bool,
    pub fail_draws: bool,
    pub tracks: Mutex<Vec<MediaTrack>>,
    pub encoded: Mutex<Vec<(MediaStream, u64)>>,
    pub draws: Arc<AtomicUsize>,
    pub mixes: AtomicUsize,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            deny_display: false,
            display_audio: false,
            deny_microphone: false,
            supported: vec!["video/mp4;codecs=h264", "video/webm"],
            snapshot: Snapshot {
                width: 1920,
                height: 1080,
            },
            display_size: (960.0, 540.0),
            selection: None,
            silent_encoder: false,
            fail_draws: false,
            tracks: Mutex::new(Vec::new()),
            encoded: Mutex::new(Vec::new()),
            draws: Arc::new(AtomicUsize::new(0)),
            mixes: AtomicUsize::new(0),
        }
    }
}

impl FakePlatform {
    fn hand_out(&self, track: MediaTrack) -> MediaTrack {
        self.tracks.lock().unwrap().push(track.clone());
        track
    }

    /// Every track the platform ever handed out.
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.lock().unwrap().clone()
    }

    pub fn all_tracks_stopped(&self) -> bool {
        self.tracks().iter().all(MediaTrack::is_stopped)
    }

    pub fn screen_track(&self) -> MediaTrack {
        self.tracks()
            .into_iter()
            .find(|t| t.label() == "screen")
            .unwrap()
    }

    /// Stream handed to the most recent encoder.
    pub fn encoded_stream(&self) -> Option<MediaStream> {
        self.encoded.lock().unwrap().last().map(|(s, _)| s.clone())
    }

    pub fn last_bitrate(&self) -> Option<u64> {
        self.encoded.lock().unwrap().last().map(|(_, b)| *b)
    }

    pub fn draws(&self) -> usize {
        self.draws.load(Ordering::SeqCst)
    }

    pub fn mixes(&self) -> usize {
        self.mixes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaPlatform for FakePlatform {
    async fn display_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<MediaStream, CaptureError> {
        if self.deny_display {
            return Err(CaptureError::PermissionDenied);
        }
        let mut tracks = vec![self.hand_out(MediaTrack::video("screen"))];
        if constraints.audio && self.display_audio {
            tracks.push(self.hand_out(MediaTrack::audio("tab audio")));
        }
        Ok(MediaStream::new(tracks, constraints.width, constraints.height))
    }

    async fn microphone(&self) -> Result<MediaStream, CaptureError> {
        if self.deny_microphone {
            return Err(CaptureError::PermissionDenied);
        }
        Ok(MediaStream::new(vec![self.hand_out(MediaTrack::audio("mic"))], 0, 0))
    }

    fn mix_audio(&self, tracks: &[MediaTrack]) -> Result<MediaTrack, CaptureError> {
        assert!(!tracks.is_empty());
        self.mixes.fetch_add(1, Ordering::SeqCst);
        Ok(self.hand_out(MediaTrack::audio("mixed")))
    }

    fn is_type_supported(&self, mime: &str) -> bool {
        self.supported.iter().any(|s| *s == mime)
    }

    fn create_encoder(
        &self,
        stream: &MediaStream,
        mime: &str,
        bitrate: u64,
    ) -> Result<Box<dyn StreamEncoder>, CaptureError> {
        self.encoded.lock().unwrap().push((stream.clone(), bitrate));
        Ok(Box::new(FakeEncoder {
            mime: mime.to_string(),
            silent: self.silent_encoder,
            paused: Arc::new(AtomicBool::new(false)),
            stop: CancellationToken::new(),
        }))
    }

    fn snapshot(&self, _stream: &MediaStream) -> Result<Snapshot, CaptureError> {
        Ok(self.snapshot)
    }

    fn selection_surface(&self) -> Result<Box<dyn SelectionSurface>, CaptureError> {
        Ok(Box::new(match &self.selection {
            Some(events) => ScriptedSelection::new(self.display_size, events.clone()),
            None => ScriptedSelection::idle(self.display_size),
        }))
    }

    fn draw_surface(&self, width: u32, height: u32) -> Result<Box<dyn DrawSurface>, CaptureError> {
        Ok(Box::new(FakeCanvas {
            width,
            height,
            fail: self.fail_draws,
            draws: self.draws.clone(),
            track: self.hand_out(MediaTrack::video("canvas")),
        }))
    }
}

/// Emits one chunk per timeslice while running and a short flush chunk on
/// stop.
struct FakeEncoder {
    mime: String,
    silent: bool,
    paused: Arc<AtomicBool>,
    stop: CancellationToken,
}

impl StreamEncoder for FakeEncoder {
    fn mime_type(&self) -> &str {
        &self.mime
    }

    fn start(&mut self, timeslice: Duration, sink: ChunkSink) -> Result<(), CaptureError> {
        let stop = self.stop.clone();
        let paused = self.paused.clone();
        let silent = self.silent;
        let payload = move |len: usize, byte: u8| if silent { Vec::new() } else { vec![byte; len] };

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + timeslice;
            let mut ticker = tokio::time::interval_at(start, timeslice);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        sink.emit(payload(FLUSH_LEN, FLUSH_BYTE));
                        break;
                    }
                    _ = ticker.tick() => {
                        if !paused.load(Ordering::SeqCst) {
                            sink.emit(payload(CHUNK_LEN, CHUNK_BYTE));
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn pause(&mut self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&mut self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn stop(&mut self) {
        self.stop.cancel();
    }
}

struct FakeCanvas {
    width: u32,
    height: u32,
    fail: bool,
    draws: Arc<AtomicUsize>,
    track: MediaTrack,
}

impl DrawSurface for FakeCanvas {
    fn draw_region(&mut self, _source: &MediaStream, region: Region) -> Result<(), CaptureError> {
        assert_eq!((region.width, region.height), (self.width, self.height));
        if self.fail {
            return Err(CaptureError::SourceUnavailable("frame not ready".into()));
        }
        self.draws.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn capture_stream(&mut self, _fps: u32) -> MediaStream {
        MediaStream::new(vec![self.track.clone()], self.width, self.height)
    }
}

/// Selection overlay replaying a fixed list of pointer events. Once the
/// script runs out the user just sits there.
pub struct ScriptedSelection {
    display: (f64, f64),
    events: VecDeque<SelectionEvent>,
    pub closed: bool,
}

impl ScriptedSelection {
    pub fn new(display: (f64, f64), events: Vec<SelectionEvent>) -> Self {
        Self {
            display,
            events: events.into(),
            closed: false,
        }
    }

    pub fn idle(display: (f64, f64)) -> Self {
        Self::new(display, Vec::new())
    }
}

#[async_trait]
impl SelectionSurface for ScriptedSelection {
    fn show(&mut self, _snapshot: &Snapshot) -> (f64, f64) {
        self.display
    }

    async fn next_event(&mut self) -> Option<SelectionEvent> {
        match self.events.pop_front() {
            Some(event) => Some(event),
            None => std::future::pending().await,
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Records delivered artifacts; optionally refuses them.
#[derive(Default)]
pub struct MemorySink {
    pub refuse: bool,
    delivered: Mutex<Vec<Artifact>>,
}

impl MemorySink {
    /// A sink whose server refuses every recording.
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn delivered(&self) -> Vec<Artifact> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactSink for MemorySink {
    async fn deliver(&self, artifact: &Artifact) -> Result<UploadResponse, CaptureError> {
        self.delivered.lock().unwrap().push(artifact.clone());
        if self.refuse {
            return Err(CaptureError::UploadRejected("Storage limit reached".into()));
        }
        Ok(UploadResponse {
            success: true,
            filename: format!("rec_test.{}", artifact.extension),
            size: artifact.bytes.len() as u64,
            duration: artifact.duration_secs,
        })
    }
}
