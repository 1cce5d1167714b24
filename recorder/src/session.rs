//! Recording session state machine.
//!
//! ```text
//! Idle → Requesting → (RegionSelecting) → Capturing ⇄ Paused
//!      → Stopping → Uploading → Done
//! ```
//!
//! `Failed` is reachable from every non-terminal state. Every path into
//! `Done`, `Failed` or back to `Idle` releases the session's tracks, crop
//! loop and encoder.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use screenreel_common::config::{CaptureMode, Config};
use screenreel_common::protocol::UploadResponse;

use crate::encoder::ArtifactEncoder;
use crate::error::CaptureError;
use crate::media::{CaptureConstraints, MediaPlatform, MediaStream, MediaTrack};
use crate::region::{select_region, start_crop, CropHandle, SELECTION_TIMEOUT};
use crate::upload::ArtifactSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Requesting,
    RegionSelecting,
    Capturing,
    Paused,
    Stopping,
    Uploading,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    fn accepts_start(self) -> bool {
        matches!(self, Self::Idle | Self::Done | Self::Failed)
    }

    fn is_recording(self) -> bool {
        matches!(self, Self::Capturing | Self::Paused)
    }
}

/// Capture options for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: u64,
    /// Request system/tab audio with the display.
    pub capture_audio: bool,
    pub microphone: bool,
    pub mode: CaptureMode,
    /// Stop once this much time has been recorded.
    pub auto_stop: Option<Duration>,
    pub selection_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate: 5_000_000,
            capture_audio: false,
            microphone: false,
            mode: CaptureMode::Screen,
            auto_stop: None,
            selection_timeout: SELECTION_TIMEOUT,
        }
    }
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            width: config.capture_width,
            height: config.capture_height,
            fps: config.capture_fps,
            bitrate: config.video_bitrate,
            capture_audio: config.capture_audio,
            microphone: config.microphone,
            mode: config.capture_mode,
            auto_stop: config.auto_stop,
            selection_timeout: SELECTION_TIMEOUT,
        }
    }

    fn constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            width: self.width,
            height: self.height,
            fps: self.fps,
            audio: self.capture_audio,
        }
    }
}

/// User input while a recording runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Pause,
    Resume,
    Stop,
}

/// Recorded-time clock that only advances while running.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stopwatch {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl Stopwatch {
    pub fn start(&mut self) {
        self.accumulated = Duration::ZERO;
        self.running_since = Some(Instant::now());
    }

    pub fn pause(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += since.elapsed();
        }
    }

    pub fn resume(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.accumulated + self.running_since.map_or(Duration::ZERO, |s| s.elapsed())
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }
}

/// A finished, delivered recording.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub client_filename: String,
    pub mime_type: String,
    pub size: u64,
    pub duration_secs: u64,
    pub stored: UploadResponse,
}

/// Everything a session holds on the platform.
#[derive(Default)]
struct Resources {
    source: MediaStream,
    microphone: Option<MediaStream>,
    mixed: Option<MediaTrack>,
    crop: Option<CropHandle>,
    encoder: Option<ArtifactEncoder>,
}

impl Resources {
    fn release(&mut self) {
        // Dropping the crop handle cancels its loop.
        self.crop.take();
        self.encoder.take();
        self.source.stop_all();
        if let Some(mic) = self.microphone.take() {
            mic.stop_all();
        }
        if let Some(mixed) = self.mixed.take() {
            mixed.stop();
        }
    }
}

pub struct CaptureSession {
    platform: Arc<dyn MediaPlatform>,
    sink: Arc<dyn ArtifactSink>,
    config: SessionConfig,
    state: SessionState,
    resources: Option<Resources>,
    stopwatch: Stopwatch,
    abort: CancellationToken,
}

impl CaptureSession {
    pub fn new(
        platform: Arc<dyn MediaPlatform>,
        sink: Arc<dyn ArtifactSink>,
        config: SessionConfig,
    ) -> Self {
        Self {
            platform,
            sink,
            config,
            state: SessionState::Idle,
            resources: None,
            stopwatch: Stopwatch::default(),
            abort: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Recorded time so far; frozen while paused.
    pub fn elapsed(&self) -> Duration {
        self.stopwatch.elapsed()
    }

    /// Cancelling the token abandons the current run at its next suspension
    /// point and returns the session to `Idle` with a fresh token.
    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Acquire the source and start encoding.
    pub async fn start(&mut self) -> Result<(), CaptureError> {
        if !self.state.accepts_start() {
            return Err(CaptureError::InvalidState {
                action: "start",
                state: self.state,
            });
        }
        if self.abort.is_cancelled() {
            // Cancelled while nothing was running.
            self.abort = CancellationToken::new();
        }
        self.stopwatch = Stopwatch::default();
        self.set_state(SessionState::Requesting);

        let Self {
            platform,
            config,
            state,
            resources,
            abort,
            ..
        } = self;
        let acquired = acquire(&**platform, config, abort, state, resources).await;

        match acquired {
            Ok(()) => {
                self.stopwatch.start();
                self.set_state(SessionState::Capturing);
                Ok(())
            }
            Err(e) => {
                self.shutdown().await;
                let next = match e {
                    CaptureError::SelectionCancelled | CaptureError::Aborted => SessionState::Idle,
                    _ => SessionState::Failed,
                };
                if next == SessionState::Failed {
                    warn!("Capture could not start: {e}");
                    self.set_state(next);
                } else {
                    info!("Capture not started: {e}");
                    self.return_to_idle();
                }
                Err(e)
            }
        }
    }

    pub fn pause(&mut self) -> Result<(), CaptureError> {
        if self.state != SessionState::Capturing {
            return Err(CaptureError::InvalidState {
                action: "pause",
                state: self.state,
            });
        }
        if let Some(encoder) = self.resources.as_mut().and_then(|r| r.encoder.as_mut()) {
            encoder.pause();
        }
        self.stopwatch.pause();
        self.set_state(SessionState::Paused);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), CaptureError> {
        if self.state != SessionState::Paused {
            return Err(CaptureError::InvalidState {
                action: "resume",
                state: self.state,
            });
        }
        if let Some(encoder) = self.resources.as_mut().and_then(|r| r.encoder.as_mut()) {
            encoder.resume();
        }
        self.stopwatch.resume();
        self.set_state(SessionState::Capturing);
        Ok(())
    }

    /// Finalize the encoder, release the capture and deliver the artifact.
    pub async fn stop(&mut self) -> Result<Recording, CaptureError> {
        if !self.state.is_recording() {
            return Err(CaptureError::InvalidState {
                action: "stop",
                state: self.state,
            });
        }
        self.set_state(SessionState::Stopping);
        self.stopwatch.pause();
        let duration_secs = self.stopwatch.elapsed().as_secs();

        let encoder = self.resources.as_mut().and_then(|r| r.encoder.take());
        let finalized = match encoder {
            Some(encoder) => encoder.finalize(duration_secs).await,
            None => Err(CaptureError::NoData),
        };
        self.shutdown().await;

        let artifact = match finalized {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!("Recording produced no artifact: {e}");
                self.set_state(SessionState::Failed);
                return Err(e);
            }
        };

        self.set_state(SessionState::Uploading);
        match self.sink.deliver(&artifact).await {
            Ok(stored) => {
                self.set_state(SessionState::Done);
                Ok(Recording {
                    client_filename: artifact.client_filename(),
                    mime_type: artifact.mime_type,
                    size: artifact.bytes.len() as u64,
                    duration_secs,
                    stored,
                })
            }
            Err(e) => {
                warn!("Recording not delivered: {e}");
                self.set_state(SessionState::Failed);
                Err(e)
            }
        }
    }

    /// Run a started recording until a stop command, the end of the source,
    /// or the auto-stop limit, then stop it.
    pub async fn drive(
        &mut self,
        commands: &mut mpsc::Receiver<SessionCommand>,
    ) -> Result<Recording, CaptureError> {
        if !self.state.is_recording() {
            return Err(CaptureError::InvalidState {
                action: "drive",
                state: self.state,
            });
        }
        let source_ended = self
            .resources
            .as_ref()
            .and_then(|r| r.source.ended())
            .unwrap_or_default();
        let abort = self.abort.clone();

        loop {
            let remaining = match (self.config.auto_stop, self.state) {
                (Some(limit), SessionState::Capturing) => {
                    Some(limit.saturating_sub(self.stopwatch.elapsed()))
                }
                _ => None,
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Pause) => {
                        if let Err(e) = self.pause() {
                            debug!("Ignoring pause: {e}");
                        }
                    }
                    Some(SessionCommand::Resume) => {
                        if let Err(e) = self.resume() {
                            debug!("Ignoring resume: {e}");
                        }
                    }
                    Some(SessionCommand::Stop) | None => break,
                },
                _ = source_ended.cancelled() => {
                    info!("Capture source ended, finishing recording");
                    break;
                }
                _ = tokio::time::sleep(remaining.unwrap_or_default()), if remaining.is_some() => {
                    info!("Auto-stop after {}s of recording", self.stopwatch.elapsed().as_secs());
                    break;
                }
                _ = abort.cancelled() => {
                    info!("Recording aborted");
                    self.shutdown().await;
                    self.return_to_idle();
                    return Err(CaptureError::Aborted);
                }
            }
        }

        self.stop().await
    }

    // ── internals ────────────────────────────────────────────────────────

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            debug!("Session {:?} → {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Back to `Idle` with an uncancelled abort token for the next run.
    fn return_to_idle(&mut self) {
        if self.abort.is_cancelled() {
            self.abort = CancellationToken::new();
        }
        self.set_state(SessionState::Idle);
    }

    /// Release everything, waiting for the crop loop to finish.
    async fn shutdown(&mut self) {
        let Some(mut resources) = self.resources.take() else {
            return;
        };
        if let Some(crop) = resources.crop.take() {
            crop.stop().await;
        }
        resources.release();
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(mut resources) = self.resources.take() {
            warn!("Session dropped while {:?}, releasing capture", self.state);
            resources.release();
        }
    }
}

/// Race `fut` against the session's abort token.
async fn abortable<T>(
    abort: &CancellationToken,
    fut: impl Future<Output = Result<T, CaptureError>>,
) -> Result<T, CaptureError> {
    tokio::select! {
        _ = abort.cancelled() => Err(CaptureError::Aborted),
        result = fut => result,
    }
}

/// Acquire the source, optionally crop it and mix in the microphone, then
/// start the encoder. Everything acquired lands in `slot` as it happens so a
/// failure part way can be cleaned up.
async fn acquire(
    platform: &dyn MediaPlatform,
    config: &SessionConfig,
    abort: &CancellationToken,
    state: &mut SessionState,
    slot: &mut Option<Resources>,
) -> Result<(), CaptureError> {
    let source = abortable(abort, platform.display_media(&config.constraints())).await?;
    info!(
        "Display acquired: {}x{}, {} audio track(s)",
        source.width(),
        source.height(),
        source.audio_tracks().count()
    );
    let resources = slot.insert(Resources {
        source: source.clone(),
        ..Resources::default()
    });

    let mut stream = source.clone();
    if config.mode == CaptureMode::Region {
        debug!("Session {:?} → {:?}", state, SessionState::RegionSelecting);
        *state = SessionState::RegionSelecting;

        let snapshot = platform.snapshot(&source)?;
        let mut surface = platform.selection_surface()?;
        let selected = abortable(
            abort,
            select_region(surface.as_mut(), snapshot, config.selection_timeout),
        )
        .await?;
        let Some(region) = selected else {
            return Err(CaptureError::SelectionCancelled);
        };

        let crop = start_crop(platform, &source, region, config.fps)?;
        stream = crop.stream().clone();
        resources.crop = Some(crop);
    }

    if config.microphone {
        stream = attach_microphone(platform, abort, resources, stream).await?;
    }

    resources.encoder = Some(ArtifactEncoder::start(platform, &stream, config.bitrate)?);
    Ok(())
}

/// Mix the microphone into `stream`'s audio. Refusal or mixing failure
/// leaves `stream` as it was.
async fn attach_microphone(
    platform: &dyn MediaPlatform,
    abort: &CancellationToken,
    resources: &mut Resources,
    stream: MediaStream,
) -> Result<MediaStream, CaptureError> {
    let mic = match abortable(abort, platform.microphone()).await {
        Ok(mic) => mic,
        Err(CaptureError::Aborted) => return Err(CaptureError::Aborted),
        Err(e) => {
            warn!("Microphone unavailable, recording without it: {e}");
            return Ok(stream);
        }
    };

    let audio: Vec<MediaTrack> = stream
        .audio_tracks()
        .chain(mic.audio_tracks())
        .cloned()
        .collect();
    match platform.mix_audio(&audio) {
        Ok(mixed) => {
            let mut tracks: Vec<MediaTrack> = stream.video_tracks().cloned().collect();
            tracks.push(mixed.clone());
            resources.microphone = Some(mic);
            resources.mixed = Some(mixed);
            debug!("Mixed {} audio track(s) with the microphone", audio.len());
            Ok(MediaStream::new(tracks, stream.width(), stream.height()))
        }
        Err(e) => {
            warn!("Cannot mix microphone audio, recording without it: {e}");
            mic.stop_all();
            Ok(stream)
        }
    }
}
