//! Region selection and the real-time crop compositor.
//!
//! The user drags a rectangle over a still snapshot of the source; once
//! confirmed, a loop copies that sub-rectangle of every live frame into a
//! surface sized to the region, and the surface's stream replaces the
//! source as the encoder input.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CaptureError;
use crate::media::{DrawSurface, MediaPlatform, MediaStream, MediaTrack, SelectionSurface, Snapshot};

/// Smallest width and height a region may have.
pub const MIN_REGION_SIZE: u32 = 50;

/// How long the user has to confirm or cancel a selection.
pub const SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Rectangle in source-stream pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn is_confirmable(&self) -> bool {
        self.width >= MIN_REGION_SIZE && self.height >= MIN_REGION_SIZE
    }
}

/// Pointer input on the selection surface, in displayed pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SelectionEvent {
    Down { x: f64, y: f64 },
    Move { x: f64, y: f64 },
    Up { x: f64, y: f64 },
    Confirm,
    Cancel,
}

/// Drag state of one selection.
#[derive(Debug, Clone)]
pub struct RegionSelector {
    source: (u32, u32),
    scale: (f64, f64),
    anchor: Option<(f64, f64)>,
    current: Option<Region>,
}

impl RegionSelector {
    /// `display` is the size the snapshot is shown at; pointer positions are
    /// scaled from it to `source` pixels.
    pub fn new(source: (u32, u32), display: (f64, f64)) -> Self {
        let scale = |src: u32, shown: f64| {
            if shown > 0.0 {
                f64::from(src) / shown
            } else {
                1.0
            }
        };
        Self {
            source,
            scale: (scale(source.0, display.0), scale(source.1, display.1)),
            anchor: None,
            current: None,
        }
    }

    pub fn pointer_down(&mut self, x: f64, y: f64) {
        self.anchor = Some(self.to_source(x, y));
        self.current = None;
    }

    pub fn pointer_move(&mut self, x: f64, y: f64) {
        if let Some(anchor) = self.anchor {
            self.current = Some(normalize(anchor, self.to_source(x, y)));
        }
    }

    pub fn pointer_up(&mut self, x: f64, y: f64) {
        self.pointer_move(x, y);
        self.anchor = None;
    }

    pub fn selection(&self) -> Option<Region> {
        self.current
    }

    pub fn can_confirm(&self) -> bool {
        self.current.is_some_and(|r| r.is_confirmable())
    }

    /// The selected region if it is large enough.
    pub fn confirm(&self) -> Option<Region> {
        self.current.filter(Region::is_confirmable)
    }

    fn to_source(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x * self.scale.0).clamp(0.0, f64::from(self.source.0)),
            (y * self.scale.1).clamp(0.0, f64::from(self.source.1)),
        )
    }
}

/// Rectangle spanned by two corners, whichever direction was dragged.
fn normalize(a: (f64, f64), b: (f64, f64)) -> Region {
    Region {
        x: a.0.min(b.0).round() as u32,
        y: a.1.min(b.1).round() as u32,
        width: (a.0 - b.0).abs().round() as u32,
        height: (a.1 - b.1).abs().round() as u32,
    }
}

/// Let the user pick a region over `snapshot`.
///
/// `Ok(None)` means the user cancelled. Confirming a region below the
/// minimum size is ignored and the user keeps dragging.
pub async fn select_region(
    surface: &mut dyn SelectionSurface,
    snapshot: Snapshot,
    timeout: Duration,
) -> Result<Option<Region>, CaptureError> {
    if snapshot.width == 0 || snapshot.height == 0 {
        return Err(CaptureError::SourceUnavailable(
            "source has no frame to select from".into(),
        ));
    }

    let display = surface.show(&snapshot);
    let mut selector = RegionSelector::new((snapshot.width, snapshot.height), display);

    let outcome = tokio::time::timeout(timeout, async {
        while let Some(event) = surface.next_event().await {
            match event {
                SelectionEvent::Down { x, y } => selector.pointer_down(x, y),
                SelectionEvent::Move { x, y } => selector.pointer_move(x, y),
                SelectionEvent::Up { x, y } => selector.pointer_up(x, y),
                SelectionEvent::Confirm => match selector.confirm() {
                    Some(region) => return Some(region),
                    None => debug!(
                        "Selection {:?} below the minimum size, ignoring confirm",
                        selector.selection()
                    ),
                },
                SelectionEvent::Cancel => return None,
            }
        }
        None
    })
    .await;
    surface.close();

    match outcome {
        Ok(Some(region)) => {
            info!(
                "Region selected: {}x{} at ({}, {})",
                region.width, region.height, region.x, region.y
            );
            Ok(Some(region))
        }
        Ok(None) => Ok(None),
        Err(_) => {
            warn!("Region selection timed out after {}s", timeout.as_secs());
            Err(CaptureError::SelectionTimedOut)
        }
    }
}

/// Frame counters of a finished crop loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CropStats {
    pub drawn: u64,
    pub failed: u64,
}

/// A running crop loop and the stream it produces.
pub struct CropHandle {
    stream: MediaStream,
    canvas_tracks: Vec<MediaTrack>,
    cancel: CancellationToken,
    task: Option<JoinHandle<CropStats>>,
}

impl CropHandle {
    /// Cropped video plus the source's forwarded audio.
    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    /// Stop the loop and wait until it has let go of the surface.
    pub async fn stop(mut self) -> CropStats {
        self.cancel.cancel();
        let stats = match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                warn!("Crop loop ended abnormally: {e}");
                CropStats::default()
            }),
            None => CropStats::default(),
        };
        for track in &self.canvas_tracks {
            track.stop();
        }
        debug!("Crop loop stopped ({} drawn, {} failed)", stats.drawn, stats.failed);
        stats
    }
}

impl Drop for CropHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        for track in &self.canvas_tracks {
            track.stop();
        }
    }
}

/// Start compositing `region` of `source` once per display refresh.
pub fn start_crop(
    platform: &dyn MediaPlatform,
    source: &MediaStream,
    region: Region,
    fps: u32,
) -> Result<CropHandle, CaptureError> {
    let mut surface = platform.draw_surface(region.width, region.height)?;
    let canvas = surface.capture_stream(fps);
    let canvas_tracks: Vec<MediaTrack> = canvas.video_tracks().cloned().collect();

    let mut tracks = canvas_tracks.clone();
    tracks.extend(source.audio_tracks().cloned());
    let stream = MediaStream::new(tracks, region.width, region.height);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(crop_loop(
        surface,
        source.clone(),
        region,
        platform.frame_interval(),
        cancel.clone(),
    ));

    Ok(CropHandle {
        stream,
        canvas_tracks,
        cancel,
        task: Some(task),
    })
}

async fn crop_loop(
    mut surface: Box<dyn DrawSurface>,
    source: MediaStream,
    region: Region,
    interval: Duration,
    cancel: CancellationToken,
) -> CropStats {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats = CropStats::default();
    let mut failing = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match surface.draw_region(&source, region) {
                Ok(()) => {
                    stats.drawn += 1;
                    failing = false;
                }
                Err(e) => {
                    stats.failed += 1;
                    // Once per run of failed frames.
                    if !failing {
                        warn!("Crop frame draw failed: {e}");
                        failing = true;
                    }
                }
            },
        }
    }
    stats
}
