//! Client side of screenreel: acquires a display (optionally cropped to a
//! region and mixed with the microphone), encodes it, and delivers the
//! finished recording to the server.
//!
//! The capture platform itself sits behind the traits in [`media`].

pub mod encoder;
pub mod error;
pub mod media;
pub mod region;
pub mod session;
pub mod upload;

#[cfg(test)]
mod testing;

pub use encoder::Artifact;
pub use error::CaptureError;
pub use session::{CaptureSession, Recording, SessionCommand, SessionConfig, SessionState};
pub use upload::{ArtifactSink, UploadClient};
