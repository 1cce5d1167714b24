//! Types and helpers shared by the screenreel server and recorder.

pub mod config;
pub mod format;
pub mod protocol;
