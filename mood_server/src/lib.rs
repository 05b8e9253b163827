//! Detect the mood on a webcam frame and play songs that fit it.
pub mod app;
pub mod endpoints;
pub mod frames;
pub mod meter;
pub mod nn;
pub mod player;
pub mod playlist;
pub mod sensors;
pub mod songs;
pub mod utils;

/// Error type.
pub type Error = Box<dyn std::error::Error + Send + Sync>;
