//! whip-streamer - WHIP streaming session engine
//!
//! Streams a screen capture plus microphone or playback audio to a WHIP
//! ingest server over WebRTC.

pub mod audio;
pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod sdp;
pub mod session;
pub mod utils;
pub mod webrtc;

pub use error::{AppError, Result};
