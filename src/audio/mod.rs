//! Audio encoding
//!
//! - Opus encoding for WebRTC
//! - Per-session capture -> encode -> track pipeline

pub mod encoder;
pub mod pump;

pub use encoder::{OpusConfig, OpusEncoder, OpusFrame};
pub use pump::AudioPump;
