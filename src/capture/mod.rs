//! Capture sources
//!
//! Platform capture seam, audio source selection, the screen-to-track video
//! bridge and a file-backed platform for desktop use.

pub mod audio;
pub mod file;
pub mod platform;
pub mod video_bridge;

pub use audio::{
    open_audio_input, select_audio_source, AudioInputFactory, EffectiveAudio, LoopbackFactory,
    MicrophoneFactory,
};
pub use file::FileCapturePlatform;
pub use platform::{
    AudioFormat, AudioInput, CaptureAuthorization, CaptureGrant, CapturePlatform, DisplaySpec,
    EncodedVideoFrame, PlatformCapabilities, VirtualDisplay,
};
pub use video_bridge::{CaptureLostCallback, VideoBridge};
