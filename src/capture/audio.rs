//! Audio source selection
//!
//! Maps the requested audio mode onto what the platform and the media engine
//! can actually provide. Selection never fails a session: anything loopback
//! cannot deliver degrades to the microphone.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::platform::{AudioFormat, AudioInput, CaptureAuthorization, CapturePlatform, PlatformCapabilities};
use crate::config::{AudioMode, EngineCapabilities};
use crate::error::Result;

/// Audio source the session actually uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveAudio {
    Microphone,
    Loopback,
    /// No audio track
    Disabled,
}

impl std::fmt::Display for EffectiveAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EffectiveAudio::Microphone => write!(f, "microphone"),
            EffectiveAudio::Loopback => write!(f, "loopback"),
            EffectiveAudio::Disabled => write!(f, "disabled"),
        }
    }
}

/// Decide the effective audio source
///
/// `mix` does not mix; it captures loopback only.
pub fn select_audio_source(requested: AudioMode, platform: PlatformCapabilities) -> EffectiveAudio {
    match requested {
        AudioMode::None => EffectiveAudio::Disabled,
        AudioMode::Mic => EffectiveAudio::Microphone,
        AudioMode::System | AudioMode::Mix if platform.loopback_capable => {
            if requested == AudioMode::Mix {
                info!("Audio mix requested; capturing loopback only");
            }
            EffectiveAudio::Loopback
        }
        AudioMode::System | AudioMode::Mix => {
            warn!(
                "Audio mode '{}' needs loopback capture, not available on this platform; using microphone",
                requested
            );
            EffectiveAudio::Microphone
        }
    }
}

/// Constructs the audio input the engine consumes
#[async_trait]
pub trait AudioInputFactory: Send + Sync {
    fn source(&self) -> EffectiveAudio;

    async fn open(&self, format: AudioFormat) -> Result<Box<dyn AudioInput>>;
}

/// Platform microphone
pub struct MicrophoneFactory {
    platform: Arc<dyn CapturePlatform>,
}

impl MicrophoneFactory {
    pub fn new(platform: Arc<dyn CapturePlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl AudioInputFactory for MicrophoneFactory {
    fn source(&self) -> EffectiveAudio {
        EffectiveAudio::Microphone
    }

    async fn open(&self, format: AudioFormat) -> Result<Box<dyn AudioInput>> {
        self.platform.open_microphone(format).await
    }
}

/// Playback loopback bound to the session's capture authorization
pub struct LoopbackFactory {
    authorization: Arc<dyn CaptureAuthorization>,
}

impl LoopbackFactory {
    pub fn new(authorization: Arc<dyn CaptureAuthorization>) -> Self {
        Self { authorization }
    }
}

#[async_trait]
impl AudioInputFactory for LoopbackFactory {
    fn source(&self) -> EffectiveAudio {
        EffectiveAudio::Loopback
    }

    async fn open(&self, format: AudioFormat) -> Result<Box<dyn AudioInput>> {
        self.authorization.create_loopback_input(format).await
    }
}

/// Open the input for `effective`, falling back to the microphone
///
/// Loopback needs an engine that accepts a custom input factory; without it, or
/// when the tap cannot be opened, the microphone is used instead. Returns `None`
/// for [`EffectiveAudio::Disabled`].
pub async fn open_audio_input(
    effective: EffectiveAudio,
    platform: Arc<dyn CapturePlatform>,
    authorization: Option<Arc<dyn CaptureAuthorization>>,
    engine: &EngineCapabilities,
    format: AudioFormat,
) -> Result<Option<(EffectiveAudio, Box<dyn AudioInput>)>> {
    let microphone = MicrophoneFactory::new(platform);

    let factory: Box<dyn AudioInputFactory> = match (effective, authorization) {
        (EffectiveAudio::Disabled, _) => return Ok(None),
        (EffectiveAudio::Microphone, _) => Box::new(microphone),
        (EffectiveAudio::Loopback, Some(_)) if !engine.custom_audio_input => {
            warn!("Media engine has no custom audio input support; using microphone");
            Box::new(microphone)
        }
        (EffectiveAudio::Loopback, None) => {
            warn!("No capture authorization for loopback; using microphone");
            Box::new(microphone)
        }
        (EffectiveAudio::Loopback, Some(authorization)) => {
            let loopback = LoopbackFactory::new(authorization);
            match loopback.open(format).await {
                Ok(input) => {
                    info!("Audio source: loopback");
                    return Ok(Some((EffectiveAudio::Loopback, input)));
                }
                Err(e) => {
                    warn!("Loopback capture unavailable ({}); using microphone", e);
                    Box::new(microphone)
                }
            }
        }
    };

    let input = factory.open(format).await?;
    info!("Audio source: {}", factory.source());
    Ok(Some((factory.source(), input)))
}
