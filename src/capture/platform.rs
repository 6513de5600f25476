//! Capture platform seam
//!
//! The platform owns the screen-capture permission flow. A granted
//! authorization can mint one virtual display (screen video) and one
//! playback loopback tap; both must come from the same authorization.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::config::{EncoderMode, VideoCodec};
use crate::error::Result;

/// One encoded picture from the virtual display
#[derive(Debug, Clone)]
pub struct EncodedVideoFrame {
    /// H264 Annex B access unit, or a VP8/VP9 frame
    pub data: Bytes,
    pub duration: Duration,
    pub is_keyframe: bool,
}

/// What the virtual display renders and how it encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplaySpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: VideoCodec,
    pub encoder_mode: EncoderMode,
    /// Initial encoder bitrate
    pub bitrate_bps: u32,
}

/// PCM format delivered by audio inputs (interleaved S16)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u32,
}

impl AudioFormat {
    /// 48kHz stereo, what Opus is negotiated at
    pub const STANDARD: AudioFormat = AudioFormat {
        sample_rate: 48000,
        channels: 2,
    };

    /// Interleaved samples in one 20ms frame
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate / 50 * self.channels) as usize
    }
}

/// Platform capability flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformCapabilities {
    /// The platform can tap playback audio from a capture authorization
    pub loopback_capable: bool,
}

/// Screen video rendering target minted from an authorization
#[async_trait]
pub trait VirtualDisplay: Send + Sync {
    /// Retune the capture-side encoder
    fn set_bitrate(&self, bitrate_bps: u32);

    /// Stop rendering and release the target
    async fn release(&self);
}

/// Source of PCM frames
#[async_trait]
pub trait AudioInput: Send {
    fn format(&self) -> AudioFormat;

    /// Next 20ms frame; `None` when the input has ended
    async fn read_frame(&mut self) -> Result<Option<Vec<i16>>>;

    fn close(&mut self);
}

/// A granted screen-capture authorization
#[async_trait]
pub trait CaptureAuthorization: Send + Sync {
    /// Start rendering the screen into `sink`
    async fn create_virtual_display(
        &self,
        spec: DisplaySpec,
        sink: mpsc::Sender<EncodedVideoFrame>,
    ) -> Result<Arc<dyn VirtualDisplay>>;

    /// Tap playback audio bound to this authorization
    async fn create_loopback_input(&self, format: AudioFormat) -> Result<Box<dyn AudioInput>>;

    /// Flips to `true` when the platform or the user ends the capture
    fn terminated(&self) -> watch::Receiver<bool>;

    /// End the capture session
    async fn stop(&self);
}

/// The platform's capture services
#[async_trait]
pub trait CapturePlatform: Send + Sync {
    fn capabilities(&self) -> PlatformCapabilities;

    async fn open_microphone(&self, format: AudioFormat) -> Result<Box<dyn AudioInput>>;
}

/// Single-use capture authorization handed to one session
///
/// Not `Clone`: the session takes ownership and shares the inner authorization
/// between the video bridge and the loopback tap.
pub struct CaptureGrant {
    authorization: Arc<dyn CaptureAuthorization>,
    stopped: Mutex<bool>,
}

impl CaptureGrant {
    pub fn new(authorization: Arc<dyn CaptureAuthorization>) -> Self {
        Self {
            authorization,
            stopped: Mutex::new(false),
        }
    }

    pub fn authorization(&self) -> Arc<dyn CaptureAuthorization> {
        self.authorization.clone()
    }

    pub fn terminated(&self) -> watch::Receiver<bool> {
        self.authorization.terminated()
    }

    /// Stop the underlying capture once
    pub async fn stop(&self) {
        {
            let mut stopped = self.stopped.lock();
            if *stopped {
                return;
            }
            *stopped = true;
        }
        self.authorization.stop().await;
        info!("Capture authorization stopped");
    }
}

impl std::fmt::Debug for CaptureGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureGrant")
            .field("stopped", &*self.stopped.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAuthorization {
        stops: AtomicUsize,
        terminated: watch::Sender<bool>,
    }

    #[async_trait]
    impl CaptureAuthorization for CountingAuthorization {
        async fn create_virtual_display(
            &self,
            _spec: DisplaySpec,
            _sink: mpsc::Sender<EncodedVideoFrame>,
        ) -> Result<Arc<dyn VirtualDisplay>> {
            Err(crate::error::AppError::Capture("unsupported".to_string()))
        }

        async fn create_loopback_input(&self, _format: AudioFormat) -> Result<Box<dyn AudioInput>> {
            Err(crate::error::AppError::Capture("unsupported".to_string()))
        }

        fn terminated(&self) -> watch::Receiver<bool> {
            self.terminated.subscribe()
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_standard_frame_size() {
        assert_eq!(AudioFormat::STANDARD.samples_per_frame(), 1920);
    }

    #[tokio::test]
    async fn test_grant_stops_once() {
        let auth = Arc::new(CountingAuthorization {
            stops: AtomicUsize::new(0),
            terminated: watch::channel(false).0,
        });
        let grant = CaptureGrant::new(auth.clone());

        grant.stop().await;
        grant.stop().await;
        assert_eq!(auth.stops.load(Ordering::SeqCst), 1);
    }
}
