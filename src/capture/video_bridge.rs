//! Screen capture to video track bridge
//!
//! Binds a frame sink to a virtual display minted from the session's capture
//! authorization and forwards every encoded picture into the [`VideoTrack`].
//! Bitrate limits applied to the video sender flow back to the display's encoder.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::platform::{CaptureAuthorization, DisplaySpec, EncodedVideoFrame, VirtualDisplay};
use crate::error::Result;
use crate::webrtc::peer::EncodingParameters;
use crate::webrtc::track::VideoTrack;

/// Frames buffered between the display and the track
const SINK_CAPACITY: usize = 8;

/// Called once when the capture ends without a local stop
pub type CaptureLostCallback = Box<dyn FnOnce(String) + Send + 'static>;

struct Running {
    display: Arc<dyn VirtualDisplay>,
    cancel: CancellationToken,
    forwarder: JoinHandle<()>,
}

/// Adapter from the platform capture session to the video track
pub struct VideoBridge {
    authorization: Arc<dyn CaptureAuthorization>,
    spec: DisplaySpec,
    running: Option<Running>,
}

impl VideoBridge {
    pub fn new(authorization: Arc<dyn CaptureAuthorization>, spec: DisplaySpec) -> Self {
        Self {
            authorization,
            spec,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start rendering into `track`
    ///
    /// `on_lost` fires if the platform terminates the capture or the display
    /// stops producing before [`stop`](Self::stop) is called.
    pub async fn start(&mut self, track: Arc<VideoTrack>, on_lost: CaptureLostCallback) -> Result<()> {
        if self.running.is_some() {
            debug!("Video bridge already started");
            return Ok(());
        }

        let (sink, frames) = mpsc::channel(SINK_CAPACITY);
        let display = self
            .authorization
            .create_virtual_display(self.spec, sink)
            .await?;

        // Subscribe before the task is spawned so limits written meanwhile are not lost
        let caps = track.caps();
        let terminated = self.authorization.terminated();
        let cancel = CancellationToken::new();
        let forwarder = tokio::spawn(forward_frames(
            frames,
            track,
            caps,
            display.clone(),
            terminated,
            cancel.clone(),
            on_lost,
        ));

        info!(
            "Video capture started: {}x{}@{} {} ({:?} encoder)",
            self.spec.width, self.spec.height, self.spec.fps, self.spec.codec, self.spec.encoder_mode
        );
        self.running = Some(Running {
            display,
            cancel,
            forwarder,
        });
        Ok(())
    }

    /// Unbind the sink, then release the display
    ///
    /// No-op when not started.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            debug!("Video bridge stop before start, ignoring");
            return;
        };

        running.cancel.cancel();
        if let Err(e) = running.forwarder.await {
            warn!("Video forwarder ended abnormally: {}", e);
        }
        running.display.release().await;
        info!("Video capture stopped");
    }
}

async fn forward_frames(
    mut frames: mpsc::Receiver<EncodedVideoFrame>,
    track: Arc<VideoTrack>,
    mut caps: watch::Receiver<EncodingParameters>,
    display: Arc<dyn VirtualDisplay>,
    mut terminated: watch::Receiver<bool>,
    cancel: CancellationToken,
    on_lost: CaptureLostCallback,
) {
    let mut applied_bitrate = caps.borrow_and_update().max_bitrate_bps;
    if let Some(bps) = applied_bitrate {
        display.set_bitrate(bps);
    }

    // The platform may have ended the capture before the bridge started
    let lost = if *terminated.borrow_and_update() {
        Some("capture terminated by platform".to_string())
    } else {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break None,
                changed = terminated.changed() => {
                    if changed.is_err() || *terminated.borrow() {
                        break Some("capture terminated by platform".to_string());
                    }
                }
                changed = caps.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let bitrate = caps.borrow_and_update().max_bitrate_bps;
                    if let Some(bps) = bitrate.filter(|b| Some(*b) != applied_bitrate) {
                        display.set_bitrate(bps);
                        applied_bitrate = Some(bps);
                    }
                }
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = track.write_frame(&frame).await {
                            debug!("Video frame write failed: {}", e);
                        }
                    }
                    None => break Some("virtual display stopped producing frames".to_string()),
                }
            }
        }
    };

    if let Some(reason) = lost {
        if !cancel.is_cancelled() {
            warn!("Screen capture lost: {}", reason);
            on_lost(reason);
        }
    }
}
