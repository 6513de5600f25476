//! Audio capture -> Opus -> track pipeline
//!
//! One task per session: reads 20ms PCM frames from the selected input,
//! encodes them and writes the packets to the audio track. The encoder
//! bitrate follows the limits applied to the audio sender.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::encoder::{OpusConfig, OpusEncoder};
use crate::capture::AudioInput;
use crate::error::Result;
use crate::utils::LogThrottler;
use crate::warn_throttled;
use crate::webrtc::track::AudioTrack;

/// Running audio pipeline
pub struct AudioPump {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl AudioPump {
    /// Start pumping `input` into `track`
    pub fn spawn(
        mut input: Box<dyn AudioInput>,
        track: Arc<AudioTrack>,
        initial_kbps: u32,
    ) -> Result<Self> {
        let mut encoder = OpusEncoder::new(OpusConfig {
            format: input.format(),
            ..OpusConfig::with_kbps(initial_kbps)
        })?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut caps = track.caps();
            let throttler = LogThrottler::with_secs(5);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = caps.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let target = caps.borrow_and_update().max_bitrate_bps;
                        if let Some(bps) = target {
                            if let Err(e) = encoder.set_bitrate(bps) {
                                warn!("Failed to retune Opus bitrate: {}", e);
                            }
                        }
                    }
                    frame = input.read_frame() => match frame {
                        Ok(Some(pcm)) => {
                            match encoder.encode(&pcm) {
                                Ok(packet) => {
                                    // Write failures before the connection is up are expected
                                    let _ = track.write_packet(&packet).await;
                                }
                                Err(e) => warn_throttled!(throttler, "opus_encode", "Opus encode failed: {}", e),
                            }
                        }
                        Ok(None) => {
                            info!("Audio input ended");
                            break;
                        }
                        Err(e) => {
                            warn!("Audio input failed: {}", e);
                            break;
                        }
                    }
                }
            }

            input.close();
            debug!("Audio pump stopped");
        });

        Ok(Self { cancel, task })
    }

    /// Stop the pipeline and close the input
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Audio pump ended abnormally: {}", e);
        }
    }
}
