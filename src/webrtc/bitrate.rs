//! Sender bitrate enforcement
//!
//! Re-asserts max/min bitrate and max framerate on every audio and video sender.
//! Safe to call any number of times.

use tracing::{debug, warn};

use super::peer::{EncodingParameters, MediaKind, PeerHandle};

/// Lowest audio bitrate Opus accepts, in kbps
pub const MIN_AUDIO_KBPS: u32 = 6;

/// Session targets the enforcer applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitrateTargets {
    pub video_kbps: u32,
    pub fps: u32,
    pub audio_kbps: u32,
}

impl BitrateTargets {
    /// Encoding parameters for a sender of `kind`
    pub fn encoding_for(&self, kind: MediaKind) -> EncodingParameters {
        match kind {
            MediaKind::Video => {
                let bps = self.video_kbps.max(1).saturating_mul(1000);
                EncodingParameters {
                    max_bitrate_bps: Some(bps),
                    min_bitrate_bps: Some(bps),
                    max_framerate: Some(self.fps.max(1)),
                }
            }
            MediaKind::Audio => {
                let bps = self.audio_kbps.max(MIN_AUDIO_KBPS).saturating_mul(1000);
                EncodingParameters {
                    max_bitrate_bps: Some(bps),
                    min_bitrate_bps: Some(bps),
                    max_framerate: None,
                }
            }
        }
    }
}

/// Outcome of one enforcement pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnforcementReport {
    pub applied: usize,
    /// Senders with no encodings yet
    pub skipped: usize,
    pub failed: usize,
}

impl EnforcementReport {
    /// Every sender took its parameters
    pub fn is_complete(&self) -> bool {
        self.skipped == 0 && self.failed == 0
    }
}

/// Apply `targets` to the senders of `peer`
///
/// Only the first encoding of each sender is rewritten. Never fails; problems are
/// logged and counted in the report.
pub async fn apply_sender_bitrates(peer: &dyn PeerHandle, targets: BitrateTargets) -> EnforcementReport {
    let mut report = EnforcementReport::default();

    for sender in peer.senders().await {
        let kind = sender.kind();
        let mut encodings = sender.parameters().await;
        if encodings.is_empty() {
            warn!("{} sender has no encodings yet, skipping bitrate enforcement", kind);
            report.skipped += 1;
            continue;
        }

        encodings[0] = targets.encoding_for(kind);
        let applied = encodings[0];

        match sender.set_parameters(encodings).await {
            Ok(()) => {
                debug!(
                    "{} sender limits: max={:?}bps min={:?}bps fps={:?}",
                    kind, applied.max_bitrate_bps, applied.min_bitrate_bps, applied.max_framerate
                );
                report.applied += 1;
            }
            Err(e) => {
                warn!("Failed to set {} sender parameters: {}", kind, e);
                report.failed += 1;
            }
        }
    }

    report
}
