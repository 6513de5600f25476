//! Outbound media tracks
//!
//! ```text
//! EncodedVideoFrame (H264 Annex B / VP8 / VP9)      OpusFrame
//!        |                                              |
//!        v                                              v
//!   VideoTrack (framerate cap)                     AudioTrack
//!        |                                              |
//!        +------ TrackLocalStaticSample (payloader) ----+
//!                            |
//!                            v
//!                   WebRTC PeerConnection
//! ```
//!
//! Each track owns a caps channel. The sender binding writes the negotiated
//! limits into it; the track and its producers read them back.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, trace};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::peer::{EncodingParameters, MediaKind};
use crate::audio::OpusFrame;
use crate::capture::EncodedVideoFrame;
use crate::config::VideoCodec;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;

/// Stream ID shared by the session's tracks
pub const STREAM_ID: &str = "whip-streamer";

/// Video clock rate (always 90kHz)
const VIDEO_CLOCK_RATE: u32 = 90000;

/// A track ready to be attached to a peer connection
#[derive(Clone)]
pub struct OutboundTrack {
    pub kind: MediaKind,
    pub track: Arc<TrackLocalStaticSample>,
    pub caps: Arc<watch::Sender<EncodingParameters>>,
}

/// Track statistics
#[derive(Debug, Clone, Default)]
pub struct TrackStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub bytes_sent: u64,
    pub keyframes_sent: u64,
    pub errors: u64,
}

fn video_fmtp(codec: VideoCodec) -> String {
    match codec {
        VideoCodec::H264 => {
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_string()
        }
        VideoCodec::VP8 => String::new(),
        VideoCodec::VP9 => "profile-id=0".to_string(),
    }
}

/// Screen video track
pub struct VideoTrack {
    codec: VideoCodec,
    track: Arc<TrackLocalStaticSample>,
    caps: Arc<watch::Sender<EncodingParameters>>,
    last_sent: Mutex<Option<Instant>>,
    stats: Mutex<TrackStats>,
    throttler: LogThrottler,
}

impl VideoTrack {
    pub fn new(codec: VideoCodec, track_id: &str) -> Self {
        let capability = RTCRtpCodecCapability {
            mime_type: codec.mime_type().to_string(),
            clock_rate: VIDEO_CLOCK_RATE,
            channels: 0,
            sdp_fmtp_line: video_fmtp(codec),
            rtcp_feedback: vec![],
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            track_id.to_string(),
            STREAM_ID.to_string(),
        ));
        let (caps, _) = watch::channel(EncodingParameters::default());

        Self {
            codec,
            track,
            caps: Arc::new(caps),
            last_sent: Mutex::new(None),
            stats: Mutex::new(TrackStats::default()),
            throttler: LogThrottler::with_secs(5),
        }
    }

    pub fn outbound(&self) -> OutboundTrack {
        OutboundTrack {
            kind: MediaKind::Video,
            track: self.track.clone(),
            caps: self.caps.clone(),
        }
    }

    /// Follow the limits applied to this track's sender
    pub fn caps(&self) -> watch::Receiver<EncodingParameters> {
        self.caps.subscribe()
    }

    pub fn stats(&self) -> TrackStats {
        self.stats.lock().clone()
    }

    /// Frame-rate gate: keyframes always pass, other frames only once the
    /// minimum interval for `max_framerate` has elapsed.
    fn admit(&self, is_keyframe: bool) -> bool {
        let now = Instant::now();
        let mut last = self.last_sent.lock();
        let min_interval = self
            .caps
            .borrow()
            .max_framerate
            .filter(|fps| *fps > 0)
            .map(|fps| Duration::from_micros(1_000_000 / u64::from(fps)));

        let allowed = match (min_interval, *last) {
            (Some(interval), Some(prev)) if !is_keyframe => {
                // Allow 10% jitter so a source at exactly the cap is not halved
                now.duration_since(prev) >= interval.mul_f32(0.9)
            }
            _ => true,
        };
        if allowed {
            *last = Some(now);
        }
        allowed
    }

    /// Write an encoded frame
    ///
    /// H264 frames are passed as whole Annex B access units; the payloader splits
    /// NAL units and aggregates SPS/PPS. Returns `false` if the frame was dropped by
    /// the framerate cap.
    pub async fn write_frame(&self, frame: &EncodedVideoFrame) -> Result<bool> {
        if frame.data.is_empty() {
            return Ok(false);
        }
        if !self.admit(frame.is_keyframe) {
            self.stats.lock().frames_dropped += 1;
            trace!("Frame dropped by framerate cap");
            return Ok(false);
        }

        let sample = Sample {
            data: frame.data.clone(),
            duration: frame.duration,
            ..Default::default()
        };

        if let Err(e) = self.track.write_sample(&sample).await {
            self.stats.lock().errors += 1;
            if self.throttler.should_log("video_write") {
                debug!("{} write_sample failed (not connected yet?): {}", self.codec, e);
            }
            return Ok(false);
        }

        let mut stats = self.stats.lock();
        stats.frames_sent += 1;
        stats.bytes_sent += frame.data.len() as u64;
        if frame.is_keyframe {
            stats.keyframes_sent += 1;
        }
        Ok(true)
    }
}

/// Opus audio track
pub struct AudioTrack {
    track: Arc<TrackLocalStaticSample>,
    caps: Arc<watch::Sender<EncodingParameters>>,
    stats: Mutex<TrackStats>,
    throttler: LogThrottler,
}

impl AudioTrack {
    pub fn new(track_id: &str) -> Self {
        let capability = RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            track_id.to_string(),
            STREAM_ID.to_string(),
        ));
        let (caps, _) = watch::channel(EncodingParameters::default());

        Self {
            track,
            caps: Arc::new(caps),
            stats: Mutex::new(TrackStats::default()),
            throttler: LogThrottler::with_secs(5),
        }
    }

    pub fn outbound(&self) -> OutboundTrack {
        OutboundTrack {
            kind: MediaKind::Audio,
            track: self.track.clone(),
            caps: self.caps.clone(),
        }
    }

    pub fn caps(&self) -> watch::Receiver<EncodingParameters> {
        self.caps.subscribe()
    }

    pub fn stats(&self) -> TrackStats {
        self.stats.lock().clone()
    }

    /// Write one Opus packet
    pub async fn write_packet(&self, frame: &OpusFrame) -> Result<()> {
        if frame.is_empty() {
            return Ok(());
        }

        let sample = Sample {
            data: Bytes::clone(&frame.data),
            duration: Duration::from_millis(u64::from(frame.duration_ms)),
            ..Default::default()
        };

        match self.track.write_sample(&sample).await {
            Ok(_) => {
                let mut stats = self.stats.lock();
                stats.frames_sent += 1;
                stats.bytes_sent += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.stats.lock().errors += 1;
                if self.throttler.should_log("audio_write") {
                    debug!("Opus write_sample failed: {}", e);
                }
                Err(AppError::WebRtc(format!("Failed to write audio sample: {}", e)))
            }
        }
    }
}
