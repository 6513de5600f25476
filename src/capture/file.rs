//! File-backed capture platform
//!
//! Stands in for a platform screen-capture binding on desktops: the "screen"
//! is a recorded H264 Annex B (`.h264`) or IVF (`.ivf`, VP8/VP9) file replayed
//! in a loop at the requested framerate, and both audio inputs produce silence.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::media::io::h264_reader::H264Reader;
use webrtc::media::io::ivf_reader::IVFReader;

use super::platform::{
    AudioFormat, AudioInput, CaptureAuthorization, CaptureGrant, CapturePlatform, DisplaySpec,
    EncodedVideoFrame, PlatformCapabilities, VirtualDisplay,
};
use crate::config::VideoCodec;
use crate::error::{AppError, Result};

/// H264 NAL unit types
const NAL_SLICE: u8 = 1;
const NAL_IDR: u8 = 5;

const ANNEX_B_START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Recorded video source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    AnnexB,
    Ivf,
}

fn container_for(path: &Path) -> Result<Container> {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("h264") | Some("264") => Ok(Container::AnnexB),
        Some("ivf") => Ok(Container::Ivf),
        _ => Err(AppError::Config(format!(
            "Unsupported video file {}: expected .h264 or .ivf",
            path.display()
        ))),
    }
}

/// Split an Annex B stream into access units, one per coded slice
///
/// Parameter sets and SEI are carried with the following slice.
fn parse_annex_b(data: &[u8]) -> Vec<(Bytes, bool)> {
    let mut reader = H264Reader::new(Cursor::new(data), 1024 * 1024);
    let mut frames = Vec::new();
    let mut pending = BytesMut::new();
    let mut keyframe = false;

    while let Ok(nal) = reader.next_nal() {
        if nal.data.is_empty() {
            continue;
        }
        let nal_type = nal.data[0] & 0x1F;
        pending.extend_from_slice(&ANNEX_B_START_CODE);
        pending.extend_from_slice(&nal.data);

        if nal_type == NAL_IDR {
            keyframe = true;
        }
        if nal_type == NAL_SLICE || nal_type == NAL_IDR {
            frames.push((pending.split().freeze(), keyframe));
            keyframe = false;
        }
    }
    frames
}

fn vp_keyframe(codec: VideoCodec, frame: &[u8]) -> bool {
    let Some(first) = frame.first() else {
        return false;
    };
    match codec {
        // Frame tag bit 0: 0 = key frame
        VideoCodec::VP8 => first & 0x01 == 0,
        // Profile 0/1 uncompressed header: show_existing_frame, then frame_type
        VideoCodec::VP9 => first & 0x08 == 0 && first & 0x04 == 0,
        VideoCodec::H264 => false,
    }
}

fn parse_ivf(data: Vec<u8>, codec: VideoCodec) -> Result<Vec<(Bytes, bool)>> {
    let (mut reader, header) = IVFReader::new(Cursor::new(data))
        .map_err(|e| AppError::Capture(format!("Invalid IVF file: {}", e)))?;
    debug!(
        "IVF {}x{} fourcc {:?}",
        header.width, header.height, header.four_cc
    );

    let mut frames = Vec::new();
    while let Ok((frame, _)) = reader.parse_next_frame() {
        let keyframe = vp_keyframe(codec, &frame);
        frames.push((frame.freeze(), keyframe));
    }
    Ok(frames)
}

/// Desktop capture platform replaying a recording
pub struct FileCapturePlatform {
    video_path: PathBuf,
    loopback_capable: bool,
}

impl FileCapturePlatform {
    pub fn new(video_path: impl Into<PathBuf>, loopback_capable: bool) -> Self {
        Self {
            video_path: video_path.into(),
            loopback_capable,
        }
    }

    /// Simulate the permission flow; always granted
    pub fn request_capture(&self) -> CaptureGrant {
        info!("Screen capture granted for {}", self.video_path.display());
        CaptureGrant::new(Arc::new(FileAuthorization::new(self.video_path.clone())))
    }
}

#[async_trait]
impl CapturePlatform for FileCapturePlatform {
    fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities {
            loopback_capable: self.loopback_capable,
        }
    }

    async fn open_microphone(&self, format: AudioFormat) -> Result<Box<dyn AudioInput>> {
        Ok(Box::new(SilentInput::new("microphone", format)))
    }
}

/// Authorization over a recording
pub struct FileAuthorization {
    video_path: PathBuf,
    terminated: watch::Sender<bool>,
}

impl FileAuthorization {
    fn new(video_path: PathBuf) -> Self {
        Self {
            video_path,
            terminated: watch::channel(false).0,
        }
    }
}

#[async_trait]
impl CaptureAuthorization for FileAuthorization {
    async fn create_virtual_display(
        &self,
        spec: DisplaySpec,
        sink: mpsc::Sender<EncodedVideoFrame>,
    ) -> Result<Arc<dyn VirtualDisplay>> {
        let container = container_for(&self.video_path)?;
        let data = tokio::fs::read(&self.video_path).await.map_err(|e| {
            AppError::Capture(format!("Failed to read {}: {}", self.video_path.display(), e))
        })?;

        let frames = match (container, spec.codec) {
            (Container::AnnexB, VideoCodec::H264) => parse_annex_b(&data),
            (Container::Ivf, VideoCodec::VP8 | VideoCodec::VP9) => parse_ivf(data, spec.codec)?,
            (container, codec) => {
                return Err(AppError::Capture(format!(
                    "{:?} recording cannot be streamed as {}",
                    container, codec
                )))
            }
        };
        if frames.is_empty() {
            return Err(AppError::Capture(format!(
                "No frames in {}",
                self.video_path.display()
            )));
        }

        info!(
            "Replaying {} frames from {} at {}fps",
            frames.len(),
            self.video_path.display(),
            spec.fps
        );
        let cancel = CancellationToken::new();
        tokio::spawn(replay(frames, spec.fps, sink, cancel.clone()));
        Ok(Arc::new(FileDisplay { cancel }))
    }

    async fn create_loopback_input(&self, format: AudioFormat) -> Result<Box<dyn AudioInput>> {
        Ok(Box::new(SilentInput::new("loopback", format)))
    }

    fn terminated(&self) -> watch::Receiver<bool> {
        self.terminated.subscribe()
    }

    async fn stop(&self) {
        debug!("File capture authorization released");
    }
}

async fn replay(
    frames: Vec<(Bytes, bool)>,
    fps: u32,
    sink: mpsc::Sender<EncodedVideoFrame>,
    cancel: CancellationToken,
) {
    let duration = Duration::from_micros(1_000_000 / u64::from(fps.max(1)));
    let mut ticker = tokio::time::interval(duration);

    for (data, is_keyframe) in frames.iter().cycle() {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let frame = EncodedVideoFrame {
            data: data.clone(),
            duration,
            is_keyframe: *is_keyframe,
        };
        if sink.send(frame).await.is_err() {
            break;
        }
    }
    debug!("File replay ended");
}

struct FileDisplay {
    cancel: CancellationToken,
}

#[async_trait]
impl VirtualDisplay for FileDisplay {
    fn set_bitrate(&self, bitrate_bps: u32) {
        // Recorded frames are already encoded
        debug!("Ignoring encoder bitrate {} for file replay", bitrate_bps);
    }

    async fn release(&self) {
        self.cancel.cancel();
    }
}

/// Real-time silence
struct SilentInput {
    name: &'static str,
    format: AudioFormat,
    ticker: tokio::time::Interval,
    closed: bool,
}

impl SilentInput {
    fn new(name: &'static str, format: AudioFormat) -> Self {
        info!("Opened silent {} input", name);
        Self {
            name,
            format,
            ticker: tokio::time::interval(Duration::from_millis(20)),
            closed: false,
        }
    }
}

#[async_trait]
impl AudioInput for SilentInput {
    fn format(&self) -> AudioFormat {
        self.format
    }

    async fn read_frame(&mut self) -> Result<Option<Vec<i16>>> {
        if self.closed {
            return Ok(None);
        }
        self.ticker.tick().await;
        Ok(Some(vec![0; self.format.samples_per_frame()]))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!("Closed silent {} input", self.name);
        }
    }
}

impl Drop for SilentInput {
    fn drop(&mut self) {
        if !self.closed {
            warn!("Silent {} input dropped without close", self.name);
        }
    }
}
