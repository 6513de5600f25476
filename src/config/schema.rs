use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default capture width
pub const DEFAULT_WIDTH: u32 = 1280;
/// Default capture height
pub const DEFAULT_HEIGHT: u32 = 720;
/// Default capture framerate
pub const DEFAULT_FPS: u32 = 30;
/// Default video bitrate in kbps
pub const DEFAULT_VIDEO_BITRATE_KBPS: u32 = 2500;
/// Default audio bitrate in kbps
pub const DEFAULT_AUDIO_BITRATE_KBPS: u32 = 64;

/// Requested audio capture mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioMode {
    /// Microphone input
    #[default]
    Mic,
    /// Platform playback loopback
    System,
    /// Microphone plus loopback (degrades to loopback only)
    Mix,
    /// No audio track
    None,
}

impl AudioMode {
    /// Parse a host-supplied mode name; unknown names select the microphone
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "mic" | "microphone" => Self::Mic,
            "system" | "loopback" => Self::System,
            "mix" => Self::Mix,
            "none" | "off" => Self::None,
            other => {
                warn!("Unknown audio mode '{}', using microphone", other);
                Self::Mic
            }
        }
    }
}

impl std::fmt::Display for AudioMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioMode::Mic => write!(f, "mic"),
            AudioMode::System => write!(f, "system"),
            AudioMode::Mix => write!(f, "mix"),
            AudioMode::None => write!(f, "none"),
        }
    }
}

/// Outbound video codec
///
/// H.265 is intentionally absent: engines without hardware HEVC cannot honor it,
/// so requests for it are normalized to H.264.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    VP8,
    VP9,
}

impl VideoCodec {
    /// Normalize a codec name
    ///
    /// Returns the codec and a note when the request could not be honored as-is.
    pub fn normalize(name: &str) -> (Self, Option<String>) {
        let upper = name.trim().to_ascii_uppercase();
        match upper.as_str() {
            "H264" | "H.264" | "AVC" => (Self::H264, None),
            "VP8" => (Self::VP8, None),
            "VP9" => (Self::VP9, None),
            "H265" | "H.265" | "HEVC" => (
                Self::H264,
                Some("H.265/HEVC is not supported by the media engine, falling back to H.264".to_string()),
            ),
            _ => (
                Self::H264,
                Some(format!("Unknown video codec '{}', falling back to H.264", name.trim())),
            ),
        }
    }

    /// Codec name as it appears in SDP rtpmap lines
    pub fn rtpmap_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "H264",
            VideoCodec::VP8 => "VP8",
            VideoCodec::VP9 => "VP9",
        }
    }

    /// Get MIME type for the engine track
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/H264",
            VideoCodec::VP8 => "video/VP8",
            VideoCodec::VP9 => "video/VP9",
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "H.264"),
            VideoCodec::VP8 => write!(f, "VP8"),
            VideoCodec::VP9 => write!(f, "VP9"),
        }
    }
}

/// Encoder preference forwarded to the capture platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncoderMode {
    #[default]
    Auto,
    Hardware,
    Software,
}

impl EncoderMode {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "hardware" | "hw" => Self::Hardware,
            "software" | "sw" => Self::Software,
            _ => Self::Auto,
        }
    }
}

/// Session parameters as typed by the host, before validation
///
/// Every field is optional text; missing or unparsable values fall back to defaults
/// when resolved into [`SessionParameters`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSessionParameters {
    pub url: Option<String>,
    pub token: Option<String>,
    pub audio_source: Option<String>,
    pub video_codec: Option<String>,
    pub strict_codec: bool,
    pub encoder_mode: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
    pub fps: Option<String>,
    pub video_bitrate_kbps: Option<String>,
    pub audio_bitrate_kbps: Option<String>,
}

/// Immutable per-session parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParameters {
    /// WHIP endpoint URL
    pub endpoint: String,
    /// Stream key appended to the endpoint path (empty when absent)
    pub credential: Option<String>,
    pub audio_mode: AudioMode,
    pub video_codec: VideoCodec,
    /// Fail the session when the answer does not carry `video_codec`
    pub strict_codec: bool,
    pub encoder_mode: EncoderMode,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

impl Default for SessionParameters {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            credential: None,
            audio_mode: AudioMode::default(),
            video_codec: VideoCodec::default(),
            strict_codec: false,
            encoder_mode: EncoderMode::default(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            video_bitrate_kbps: DEFAULT_VIDEO_BITRATE_KBPS,
            audio_bitrate_kbps: DEFAULT_AUDIO_BITRATE_KBPS,
        }
    }
}

fn parse_or(value: Option<&str>, default: u32, field: &str) -> u32 {
    let Some(raw) = value else {
        return default;
    };
    match raw.trim().parse::<u32>() {
        Ok(v) if v > 0 => v,
        _ => {
            warn!("Invalid {} '{}', using default {}", field, raw, default);
            default
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl RawSessionParameters {
    /// Resolve into typed parameters, applying defaults and codec normalization
    pub fn resolve(self) -> SessionParameters {
        let (video_codec, note) = self
            .video_codec
            .as_deref()
            .map(VideoCodec::normalize)
            .unwrap_or((VideoCodec::default(), None));
        if let Some(note) = note {
            warn!("{}", note);
        }

        SessionParameters {
            endpoint: self.url.map(|u| u.trim().to_string()).unwrap_or_default(),
            credential: non_empty(self.token),
            audio_mode: self
                .audio_source
                .as_deref()
                .map(AudioMode::parse)
                .unwrap_or_default(),
            video_codec,
            strict_codec: self.strict_codec,
            encoder_mode: self
                .encoder_mode
                .as_deref()
                .map(EncoderMode::parse)
                .unwrap_or_default(),
            width: parse_or(self.width.as_deref(), DEFAULT_WIDTH, "width"),
            height: parse_or(self.height.as_deref(), DEFAULT_HEIGHT, "height"),
            fps: parse_or(self.fps.as_deref(), DEFAULT_FPS, "fps"),
            video_bitrate_kbps: parse_or(
                self.video_bitrate_kbps.as_deref(),
                DEFAULT_VIDEO_BITRATE_KBPS,
                "video bitrate",
            ),
            audio_bitrate_kbps: parse_or(
                self.audio_bitrate_kbps.as_deref(),
                DEFAULT_AUDIO_BITRATE_KBPS,
                "audio bitrate",
            ),
        }
    }
}

/// Process-level streamer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// ICE settings
    pub ice: IceSettings,
    /// WHIP signaling settings
    pub signaling: SignalingSettings,
    /// Media engine build capabilities
    pub engine: EngineCapabilities,
    /// Sender bitrate enforcement policy
    pub enforcement: EnforcementSettings,
}

/// ICE configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceSettings {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// ICE candidate gathering timeout (ms)
    pub gathering_timeout_ms: u64,
}

impl Default for IceSettings {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            gathering_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingSettings {
    /// Timeout for the offer POST, in seconds
    pub http_timeout_secs: u64,
}

impl Default for SignalingSettings {
    fn default() -> Self {
        Self {
            http_timeout_secs: 15,
        }
    }
}

/// Capabilities of the media engine build
///
/// These are known per engine/platform combination and set by configuration,
/// never probed at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineCapabilities {
    /// The engine accepts a custom audio input factory (required for loopback audio)
    pub custom_audio_input: bool,
}

impl Default for EngineCapabilities {
    fn default() -> Self {
        Self {
            custom_audio_input: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementSettings {
    /// Attempts of the post-answer enforcement pass
    pub max_attempts: u32,
    /// Delay between attempts (ms)
    pub retry_delay_ms: u64,
}

impl Default for EnforcementSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay_ms: 200,
        }
    }
}
