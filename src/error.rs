use thiserror::Error;

use crate::config::VideoCodec;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Invalid or missing session parameters; raised before any resource is acquired
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authorization denied, capture session failed to start, or capture terminated
    #[error("Capture error: {0}")]
    Capture(String),

    /// Local offer/answer creation or description failure
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Remote answer does not offer {0} and strict codec mode is enabled")]
    StrictCodecUnavailable(VideoCodec),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure of the WHIP offer/answer exchange
///
/// None of these are retried; a fresh session is the recovery path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("ingest server rejected offer: HTTP {status}: {body}")]
    RemoteRejected { status: u16, body: String },

    #[error("ingest server returned an empty answer")]
    EmptyAnswer,

    #[error("network error: {0}")]
    Network(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
