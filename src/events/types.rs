//! Session event types
//!
//! Defines the notifications published to the host through the event bus.

use serde::{Deserialize, Serialize};

use crate::config::VideoCodec;
use crate::session::SessionState;

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// Explicit stop from the host
    UserRequested,
    /// Ingest server answered with a non-2xx status
    RemoteRejected,
    /// Peer connection reported disconnected or failed
    ConnectionLost,
    /// Strict codec mode and the answer lacks the requested codec
    StrictCodecUnavailable,
    /// Platform capture was revoked or failed
    CaptureLost,
    /// Transport failure or empty answer during signaling
    SignalingFailed,
    /// Local offer or description handling failed
    NegotiationFailed,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::UserRequested => "user-requested",
            StopReason::RemoteRejected => "remote-rejected",
            StopReason::ConnectionLost => "connection-lost",
            StopReason::StrictCodecUnavailable => "strict-codec-unavailable",
            StopReason::CaptureLost => "capture-lost",
            StopReason::SignalingFailed => "signaling-failed",
            StopReason::NegotiationFailed => "negotiation-failed",
        };
        write!(f, "{}", s)
    }
}

/// Session event
///
/// JSON structure like:
/// ```json
/// {
///   "event": "session.stopped",
///   "data": { "session_id": "…", "reason": "remote-rejected", "detail": "HTTP 403: bad key" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    /// Lifecycle state changed
    #[serde(rename = "session.state_changed")]
    StateChanged {
        session_id: String,
        state: SessionState,
    },

    /// Remote answer applied; media is flowing
    #[serde(rename = "session.streaming")]
    Streaming {
        session_id: String,
        codec: VideoCodec,
    },

    /// Session resources released
    #[serde(rename = "session.stopped")]
    Stopped {
        session_id: String,
        reason: StopReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl SessionEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "session.state_changed",
            Self::Streaming { .. } => "session.streaming",
            Self::Stopped { .. } => "session.stopped",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::StateChanged { session_id, .. }
            | Self::Streaming { session_id, .. }
            | Self::Stopped { session_id, .. } => session_id,
        }
    }
}
