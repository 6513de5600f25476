//! Peer connection seam and its webrtc-rs binding
//!
//! The session engine talks to the media engine only through [`PeerHandle`]
//! and [`SenderHandle`]. [`RtcPeer`] implements them on top of webrtc-rs.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;

use super::track::OutboundTrack;
use crate::error::{AppError, Result};

/// Media kind of a sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Per-encoding send limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodingParameters {
    pub max_bitrate_bps: Option<u32>,
    pub min_bitrate_bps: Option<u32>,
    pub max_framerate: Option<u32>,
}

/// Connection state notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Disconnected or failed; the session cannot continue
    pub fn is_lost(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// An RTP sender on a negotiated connection
#[async_trait]
pub trait SenderHandle: Send + Sync {
    fn kind(&self) -> MediaKind;

    /// Current encodings; empty until the engine has populated them
    async fn parameters(&self) -> Vec<EncodingParameters>;

    async fn set_parameters(&self, encodings: Vec<EncodingParameters>) -> Result<()>;
}

/// A peer connection owned by one session
#[async_trait]
pub trait PeerHandle: Send + Sync {
    /// Attach a track through a send-only transceiver
    async fn add_send_only(&self, track: OutboundTrack) -> Result<()>;

    async fn create_offer(&self) -> Result<String>;

    async fn set_local_offer(&self, sdp: &str) -> Result<()>;

    /// Wait for ICE gathering and return the complete local description
    async fn gathered_local_description(&self) -> Result<String>;

    async fn set_remote_answer(&self, sdp: &str) -> Result<()>;

    async fn senders(&self) -> Vec<Arc<dyn SenderHandle>>;

    fn state_watch(&self) -> watch::Receiver<ConnectionState>;

    async fn close(&self) -> Result<()>;
}

/// webrtc-rs sender with locally tracked limits
///
/// webrtc-rs has no max/min bitrate or framerate on its encodings, so the limits
/// live here and reach the track through its caps channel.
pub struct RtcSender {
    kind: MediaKind,
    sender: Arc<RTCRtpSender>,
    caps: Arc<watch::Sender<EncodingParameters>>,
}

#[async_trait]
impl SenderHandle for RtcSender {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn parameters(&self) -> Vec<EncodingParameters> {
        let engine = self.sender.get_parameters().await;
        let current = *self.caps.borrow();
        engine.encodings.iter().map(|_| current).collect()
    }

    async fn set_parameters(&self, encodings: Vec<EncodingParameters>) -> Result<()> {
        let first = encodings.into_iter().next().ok_or_else(|| {
            AppError::WebRtc(format!("No {} encodings to apply", self.kind))
        })?;
        self.caps.send_replace(first);
        Ok(())
    }
}

/// Peer connection wrapper with event handling
pub struct RtcPeer {
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<RtcSender>>>,
    state_rx: watch::Receiver<ConnectionState>,
    /// Armed before the local description is set so completion is never missed
    gathering: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    gathering_timeout: Duration,
}

impl RtcPeer {
    pub(crate) fn new(
        session_id: String,
        pc: Arc<RTCPeerConnection>,
        gathering_timeout: Duration,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let state_tx = Arc::new(state_tx);
        let id = session_id.clone();

        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state_tx = state_tx.clone();
            let session_id = id.clone();

            Box::pin(async move {
                let new_state = match s {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    _ => return,
                };

                info!("Peer {} connection state: {}", session_id, new_state);
                let _ = state_tx.send(new_state);
            })
        }));

        Self {
            session_id,
            pc,
            senders: Mutex::new(Vec::new()),
            state_rx,
            gathering: tokio::sync::Mutex::new(None),
            gathering_timeout,
        }
    }
}

#[async_trait]
impl PeerHandle for RtcPeer {
    async fn add_send_only(&self, track: OutboundTrack) -> Result<()> {
        let local: Arc<dyn TrackLocal + Send + Sync> = track.track.clone();
        let transceiver = self
            .pc
            .add_transceiver_from_track(
                local,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to add {} track: {}", track.kind, e)))?;

        let sender = transceiver.sender().await;

        // Drain RTCP so the interceptors (NACK, reports) keep running
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        info!(
            "{} track added as send-only (session {})",
            track.kind, self.session_id
        );
        self.senders.lock().push(Arc::new(RtcSender {
            kind: track.kind,
            sender,
            caps: track.caps,
        }));
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create offer: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn set_local_offer(&self, sdp: &str) -> Result<()> {
        let desc = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| AppError::Negotiation(format!("Invalid local offer: {}", e)))?;

        *self.gathering.lock().await = Some(self.pc.gathering_complete_promise().await);

        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to set local description: {}", e)))
    }

    async fn gathered_local_description(&self) -> Result<String> {
        if let Some(mut done) = self.gathering.lock().await.take() {
            if tokio::time::timeout(self.gathering_timeout, done.recv())
                .await
                .is_err()
            {
                warn!(
                    "ICE gathering not complete after {:?} (session {}), sending partial candidates",
                    self.gathering_timeout, self.session_id
                );
            }
        }

        self.pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| AppError::Negotiation("Local description missing".to_string()))
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
        let desc = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| AppError::Negotiation(format!("Invalid SDP answer: {}", e)))?;

        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn senders(&self) -> Vec<Arc<dyn SenderHandle>> {
        self.senders
            .lock()
            .iter()
            .map(|s| s.clone() as Arc<dyn SenderHandle>)
            .collect()
    }

    fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to close peer connection: {}", e)))?;
        debug!("Peer connection closed (session {})", self.session_id);
        Ok(())
    }
}
