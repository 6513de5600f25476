//! webrtc-rs integration
//!
//! Architecture:
//! ```text
//! RtcEngine (process singleton)
//!     |
//!     +-- PeerFactory::create_peer()
//!             |
//!             v
//!         RtcPeer (PeerHandle)
//!             |-- VideoTrack / AudioTrack (send-only transceivers)
//!             |-- RtcSender (SenderHandle) --caps--> track
//!             +-- connection state watch
//!
//! WhipClient (Signaling): offer -> HTTP POST -> answer
//! apply_sender_bitrates: targets -> every sender
//! ```

pub mod bitrate;
pub mod engine;
pub mod peer;
pub mod signaling;
pub mod track;

pub use bitrate::{apply_sender_bitrates, BitrateTargets, EnforcementReport};
pub use engine::{PeerFactory, RtcEngine};
pub use peer::{ConnectionState, EncodingParameters, MediaKind, PeerHandle, SenderHandle};
pub use signaling::{build_target_url, Signaling, WhipClient};
pub use track::{AudioTrack, OutboundTrack, VideoTrack};
