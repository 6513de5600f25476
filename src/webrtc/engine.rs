//! Process-lifetime media engine
//!
//! The webrtc-rs API object (codec registry, interceptors) is built once per
//! process and shared by every session. Sessions close their own peer
//! connections but never drop the engine.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::info;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;

use super::peer::{PeerHandle, RtcPeer};
use crate::config::IceSettings;
use crate::error::{AppError, Result};

/// Creates the peer connection for a session
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create_peer(&self, session_id: &str) -> Result<Arc<dyn PeerHandle>>;
}

static SHARED_ENGINE: OnceCell<Arc<RtcEngine>> = OnceCell::const_new();

/// webrtc-rs engine shared across sessions
pub struct RtcEngine {
    api: API,
    ice: IceSettings,
}

impl RtcEngine {
    /// Build a standalone engine
    pub fn new(ice: IceSettings) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        info!(
            "Media engine initialized ({} STUN servers)",
            ice.stun_servers.len()
        );
        Ok(Self { api, ice })
    }

    /// The process-wide engine, created on first use
    ///
    /// Later calls return the existing engine; their settings are ignored.
    pub async fn shared(ice: &IceSettings) -> Result<Arc<RtcEngine>> {
        SHARED_ENGINE
            .get_or_try_init(|| async { RtcEngine::new(ice.clone()).map(Arc::new) })
            .await
            .cloned()
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerFactory for RtcEngine {
    async fn create_peer(&self, session_id: &str) -> Result<Arc<dyn PeerHandle>> {
        let pc = self
            .api
            .new_peer_connection(self.rtc_configuration())
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to create peer connection: {}", e)))?;

        info!("Peer connection created (session {})", session_id);
        Ok(Arc::new(RtcPeer::new(
            session_id.to_string(),
            Arc::new(pc),
            Duration::from_millis(self.ice.gathering_timeout_ms),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shared_engine_is_singleton() {
        let a = RtcEngine::shared(&IceSettings::default()).await.unwrap();
        let other = IceSettings {
            stun_servers: vec![],
            ..Default::default()
        };
        let b = RtcEngine::shared(&other).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.ice.stun_servers.len(), 1);
    }

    #[tokio::test]
    async fn test_create_peer_offer_has_sections() {
        use crate::config::VideoCodec;
        use crate::webrtc::track::{AudioTrack, VideoTrack};

        let engine = RtcEngine::new(IceSettings {
            stun_servers: vec![],
            gathering_timeout_ms: 1000,
        })
        .unwrap();
        let peer = engine.create_peer("test").await.unwrap();
        peer.add_send_only(VideoTrack::new(VideoCodec::H264, "video").outbound())
            .await
            .unwrap();
        peer.add_send_only(AudioTrack::new("audio").outbound())
            .await
            .unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert!(offer.contains("m=video"));
        assert!(offer.contains("m=audio"));
        assert!(offer.contains("a=sendonly"));
        assert_eq!(peer.senders().await.len(), 2);
        peer.close().await.unwrap();
    }
}
