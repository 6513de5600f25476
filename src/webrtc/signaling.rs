//! WHIP signaling client
//!
//! One HTTP exchange per session: POST the SDP offer, read the SDP answer.
//! There is no retry; a failed exchange ends the session.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::SignalingSettings;
use crate::error::{AppError, Result, SignalingError};

/// MIME type of WHIP request and response bodies
pub const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Offer/answer exchange with an ingest server
#[async_trait]
pub trait Signaling: Send + Sync {
    async fn send_offer(
        &self,
        endpoint: &str,
        credential: Option<&str>,
        offer: &str,
    ) -> std::result::Result<String, SignalingError>;
}

/// Build the POST target: the credential, when present, becomes an extra path segment
pub fn build_target_url(endpoint: &str, credential: Option<&str>) -> String {
    match credential.map(str::trim).filter(|c| !c.is_empty()) {
        Some(credential) if endpoint.ends_with('/') => format!("{}{}", endpoint, credential),
        Some(credential) => format!("{}/{}", endpoint, credential),
        None => endpoint.to_string(),
    }
}

/// reqwest-backed WHIP client
pub struct WhipClient {
    client: reqwest::Client,
}

impl WhipClient {
    pub fn new(settings: &SignalingSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .connect_timeout(Duration::from_secs(settings.http_timeout_secs.min(10)))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Signaling for WhipClient {
    async fn send_offer(
        &self,
        endpoint: &str,
        credential: Option<&str>,
        offer: &str,
    ) -> std::result::Result<String, SignalingError> {
        let url = build_target_url(endpoint, credential);
        debug!("POST {} ({} bytes of SDP)", endpoint, offer.len());

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, SDP_CONTENT_TYPE)
            .body(offer.to_string())
            .send()
            .await
            .map_err(|e| SignalingError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SignalingError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(SignalingError::RemoteRejected {
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Err(SignalingError::EmptyAnswer);
        }

        info!("WHIP answer received: HTTP {} ({} bytes)", status.as_u16(), body.len());
        Ok(body)
    }
}
