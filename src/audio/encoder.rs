//! Opus audio encoder for WebRTC

use audiopus::coder::GenericCtl;
use audiopus::{coder::Encoder, Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::capture::AudioFormat;
use crate::error::{AppError, Result};

/// Largest Opus packet we produce
const MAX_PACKET_SIZE: usize = 4000;

/// Opus encoder configuration
#[derive(Debug, Clone)]
pub struct OpusConfig {
    /// Input format (sample rate must be 8000, 12000, 16000, 24000, or 48000)
    pub format: AudioFormat,
    /// Target bitrate in bps
    pub bitrate: u32,
    /// Enable in-band forward error correction
    pub fec: bool,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::STANDARD,
            bitrate: 64000,
            fec: true,
        }
    }
}

impl OpusConfig {
    /// Default config at the given bitrate in kbps
    pub fn with_kbps(kbps: u32) -> Self {
        Self {
            bitrate: kbps.saturating_mul(1000),
            ..Default::default()
        }
    }

    fn to_audiopus_sample_rate(&self) -> SampleRate {
        match self.format.sample_rate {
            8000 => SampleRate::Hz8000,
            12000 => SampleRate::Hz12000,
            16000 => SampleRate::Hz16000,
            24000 => SampleRate::Hz24000,
            _ => SampleRate::Hz48000,
        }
    }

    fn to_audiopus_channels(&self) -> Channels {
        if self.format.channels == 1 {
            Channels::Mono
        } else {
            Channels::Stereo
        }
    }
}

/// Encoded Opus frame
#[derive(Debug, Clone)]
pub struct OpusFrame {
    pub data: Bytes,
    pub duration_ms: u32,
}

impl OpusFrame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Opus encoder
pub struct OpusEncoder {
    config: OpusConfig,
    encoder: Encoder,
    output_buffer: Vec<u8>,
}

impl OpusEncoder {
    pub fn new(config: OpusConfig) -> Result<Self> {
        let mut encoder = Encoder::new(
            config.to_audiopus_sample_rate(),
            config.to_audiopus_channels(),
            Application::Audio,
        )
        .map_err(|e| AppError::Audio(format!("Failed to create Opus encoder: {:?}", e)))?;

        encoder
            .set_bitrate(Bitrate::BitsPerSecond(config.bitrate as i32))
            .map_err(|e| AppError::Audio(format!("Failed to set bitrate: {:?}", e)))?;

        if config.fec {
            encoder
                .set_inband_fec(true)
                .map_err(|e| AppError::Audio(format!("Failed to enable FEC: {:?}", e)))?;
        }

        info!(
            "Opus encoder created: {}Hz {}ch {}bps",
            config.format.sample_rate, config.format.channels, config.bitrate
        );

        Ok(Self {
            config,
            encoder,
            output_buffer: vec![0u8; MAX_PACKET_SIZE],
        })
    }

    /// Encode PCM audio data (S16 interleaved)
    pub fn encode(&mut self, pcm_data: &[i16]) -> Result<OpusFrame> {
        let encoded_len = self
            .encoder
            .encode(pcm_data, &mut self.output_buffer)
            .map_err(|e| AppError::Audio(format!("Opus encode failed: {:?}", e)))?;

        let samples = pcm_data.len() as u32 / self.config.format.channels.max(1);
        let duration_ms = (samples * 1000) / self.config.format.sample_rate;

        trace!("Encoded {} samples to {} bytes Opus", pcm_data.len(), encoded_len);

        Ok(OpusFrame {
            data: Bytes::copy_from_slice(&self.output_buffer[..encoded_len]),
            duration_ms,
        })
    }

    pub fn bitrate(&self) -> u32 {
        self.config.bitrate
    }

    /// Retune the target bitrate; no-op when unchanged
    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<()> {
        if bitrate == self.config.bitrate {
            return Ok(());
        }
        self.encoder
            .set_bitrate(Bitrate::BitsPerSecond(bitrate as i32))
            .map_err(|e| AppError::Audio(format!("Failed to set bitrate: {:?}", e)))?;
        debug!("Opus bitrate {} -> {} bps", self.config.bitrate, bitrate);
        self.config.bitrate = bitrate;
        Ok(())
    }
}
