//! Session parameters and process-level configuration

pub mod schema;
pub mod store;

pub use schema::{
    AudioMode, EncoderMode, EnforcementSettings, EngineCapabilities, IceSettings,
    RawSessionParameters, SessionParameters, SignalingSettings, StreamerConfig, VideoCodec,
};
pub use store::{load_config, load_or_default};
