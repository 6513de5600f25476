//! SDP text editing
//!
//! Line-level rewrites only; there is no full SDP parser here.

pub mod editor;
mod section;

pub use editor::{
    has_video_codec, prefer_video_codec, restrict_video_codec_if_present,
    set_opus_target_bitrate, video_payload_types,
};
