//! Targeted SDP rewrites
//!
//! Bitrate and codec policy that the engine does not expose through its
//! configuration surface is enforced by editing the SDP text. Every function
//! here is pure and touches only the lines of the section it targets; all
//! other lines pass through unchanged.

use tracing::{debug, info, warn};

use super::section::{
    attribute_payload_type, enclosing_section, join_lines, media_section, parse_rtpmap,
    payload_types_for, split_lines, MediaLine,
};
use crate::config::VideoCodec;

const MAX_AVERAGE_BITRATE: &str = "maxaveragebitrate";

fn is_opus_rtpmap(encoding: &str) -> bool {
    let encoding = encoding.to_ascii_lowercase();
    encoding == "opus/48000" || encoding == "opus/48000/2"
}

/// Pin the Opus `maxaveragebitrate` to `kbps * 1000`
///
/// The first `opus/48000[/2]` rtpmap decides the payload type. An existing fmtp line
/// for it keeps its other keys; otherwise a new fmtp line is inserted right after the
/// rtpmap. Without an Opus payload type the document is returned unchanged.
pub fn set_opus_target_bitrate(sdp: &str, kbps: u32) -> String {
    let (mut lines, sep) = split_lines(sdp);

    let Some((rtpmap_index, pt)) = lines.iter().enumerate().find_map(|(i, l)| {
        parse_rtpmap(l)
            .filter(|(_, encoding)| is_opus_rtpmap(encoding))
            .map(|(pt, _)| (i, pt.to_string()))
    }) else {
        debug!("No opus payload type in SDP, leaving bitrate untouched");
        return sdp.to_string();
    };

    let bps = u64::from(kbps) * 1000;
    let fmtp_prefix = format!("a=fmtp:{} ", pt);
    let section = enclosing_section(&lines, rtpmap_index);

    match section.clone().find(|&i| lines[i].starts_with(&fmtp_prefix)) {
        Some(i) => {
            let params = lines[i][fmtp_prefix.len()..].to_string();
            let mut kept: Vec<String> = params
                .split(';')
                .map(str::trim)
                .filter(|kv| !kv.is_empty())
                .filter(|kv| {
                    kv.split('=')
                        .next()
                        .map(|k| !k.trim().eq_ignore_ascii_case(MAX_AVERAGE_BITRATE))
                        .unwrap_or(true)
                })
                .map(str::to_string)
                .collect();
            kept.push(format!("{}={}", MAX_AVERAGE_BITRATE, bps));
            lines[i] = format!("{}{}", fmtp_prefix, kept.join(";"));
        }
        None => {
            lines.insert(
                rtpmap_index + 1,
                format!("{}{}={}", fmtp_prefix, MAX_AVERAGE_BITRATE, bps),
            );
        }
    }

    info!("SDP munged opus pt={} {}={}", pt, MAX_AVERAGE_BITRATE, bps);
    join_lines(&lines, sep)
}

/// Move the payload types of `codec` to the front of the video m-line
///
/// Relative order inside the preferred and the remaining group is preserved.
/// Returns the input unchanged when the video section does not offer `codec`.
pub fn prefer_video_codec(sdp: &str, codec: VideoCodec) -> String {
    let (mut lines, sep) = split_lines(sdp);
    let Some(section) = media_section(&lines, "video") else {
        return sdp.to_string();
    };

    let targets = payload_types_for(&lines, section.clone(), codec.rtpmap_name());
    if targets.is_empty() {
        warn!("{} not offered in video section, codec preference not applied", codec);
        return sdp.to_string();
    }

    let Some(mut mline) = MediaLine::parse(&lines[section.start]) else {
        return sdp.to_string();
    };
    let (mut preferred, rest): (Vec<String>, Vec<String>) = mline
        .payload_types
        .iter()
        .cloned()
        .partition(|pt| targets.contains(pt));
    preferred.extend(rest);
    mline.payload_types = preferred;

    lines[section.start] = mline.render();
    debug!("Preferred {} payload types {:?}", codec, targets);
    join_lines(&lines, sep)
}

/// Restrict the video section to the payload types of `codec`
///
/// Meant for the answer: the remote side decides which codecs remain. The m-line keeps
/// only the matching types (in their original order) and rtpmap/fmtp/rtcp-fb lines of
/// every other type in the video section are dropped. When the answer does not carry
/// `codec` the input is returned unchanged.
pub fn restrict_video_codec_if_present(sdp: &str, codec: VideoCodec) -> String {
    let (lines, sep) = split_lines(sdp);
    let Some(section) = media_section(&lines, "video") else {
        return sdp.to_string();
    };

    let targets = payload_types_for(&lines, section.clone(), codec.rtpmap_name());
    let Some(mut mline) = MediaLine::parse(&lines[section.start]) else {
        return sdp.to_string();
    };
    let retained: Vec<String> = mline
        .payload_types
        .iter()
        .filter(|pt| targets.contains(pt))
        .cloned()
        .collect();
    if retained.is_empty() {
        debug!("{} absent from answer, video section left as is", codec);
        return sdp.to_string();
    }
    mline.payload_types = retained.clone();

    let mut out = Vec::with_capacity(lines.len());
    for (i, line) in lines.into_iter().enumerate() {
        if i == section.start {
            out.push(mline.render());
            continue;
        }
        if section.contains(&i) {
            if let Some(pt) = attribute_payload_type(&line) {
                if pt != "*" && !retained.iter().any(|r| r == pt) {
                    continue;
                }
            }
        }
        out.push(line);
    }

    debug!("Restricted answer video section to {} {:?}", codec, retained);
    join_lines(&out, sep)
}

/// Whether the video section carries an rtpmap for `codec`
pub fn has_video_codec(sdp: &str, codec: VideoCodec) -> bool {
    let (lines, _) = split_lines(sdp);
    media_section(&lines, "video")
        .map(|section| !payload_types_for(&lines, section, codec.rtpmap_name()).is_empty())
        .unwrap_or(false)
}

/// Payload types listed on the video m-line
pub fn video_payload_types(sdp: &str) -> Vec<String> {
    let (lines, _) = split_lines(sdp);
    media_section(&lines, "video")
        .and_then(|section| MediaLine::parse(&lines[section.start]))
        .map(|m| m.payload_types)
        .unwrap_or_default()
}
