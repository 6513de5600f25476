//! Line-level view of an SDP document
//!
//! Only what the editor needs: line splitting that round-trips the original
//! separator, media section boundaries, and payload-type attribute parsing.

use std::ops::Range;

/// Split an SDP document into lines, remembering the separator
pub(crate) fn split_lines(sdp: &str) -> (Vec<String>, &'static str) {
    let sep = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    (sdp.split(sep).map(str::to_string).collect(), sep)
}

pub(crate) fn join_lines(lines: &[String], sep: &str) -> String {
    lines.join(sep)
}

fn is_media_line(line: &str) -> bool {
    line.starts_with("m=")
}

/// Range of the first media section of `kind` (e.g. "video")
///
/// A section runs from its `m=` line up to the next `m=` line or the end of the document.
pub(crate) fn media_section(lines: &[String], kind: &str) -> Option<Range<usize>> {
    let prefix = format!("m={} ", kind);
    let start = lines.iter().position(|l| l.starts_with(&prefix))?;
    Some(start..section_end(lines, start))
}

/// Range of the section (session-level or media) containing line `index`
pub(crate) fn enclosing_section(lines: &[String], index: usize) -> Range<usize> {
    let start = lines[..=index]
        .iter()
        .rposition(|l| is_media_line(l))
        .unwrap_or(0);
    start..section_end(lines, index)
}

fn section_end(lines: &[String], from: usize) -> usize {
    lines
        .iter()
        .enumerate()
        .skip(from + 1)
        .find(|(_, l)| is_media_line(l))
        .map(|(i, _)| i)
        .unwrap_or(lines.len())
}

/// Parsed `m=` line: the fixed `m=<kind> <port> <proto>` head and the payload types
pub(crate) struct MediaLine {
    head: String,
    pub payload_types: Vec<String>,
}

impl MediaLine {
    pub fn parse(line: &str) -> Option<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 3 || !is_media_line(tokens[0]) {
            return None;
        }
        Some(Self {
            head: tokens[..3].join(" "),
            payload_types: tokens[3..].iter().map(|t| t.to_string()).collect(),
        })
    }

    pub fn render(&self) -> String {
        if self.payload_types.is_empty() {
            self.head.clone()
        } else {
            format!("{} {}", self.head, self.payload_types.join(" "))
        }
    }
}

/// Parse `a=rtpmap:<pt> <codec>/<rate>[/<channels>]` into (pt, encoding)
pub(crate) fn parse_rtpmap(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim().strip_prefix("a=rtpmap:")?;
    let (pt, encoding) = rest.split_once(' ')?;
    if pt.is_empty() || !pt.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((pt, encoding.trim()))
}

/// Codec name of an rtpmap encoding (`H264/90000` -> `H264`)
pub(crate) fn encoding_name(encoding: &str) -> &str {
    encoding.split('/').next().unwrap_or(encoding)
}

/// Payload type addressed by an rtpmap, fmtp or rtcp-fb attribute line
pub(crate) fn attribute_payload_type(line: &str) -> Option<&str> {
    let rest = ["a=rtpmap:", "a=fmtp:", "a=rtcp-fb:"]
        .iter()
        .find_map(|prefix| line.strip_prefix(prefix))?;
    Some(rest.split_whitespace().next().unwrap_or(""))
}

/// Payload types within `range` whose rtpmap codec name matches `codec` (case-insensitive)
pub(crate) fn payload_types_for(lines: &[String], range: Range<usize>, codec: &str) -> Vec<String> {
    lines[range]
        .iter()
        .filter_map(|l| parse_rtpmap(l))
        .filter(|(_, encoding)| encoding_name(encoding).eq_ignore_ascii_case(codec))
        .map(|(pt, _)| pt.to_string())
        .collect()
}
