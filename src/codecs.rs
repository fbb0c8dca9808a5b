use std::fmt;

use serde::{Deserialize, Serialize};

/// MediaKind tells an audio track or stream apart from a video one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Audio codecs the engine will negotiate and store, in preference order.
pub const AUDIO_PREFERRED: &[&str] = &["opus", "pcmu", "pcma", "g722"];

/// Video codecs the engine will negotiate and store, in preference order.
pub const VIDEO_PREFERRED: &[&str] = &["vp8", "vp9", "h264"];

/// Payload type advertised and rewritten for every video track.
pub const VIDEO_PAYLOAD_TYPE: u8 = 100;

/// is_supported reports whether a codec name from an info header or an SDP
/// rtpmap is one the engine can handle for the given media kind.
pub fn is_supported(kind: MediaKind, codec: &str) -> bool {
    let table = match kind {
        MediaKind::Audio => AUDIO_PREFERRED,
        MediaKind::Video => VIDEO_PREFERRED,
    };
    table.iter().any(|c| codec.eq_ignore_ascii_case(c))
}

/// audio_payload_type returns the fixed payload type stored and advertised
/// for an audio codec: the static assignments for the ITU codecs, 111 for
/// everything dynamic.
pub fn audio_payload_type(codec: &str) -> u8 {
    if codec.eq_ignore_ascii_case("pcmu") {
        0
    } else if codec.eq_ignore_ascii_case("pcma") {
        8
    } else if codec.eq_ignore_ascii_case("g722") {
        9
    } else {
        111
    }
}

/// clock_rate returns the RTP clock of a negotiated codec, used to convert
/// timestamp deltas back into wall-clock time during replay.
pub fn clock_rate(kind: MediaKind, codec: &str) -> u32 {
    match kind {
        MediaKind::Video => 90_000,
        MediaKind::Audio => {
            if codec.eq_ignore_ascii_case("pcmu")
                || codec.eq_ignore_ascii_case("pcma")
                || codec.eq_ignore_ascii_case("g722")
            {
                8_000
            } else {
                48_000
            }
        }
    }
}

/// RtpMap is the SDP-facing description of a codec: its rtpmap name, clock,
/// channel count and any fmtp parameters it needs.
pub struct RtpMap {
    pub name: &'static str,
    pub clock: u32,
    pub channels: u16,
    pub fmtp: &'static str,
}

/// rtpmap returns the SDP description for a supported codec name.
pub fn rtpmap(codec: &str) -> Option<RtpMap> {
    let map = if codec.eq_ignore_ascii_case("opus") {
        RtpMap {
            name: "opus",
            clock: 48_000,
            channels: 2,
            fmtp: "",
        }
    } else if codec.eq_ignore_ascii_case("pcmu") {
        RtpMap {
            name: "PCMU",
            clock: 8_000,
            channels: 0,
            fmtp: "",
        }
    } else if codec.eq_ignore_ascii_case("pcma") {
        RtpMap {
            name: "PCMA",
            clock: 8_000,
            channels: 0,
            fmtp: "",
        }
    } else if codec.eq_ignore_ascii_case("g722") {
        RtpMap {
            name: "G722",
            clock: 8_000,
            channels: 0,
            fmtp: "",
        }
    } else if codec.eq_ignore_ascii_case("vp8") {
        RtpMap {
            name: "VP8",
            clock: 90_000,
            channels: 0,
            fmtp: "",
        }
    } else if codec.eq_ignore_ascii_case("vp9") {
        RtpMap {
            name: "VP9",
            clock: 90_000,
            channels: 0,
            fmtp: "",
        }
    } else if codec.eq_ignore_ascii_case("h264") {
        RtpMap {
            name: "H264",
            clock: 90_000,
            channels: 0,
            fmtp: "profile-level-id=42e01f;packetization-mode=1",
        }
    } else {
        return None;
    };
    Some(map)
}
