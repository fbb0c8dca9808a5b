#[cfg(test)]
mod negotiation_test;

use std::io::Cursor;

use sdp::{MediaDescription, SessionDescription};

use crate::codecs::{self, MediaKind};
use crate::error::{Error, Result};

/// Direction advertised on every generated media line: `sendonly` toward
/// replay viewers, `recvonly` toward recording peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendOnly,
    RecvOnly,
}

impl Direction {
    fn attribute(self) -> &'static str {
        match self {
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
        }
    }
}

/// OfferedTrack is the codec a peer's SDP settled on for one media kind,
/// with the payload type the peer mapped it to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedTrack {
    pub codec: String,
    pub payload_type: u8,
}

/// OfferedTracks is the outcome of scanning a peer's offer or answer: at
/// most one usable track per media kind.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OfferedTracks {
    pub audio: Option<OfferedTrack>,
    pub video: Option<OfferedTrack>,
}

impl OfferedTracks {
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// parse_tracks scans a peer SDP for the first audio and video media line
/// the engine can record from, matching advertised codecs against the
/// preferred tables. Media lines the peer marked `recvonly` or `inactive`
/// will never carry inbound media and are treated as absent.
pub fn parse_tracks(sdp_text: &str) -> Result<OfferedTracks> {
    let session = SessionDescription::unmarshal(&mut Cursor::new(sdp_text.as_bytes()))
        .map_err(|_| Error::ErrInvalidSdp)?;

    let mut tracks = OfferedTracks::default();
    for media in &session.media_descriptions {
        let kind = match media.media_name.media.as_str() {
            "audio" => MediaKind::Audio,
            "video" => MediaKind::Video,
            _ => continue,
        };
        if media.attribute("recvonly").is_some() || media.attribute("inactive").is_some() {
            continue;
        }
        let slot = match kind {
            MediaKind::Audio => &mut tracks.audio,
            MediaKind::Video => &mut tracks.video,
        };
        if slot.is_none() {
            *slot = preferred_codec(kind, media);
        }
    }
    Ok(tracks)
}

/// preferred_codec picks the highest-preference codec a media line
/// advertises, either through an rtpmap or through a static payload type.
fn preferred_codec(kind: MediaKind, media: &MediaDescription) -> Option<OfferedTrack> {
    let mut advertised: Vec<(u8, String)> = Vec::new();
    for attr in &media.attributes {
        if attr.key != "rtpmap" {
            continue;
        }
        let Some(value) = attr.value.as_deref() else {
            continue;
        };
        // "<pt> <name>/<clock>[/<channels>]"
        let mut parts = value.splitn(2, ' ');
        let pt = parts.next().and_then(|p| p.parse::<u8>().ok());
        let name = parts.next().and_then(|rest| rest.split('/').next());
        if let (Some(pt), Some(name)) = (pt, name) {
            advertised.push((pt, name.to_ascii_lowercase()));
        }
    }
    for format in &media.media_name.formats {
        let (pt, name) = match format.as_str() {
            "0" => (0, "pcmu"),
            "8" => (8, "pcma"),
            "9" => (9, "g722"),
            _ => continue,
        };
        if !advertised.iter().any(|(_, n)| n == name) {
            advertised.push((pt, name.to_owned()));
        }
    }

    let table = match kind {
        MediaKind::Audio => codecs::AUDIO_PREFERRED,
        MediaKind::Video => codecs::VIDEO_PREFERRED,
    };
    table.iter().find_map(|preferred| {
        advertised
            .iter()
            .find(|(_, name)| name == preferred)
            .map(|(pt, name)| OfferedTrack {
                codec: name.clone(),
                payload_type: *pt,
            })
    })
}

/// MediaParams describes one media line of a generated offer or answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaParams {
    pub codec: String,
    pub payload_type: u8,
}

/// generate_sdp builds an offer or answer advertising the given tracks in
/// one direction. Transport-level attributes are the signalling host's
/// business and are left out.
pub fn generate_sdp(
    session_id: u64,
    version: u64,
    direction: Direction,
    audio: Option<&MediaParams>,
    video: Option<&MediaParams>,
) -> Result<String> {
    let mut session = SessionDescription::new_jsep_session_description(false);
    session.origin.session_id = session_id;
    session.origin.session_version = version;
    session.session_name = "mjr-recordplay".to_owned();

    if let Some(params) = audio {
        session = session.with_media(media_description(MediaKind::Audio, params, direction)?);
    }
    if let Some(params) = video {
        session = session.with_media(media_description(MediaKind::Video, params, direction)?);
    }
    Ok(session.marshal())
}

fn media_description(
    kind: MediaKind,
    params: &MediaParams,
    direction: Direction,
) -> Result<MediaDescription> {
    let map = codecs::rtpmap(&params.codec)
        .ok_or_else(|| Error::ErrUnsupportedCodec(params.codec.clone()))?;

    let mut media = MediaDescription::new_jsep_media_description(kind.to_string(), vec![])
        .with_codec(
            params.payload_type,
            map.name.to_owned(),
            map.clock,
            map.channels,
            map.fmtp.to_owned(),
        )
        .with_property_attribute(direction.attribute().to_owned());

    if kind == MediaKind::Video {
        let pt = params.payload_type;
        media = media
            .with_value_attribute("rtcp-fb".to_owned(), format!("{pt} nack"))
            .with_value_attribute("rtcp-fb".to_owned(), format!("{pt} nack pli"))
            .with_value_attribute("rtcp-fb".to_owned(), format!("{pt} goog-remb"));
    }
    Ok(media)
}
