use super::*;

const OFFER_OPUS_VP8: &str = "v=0\r\n\
o=- 20518 0 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=sendrecv\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 98\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:98 VP9/90000\r\n\
a=sendonly\r\n";

#[test]
fn test_parse_tracks_prefers_table_order() -> crate::error::Result<()> {
    let tracks = parse_tracks(OFFER_OPUS_VP8)?;

    assert_eq!(
        tracks.audio,
        Some(OfferedTrack {
            codec: "opus".to_owned(),
            payload_type: 111,
        })
    );
    assert_eq!(
        tracks.video,
        Some(OfferedTrack {
            codec: "vp8".to_owned(),
            payload_type: 96,
        })
    );
    Ok(())
}

#[test]
fn test_parse_tracks_recvonly_line_is_absent() -> crate::error::Result<()> {
    let offer = "v=0\r\n\
o=- 20518 0 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=recvonly\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=sendrecv\r\n";

    let tracks = parse_tracks(offer)?;
    assert!(tracks.audio.is_none(), "peer will not send audio");
    assert!(tracks.video.is_some());
    Ok(())
}

#[test]
fn test_parse_tracks_static_payload_types() -> crate::error::Result<()> {
    // PCMU offered through the static payload type, no rtpmap at all.
    let offer = "v=0\r\n\
o=- 20518 0 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 0\r\n\
c=IN IP4 0.0.0.0\r\n\
a=sendrecv\r\n";

    let tracks = parse_tracks(offer)?;
    assert_eq!(
        tracks.audio,
        Some(OfferedTrack {
            codec: "pcmu".to_owned(),
            payload_type: 0,
        })
    );
    Ok(())
}

#[test]
fn test_parse_tracks_no_supported_codec() -> crate::error::Result<()> {
    let offer = "v=0\r\n\
o=- 20518 0 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 97\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:97 iLBC/8000\r\n\
a=sendrecv\r\n";

    let tracks = parse_tracks(offer)?;
    assert!(tracks.is_empty());
    Ok(())
}

#[test]
fn test_parse_tracks_rejects_garbage() {
    assert_eq!(parse_tracks("this is not sdp"), Err(Error::ErrInvalidSdp));
}

#[test]
fn test_generate_sdp_sendonly_offer() -> crate::error::Result<()> {
    let audio = MediaParams {
        codec: "opus".to_owned(),
        payload_type: 111,
    };
    let video = MediaParams {
        codec: "vp8".to_owned(),
        payload_type: 100,
    };

    let offer = generate_sdp(1234, 1, Direction::SendOnly, Some(&audio), Some(&video))?;

    assert!(offer.contains("o=- 1234 1 IN IP4 0.0.0.0"));
    assert!(offer.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111"));
    assert!(offer.contains("a=rtpmap:111 opus/48000/2"));
    assert!(offer.contains("m=video 9 UDP/TLS/RTP/SAVPF 100"));
    assert!(offer.contains("a=rtpmap:100 VP8/90000"));
    assert!(offer.contains("a=rtcp-fb:100 nack pli"));
    assert_eq!(offer.matches("a=sendonly").count(), 2);
    assert!(!offer.contains("m=application"), "no data channels");

    // What we generate must parse back; sendonly lines count as absent for
    // a recorder but are exactly what a viewer consumes.
    parse_tracks(&offer)?;
    Ok(())
}

#[test]
fn test_generate_sdp_recvonly_answer() -> crate::error::Result<()> {
    let audio = MediaParams {
        codec: "pcmu".to_owned(),
        payload_type: 0,
    };

    let answer = generate_sdp(99, 2, Direction::RecvOnly, Some(&audio), None)?;

    assert!(answer.contains("m=audio 9 UDP/TLS/RTP/SAVPF 0"));
    assert!(answer.contains("a=rtpmap:0 PCMU/8000"));
    assert!(answer.contains("a=recvonly"));
    assert!(!answer.contains("m=video"));
    Ok(())
}

#[test]
fn test_generate_sdp_round_trips_through_parse() -> crate::error::Result<()> {
    let video = MediaParams {
        codec: "vp8".to_owned(),
        payload_type: 100,
    };
    // A recvonly recording offer, as seen by the peer that answers it.
    let offer = generate_sdp(7, 1, Direction::RecvOnly, None, Some(&video))?;
    let tracks = parse_tracks(&offer)?;

    // From our own perspective the recvonly line carries no inbound media;
    // the peer's answer will flip it to sendonly.
    assert!(tracks.video.is_none());
    assert!(offer.contains("a=recvonly"));
    Ok(())
}
