use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use mjr_recordplay::codecs::MediaKind;
use mjr_recordplay::control::{Jsep, Simulcast};
use mjr_recordplay::io::mjr_reader::MjrReader;
use mjr_recordplay::transport::PeerTransport;
use mjr_recordplay::{Config, MessageResponse, RecordPlay};

const OFFER: &str = "v=0\r\n\
o=- 20518 0 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=sendrecv\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=sendonly\r\n";

const VIEWER_ANSWER: &str = "v=0\r\n\
o=- 883 1 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=recvonly\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 100\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:100 VP8/90000\r\n\
a=recvonly\r\n";

struct MockTransport {
    events: mpsc::UnboundedSender<(Value, Option<Jsep>)>,
    rtp: Mutex<Vec<(MediaKind, Vec<u8>)>>,
    closed: AtomicBool,
}

impl MockTransport {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(Value, Option<Jsep>)>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(MockTransport {
                events,
                rtp: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
            receiver,
        )
    }

    fn rtp(&self) -> Vec<(MediaKind, Vec<u8>)> {
        self.rtp.lock().unwrap().clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PeerTransport for MockTransport {
    fn send_rtp(&self, kind: MediaKind, packet: &[u8]) {
        self.rtp.lock().unwrap().push((kind, packet.to_vec()));
    }

    fn send_rtcp(&self, _kind: MediaKind, _packet: &[u8]) {}

    async fn push_event(&self, _transaction: &str, body: Value, jsep: Option<Jsep>) {
        let _ = self.events.send((body, jsep));
    }

    async fn close_peer(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

async fn next_event(
    events: &mut mpsc::UnboundedReceiver<(Value, Option<Jsep>)>,
) -> (Value, Option<Jsep>) {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

fn rtp_packet(pt: u8, seq: u16, ts: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0u8; 12];
    pkt[0] = 0x80;
    pkt[1] = pt;
    BigEndian::write_u16(&mut pkt[2..4], seq);
    BigEndian::write_u32(&mut pkt[4..8], ts);
    BigEndian::write_u32(&mut pkt[8..12], ssrc);
    pkt.extend_from_slice(payload);
    pkt
}

fn engine(dir: &tempfile::TempDir) -> RecordPlay {
    RecordPlay::new(Config::new(dir.path().to_string_lossy())).unwrap()
}

/// Runs a full recording on session 1 and returns the recording id.
async fn record_demo(
    engine: &RecordPlay,
    transport: &Arc<MockTransport>,
    events: &mut mpsc::UnboundedReceiver<(Value, Option<Jsep>)>,
) -> u64 {
    let response = engine
        .handle_message(
            1,
            "t-record",
            json!({ "request": "record", "name": "demo" }),
            Some(Jsep::offer(OFFER.to_owned())),
        )
        .await;
    assert_eq!(response, MessageResponse::Ack);

    let (body, jsep) = next_event(events).await;
    assert_eq!(body["recordplay"], "event");
    assert_eq!(body["result"]["status"], "recording");
    let id = body["result"]["id"].as_u64().expect("recording id");
    assert_ne!(id, 0);

    let answer = jsep.expect("record reply carries the answer");
    assert_eq!(answer.kind, "answer");
    assert!(answer.sdp.contains("a=recvonly"));

    engine.setup_media(1);
    for seq in 0..3u16 {
        engine.incoming_rtp(
            1,
            MediaKind::Audio,
            &rtp_packet(111, seq, u32::from(seq) * 960, 0xA1, b"audio"),
        );
    }
    for seq in 0..3u16 {
        engine.incoming_rtp(
            1,
            MediaKind::Video,
            &rtp_packet(96, seq, 9000, 0xB1, b"video"),
        );
    }

    let response = engine
        .handle_message(1, "t-stop", json!({ "request": "stop" }), None)
        .await;
    assert_eq!(response, MessageResponse::Ack);

    let (done, _) = next_event(events).await;
    assert_eq!(done["result"]["status"], "done");
    let (stopped, _) = next_event(events).await;
    assert_eq!(stopped["result"]["status"], "stopped");
    assert_eq!(stopped["result"]["id"].as_u64(), Some(id));
    wait_for(|| transport.is_closed()).await;

    id
}

#[tokio::test]
async fn test_record_stop_then_list() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let (transport, mut events) = MockTransport::new();
    engine.create_session(1, transport.clone()).unwrap();

    let id = record_demo(&engine, &transport, &mut events).await;

    let response = engine
        .handle_message(1, "t-list", json!({ "request": "list" }), None)
        .await;
    let MessageResponse::Response(body) = response else {
        panic!("list is synchronous");
    };
    assert_eq!(body["recordplay"], "list");
    let list = body["list"].as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"].as_u64(), Some(id));
    assert_eq!(list[0]["name"], "demo");
    assert_eq!(list[0]["audio"], true);
    assert_eq!(list[0]["video"], true);
    assert_eq!(list[0]["audio_codec"], "opus");
    assert_eq!(list[0]["video_codec"], "vp8");

    assert!(dir.path().join(format!("rec-{id}-audio.mjr")).exists());
    assert!(dir.path().join(format!("rec-{id}-video.mjr")).exists());
}

#[tokio::test]
async fn test_duplicate_recording_id() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let (_, mut events_one) = {
        let (transport, events) = MockTransport::new();
        engine.create_session(1, transport.clone()).unwrap();
        (transport, events)
    };
    let (_, mut events_two) = {
        let (transport, events) = MockTransport::new();
        engine.create_session(2, transport.clone()).unwrap();
        (transport, events)
    };

    let request = json!({ "request": "record", "name": "first", "id": 42 });
    engine
        .handle_message(1, "t1", request.clone(), Some(Jsep::offer(OFFER.to_owned())))
        .await;
    let (body, _) = next_event(&mut events_one).await;
    assert_eq!(body["result"]["id"].as_u64(), Some(42));

    engine
        .handle_message(2, "t2", request, Some(Jsep::offer(OFFER.to_owned())))
        .await;
    let (body, _) = next_event(&mut events_two).await;
    assert_eq!(body["error_code"].as_u64(), Some(420));
}

#[tokio::test]
async fn test_replay_flow() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let (recorder, mut recorder_events) = MockTransport::new();
    engine.create_session(1, recorder.clone()).unwrap();
    let id = record_demo(&engine, &recorder, &mut recorder_events).await;

    let (viewer, mut viewer_events) = MockTransport::new();
    engine.create_session(2, viewer.clone()).unwrap();

    let response = engine
        .handle_message(2, "t-play", json!({ "request": "play", "id": id }), None)
        .await;
    assert_eq!(response, MessageResponse::Ack);

    let (body, jsep) = next_event(&mut viewer_events).await;
    assert_eq!(body["result"]["status"], "preparing");
    assert_eq!(body["result"]["id"].as_u64(), Some(id));
    let offer = jsep.expect("play replies with the cached offer");
    assert_eq!(offer.kind, "offer");
    assert_eq!(offer.sdp.matches("a=sendonly").count(), 2);
    assert!(offer.sdp.contains("m=audio"));
    assert!(offer.sdp.contains("m=video"));

    let response = engine
        .handle_message(
            2,
            "t-start",
            json!({ "request": "start" }),
            Some(Jsep::answer(VIEWER_ANSWER.to_owned())),
        )
        .await;
    assert_eq!(response, MessageResponse::Ack);
    let (body, _) = next_event(&mut viewer_events).await;
    assert_eq!(body["result"]["status"], "playing");

    engine.setup_media(2);

    // The playout worker folds the connection once both tracks exhaust.
    wait_for(|| viewer.is_closed()).await;
    let rtp = viewer.rtp();
    assert_eq!(rtp.len(), 6);
    for (kind, packet) in &rtp {
        match kind {
            MediaKind::Audio => assert_eq!(packet[1] & 0x7f, 111),
            MediaKind::Video => assert_eq!(packet[1] & 0x7f, 100),
        }
    }

    // The host folds the peer connection and reports the hangup.
    engine.hangup_media(2).await;
    let (done, _) = next_event(&mut viewer_events).await;
    assert_eq!(done["result"]["status"], "done");
}

#[tokio::test]
async fn test_simulcast_demotion() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let (transport, mut events) = MockTransport::new();
    engine.create_session(1, transport.clone()).unwrap();

    let jsep = Jsep {
        kind: "offer".to_owned(),
        sdp: OFFER.to_owned(),
        update: None,
        simulcast: Some(Simulcast {
            ssrc_0: Some(0xAA),
            ssrc_1: Some(0xAB),
            ssrc_2: None,
        }),
    };
    engine
        .handle_message(1, "t1", json!({ "request": "record", "name": "sim" }), Some(jsep))
        .await;
    let (body, _) = next_event(&mut events).await;
    let id = body["result"]["id"].as_u64().unwrap();

    engine.setup_media(1);
    engine.incoming_rtp(1, MediaKind::Video, &rtp_packet(96, 1, 9000, 0xAA, b"base"));
    engine.incoming_rtp(1, MediaKind::Video, &rtp_packet(96, 2, 9000, 0xAB, b"high"));
    engine.incoming_rtp(1, MediaKind::Video, &rtp_packet(96, 3, 9000, 0xAA, b"base"));
    // Audio is not simulcast and passes regardless of SSRC.
    engine.incoming_rtp(1, MediaKind::Audio, &rtp_packet(111, 1, 960, 0xCC, b"talk"));

    engine.handle_message(1, "t2", json!({ "request": "stop" }), None).await;
    let _ = next_event(&mut events).await;
    let _ = next_event(&mut events).await;

    let mut reader = MjrReader::open(dir.path().join(format!("rec-{id}-video.mjr"))).unwrap();
    let mut ssrcs = Vec::new();
    while let Some(loc) = reader.next_frame().unwrap() {
        let payload = reader.read_payload(&loc).unwrap();
        ssrcs.push(BigEndian::read_u32(&payload[8..12]));
    }
    assert_eq!(ssrcs, vec![0xAA, 0xAA], "only the base layer persists");

    let mut reader = MjrReader::open(dir.path().join(format!("rec-{id}-audio.mjr"))).unwrap();
    assert!(reader.next_frame().unwrap().is_some());
}

#[tokio::test]
async fn test_play_errors() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let (_transport, mut events) = {
        let (transport, events) = MockTransport::new();
        engine.create_session(1, transport.clone()).unwrap();
        (transport, events)
    };

    engine
        .handle_message(1, "t1", json!({ "request": "play", "id": 12_345 }), None)
        .await;
    let (body, _) = next_event(&mut events).await;
    assert_eq!(body["error_code"].as_u64(), Some(416));

    engine
        .handle_message(
            1,
            "t2",
            json!({ "request": "start" }),
            Some(Jsep::answer(VIEWER_ANSWER.to_owned())),
        )
        .await;
    let (body, _) = next_event(&mut events).await;
    assert_eq!(body["error_code"].as_u64(), Some(418));
}

#[tokio::test]
async fn test_unknown_session_and_bad_requests() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);

    let response = engine
        .handle_message(99, "t1", json!({ "request": "list" }), None)
        .await;
    let MessageResponse::Response(body) = response else {
        panic!("errors come back inline");
    };
    assert_eq!(body["error_code"].as_u64(), Some(499));

    let (transport, _events) = MockTransport::new();
    engine.create_session(1, transport).unwrap();

    let response = engine
        .handle_message(1, "t2", json!({ "nothing": true }), None)
        .await;
    let MessageResponse::Response(body) = response else {
        panic!();
    };
    assert_eq!(body["error_code"].as_u64(), Some(415));
}

#[tokio::test]
async fn test_update_and_configure() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let (transport, _events) = MockTransport::new();
    engine.create_session(1, transport).unwrap();

    let response = engine
        .handle_message(1, "t1", json!({ "request": "update" }), None)
        .await;
    assert_eq!(
        response,
        MessageResponse::Response(json!({ "recordplay": "ok" }))
    );

    let response = engine
        .handle_message(
            1,
            "t2",
            json!({
                "request": "configure",
                "video-bitrate-max": 256_000,
                "video-keyframe-interval": 2_000,
            }),
            None,
        )
        .await;
    let MessageResponse::Response(body) = response else {
        panic!("configure is synchronous");
    };
    assert_eq!(body["recordplay"], "configure");
    assert_eq!(body["settings"]["video-bitrate-max"].as_u64(), Some(256_000));
    assert_eq!(
        body["settings"]["video-keyframe-interval"].as_u64(),
        Some(2_000)
    );
}

#[tokio::test]
async fn test_record_generate_offer_and_process_answer() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let (transport, mut events) = MockTransport::new();
    engine.create_session(1, transport.clone()).unwrap();

    engine
        .handle_message(1, "t1", json!({ "request": "record-generate-offer" }), None)
        .await;
    let (body, jsep) = next_event(&mut events).await;
    assert_eq!(body["result"]["status"], "preparing");
    let offer = jsep.expect("generated offer");
    assert_eq!(offer.kind, "offer");
    assert_eq!(offer.sdp.matches("a=recvonly").count(), 2);

    // The peer answers with both tracks active on its side.
    let answer = "v=0\r\n\
o=- 31 7 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=sendonly\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 100\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:100 VP8/90000\r\n\
a=sendonly\r\n";
    engine
        .handle_message(
            1,
            "t2",
            json!({ "request": "record-process-answer", "name": "offered" }),
            Some(Jsep::answer(answer.to_owned())),
        )
        .await;
    let (body, jsep) = next_event(&mut events).await;
    assert_eq!(body["result"]["status"], "recording");
    assert!(jsep.is_none(), "the offer was already delivered");
    let id = body["result"]["id"].as_u64().unwrap();
    assert!(dir.path().join(format!("rec-{id}-audio.mjr")).exists());
    assert!(dir.path().join(format!("rec-{id}-video.mjr")).exists());
}
