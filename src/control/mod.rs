
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::codecs::{self, MediaKind};
use crate::error::{Error, Result};
use crate::frame_index::FrameIndex;
use crate::io::mjr_reader::MjrReader;
use crate::io::mjr_writer::MjrWriter;
use crate::negotiation::{self, Direction, MediaParams};
use crate::recording::{Recording, RecordingSummary, Track};
use crate::session::{PendingOffer, Role, Session, SessionState, TrackWriter};
use crate::Context;

/// Jsep is the JSON signalling envelope around an SDP blob, as the
/// signalling host hands it over and takes it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
    /// Set on ICE restarts; the session keeps its media state and only
    /// refreshes the SDP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulcast: Option<Simulcast>,
}

impl Jsep {
    pub fn offer(sdp: String) -> Self {
        Jsep {
            kind: "offer".to_owned(),
            sdp,
            update: None,
            simulcast: None,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Jsep {
            kind: "answer".to_owned(),
            sdp,
            update: None,
            simulcast: None,
        }
    }

    pub fn is_update(&self) -> bool {
        self.update.unwrap_or(false)
    }
}

/// Simulcast carries the per-layer SSRCs a simulcasting peer announced.
/// Only the base layer survives recording.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Simulcast {
    #[serde(rename = "ssrc-0", default, skip_serializing_if = "Option::is_none")]
    pub ssrc_0: Option<u32>,
    #[serde(rename = "ssrc-1", default, skip_serializing_if = "Option::is_none")]
    pub ssrc_1: Option<u32>,
    #[serde(rename = "ssrc-2", default, skip_serializing_if = "Option::is_none")]
    pub ssrc_2: Option<u32>,
}

/// Request is the validated control surface: one variant per recognized
/// verb, with per-variant payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    List,
    Update,
    Configure(ConfigureParams),
    Record(RecordParams),
    RecordGenerateOffer(GenerateOfferParams),
    RecordProcessAnswer(RecordParams),
    Play(PlayParams),
    Start,
    Stop,
}

impl Request {
    /// is_asynchronous reports whether the request goes through the
    /// dispatcher queue rather than being answered inline.
    pub fn is_asynchronous(&self) -> bool {
        !matches!(
            self,
            Request::List | Request::Update | Request::Configure(_)
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigureParams {
    pub video_bitrate_max: Option<u32>,
    pub video_keyframe_interval: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordParams {
    pub name: String,
    pub id: Option<u64>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerateOfferParams {
    pub audio: bool,
    pub video: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayParams {
    pub id: u64,
}

/// parse_request validates a control message body into a [`Request`].
/// Field-level failures distinguish absent elements from wrong-typed ones.
pub fn parse_request(body: &Value) -> Result<Request> {
    if body.is_null() {
        return Err(Error::ErrNoMessage);
    }
    let body = body.as_object().ok_or(Error::ErrInvalidJson)?;
    let verb = match body.get("request") {
        None => return Err(Error::ErrMissingElement("request")),
        Some(Value::String(verb)) => verb.as_str(),
        Some(_) => return Err(Error::ErrInvalidElement("request")),
    };

    match verb {
        "list" => Ok(Request::List),
        "update" => Ok(Request::Update),
        "configure" => Ok(Request::Configure(ConfigureParams {
            video_bitrate_max: optional_u32(body, "video-bitrate-max")?,
            video_keyframe_interval: optional_u32(body, "video-keyframe-interval")?,
        })),
        "record" => Ok(Request::Record(record_params(body)?)),
        "record-generate-offer" => Ok(Request::RecordGenerateOffer(GenerateOfferParams {
            audio: optional_bool(body, "audio")?.unwrap_or(true),
            video: optional_bool(body, "video")?.unwrap_or(true),
        })),
        "record-process-answer" => Ok(Request::RecordProcessAnswer(record_params(body)?)),
        "play" => Ok(Request::Play(PlayParams {
            id: required_u64(body, "id")?,
        })),
        "start" => Ok(Request::Start),
        "stop" => Ok(Request::Stop),
        other => Err(Error::ErrInvalidRequest(other.to_owned())),
    }
}

fn record_params(body: &Map<String, Value>) -> Result<RecordParams> {
    Ok(RecordParams {
        name: required_str(body, "name")?,
        id: optional_u64(body, "id")?,
        filename: optional_str(body, "filename")?,
    })
}

fn required_str(body: &Map<String, Value>, key: &'static str) -> Result<String> {
    match body.get(key) {
        None => Err(Error::ErrMissingElement(key)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(Error::ErrInvalidElement(key)),
    }
}

fn optional_str(body: &Map<String, Value>, key: &'static str) -> Result<Option<String>> {
    match body.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(Error::ErrInvalidElement(key)),
    }
}

fn required_u64(body: &Map<String, Value>, key: &'static str) -> Result<u64> {
    match body.get(key) {
        None => Err(Error::ErrMissingElement(key)),
        Some(value) => value.as_u64().ok_or(Error::ErrInvalidElement(key)),
    }
}

fn optional_u64(body: &Map<String, Value>, key: &'static str) -> Result<Option<u64>> {
    match body.get(key) {
        None => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or(Error::ErrInvalidElement(key)),
    }
}

fn optional_u32(body: &Map<String, Value>, key: &'static str) -> Result<Option<u32>> {
    Ok(optional_u64(body, key)?.map(|v| v.min(u64::from(u32::MAX)) as u32))
}

fn optional_bool(body: &Map<String, Value>, key: &'static str) -> Result<Option<bool>> {
    match body.get(key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(Error::ErrInvalidElement(key)),
    }
}

/// ControlMessage is one unit of work for the dispatcher.
pub(crate) enum ControlMessage {
    Request {
        session: Arc<Session>,
        transaction: String,
        request: Request,
        jsep: Option<Jsep>,
    },
    Shutdown,
}

pub(crate) fn ok_response() -> Value {
    json!({ "recordplay": "ok" })
}

pub(crate) fn list_response(list: Vec<RecordingSummary>) -> Value {
    json!({ "recordplay": "list", "list": list })
}

pub(crate) fn configure_response(session: &Session) -> Value {
    json!({
        "recordplay": "configure",
        "settings": {
            "video-bitrate-max": session.video_bitrate(),
            "video-keyframe-interval": session.keyframe_interval_ms(),
        },
    })
}

pub(crate) fn event_response(result: Value) -> Value {
    json!({ "recordplay": "event", "result": result })
}

pub(crate) fn error_response(e: &Error) -> Value {
    json!({ "recordplay": "event", "error_code": e.code(), "error": e.to_string() })
}

/// run_dispatcher drains the control queue until the shutdown sentinel,
/// serializing every asynchronous request.
pub(crate) async fn run_dispatcher(ctx: Arc<Context>, mut queue: mpsc::Receiver<ControlMessage>) {
    debug!("control dispatcher running");
    while let Some(message) = queue.recv().await {
        match message {
            ControlMessage::Shutdown => break,
            ControlMessage::Request {
                session,
                transaction,
                request,
                jsep,
            } => {
                let stop = matches!(request, Request::Stop);
                let outcome = handle_async_request(&ctx, &session, request, jsep).await;
                match outcome {
                    Ok((result, reply_jsep)) => {
                        session
                            .transport
                            .push_event(&transaction, event_response(result), reply_jsep)
                            .await;
                        if stop {
                            session.transport.close_peer().await;
                        }
                    }
                    Err(e) => {
                        warn!("request failed for session {}: {e}", session.id);
                        session
                            .transport
                            .push_event(&transaction, error_response(&e), None)
                            .await;
                    }
                }
            }
        }
    }
    debug!("control dispatcher leaving");
}

async fn handle_async_request(
    ctx: &Arc<Context>,
    session: &Arc<Session>,
    request: Request,
    jsep: Option<Jsep>,
) -> Result<(Value, Option<Jsep>)> {
    if session.is_destroyed() {
        return Err(Error::ErrUnknown("session destroyed"));
    }
    match request {
        Request::Record(params) => record(ctx, session, params, jsep, false),
        Request::RecordProcessAnswer(params) => record(ctx, session, params, jsep, true),
        Request::RecordGenerateOffer(params) => record_generate_offer(session, params),
        Request::Play(params) => play(ctx, session, params, jsep),
        Request::Start => start(session, jsep),
        Request::Stop => stop(ctx, session).await,
        Request::List | Request::Update | Request::Configure(_) => {
            Err(Error::ErrUnknown("synchronous request on the async path"))
        }
    }
}

/// record starts a recording from a peer offer (`record`) or from the
/// peer's answer to a previously generated offer (`record-process-answer`).
fn record(
    ctx: &Arc<Context>,
    session: &Arc<Session>,
    params: RecordParams,
    jsep: Option<Jsep>,
    from_answer: bool,
) -> Result<(Value, Option<Jsep>)> {
    let jsep = jsep.ok_or(Error::ErrMissingElement("jsep"))?;

    // An ICE restart refreshes the SDP pair and reuses the writers.
    if jsep.is_update() && session.role() == Role::Recorder {
        return refresh_recorder_sdp(session, from_answer);
    }

    if session.state().in_progress() {
        return Err(Error::ErrInvalidState("session already busy"));
    }
    let expected_kind = if from_answer { "answer" } else { "offer" };
    if jsep.kind != expected_kind {
        return Err(Error::ErrInvalidSdp);
    }
    let pending = session.pending_offer();
    if from_answer && pending.is_none() {
        return Err(Error::ErrInvalidState("no generated offer to answer"));
    }

    let id = match params.id {
        Some(id) if id != 0 => {
            if ctx.registry.contains(id) {
                return Err(Error::ErrRecordingExists);
            }
            id
        }
        _ => ctx.registry.allocate_id(),
    };

    let mut tracks = negotiation::parse_tracks(&jsep.sdp)?;
    if let Some(pending) = pending {
        // Only the tracks the generated offer advertised may be answered.
        if !pending.audio {
            tracks.audio = None;
        }
        if !pending.video {
            tracks.video = None;
        }
    }
    if let Some(simulcast) = &jsep.simulcast {
        if let Some(ssrc) = simulcast.ssrc_0 {
            info!("session {} simulcasting, keeping base ssrc {ssrc:x}", session.id);
            session.set_simulcast_ssrc(ssrc);
        }
    }

    let date = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let stem = params
        .filename
        .clone()
        .unwrap_or_else(|| format!("rec-{id}"));

    // An offer with no usable track still yields an (empty) recording.
    let mut audio_writer = None;
    let audio_track = match &tracks.audio {
        Some(offered) => {
            let file = format!("{stem}-audio");
            audio_writer = Some(open_writer(ctx, &file, MediaKind::Audio, &offered.codec)?);
            Some(Track {
                codec: offered.codec.clone(),
                file,
                payload_type: codecs::audio_payload_type(&offered.codec),
            })
        }
        None => None,
    };
    let mut video_writer = None;
    let video_track = match &tracks.video {
        Some(offered) => {
            let file = format!("{stem}-video");
            match open_writer(ctx, &file, MediaKind::Video, &offered.codec) {
                Ok(writer) => video_writer = Some(writer),
                Err(e) => {
                    drop(audio_writer);
                    remove_track_file(ctx, audio_track.as_ref());
                    return Err(e);
                }
            }
            Some(Track {
                codec: offered.codec.clone(),
                file,
                payload_type: codecs::VIDEO_PAYLOAD_TYPE,
            })
        }
        None => None,
    };

    let recording = Arc::new(Recording::new(
        id,
        params.name.clone(),
        date,
        audio_track,
        video_track,
    ));
    if let Err(e) = ctx.registry.insert(recording.clone()) {
        drop(audio_writer);
        drop(video_writer);
        remove_track_file(ctx, recording.audio.as_ref());
        remove_track_file(ctx, recording.video.as_ref());
        return Err(e);
    }

    session.set_role(Role::Recorder);
    session.set_state(SessionState::Recording);
    session.set_recording(recording.clone());
    session.set_writers(audio_writer, video_writer);
    session.set_pending_offer(None);

    info!(
        "recording {id} ('{}') started: audio={} video={}",
        params.name,
        recording.audio.is_some(),
        recording.video.is_some()
    );
    ctx.emit_event(json!({
        "event": "recording-started",
        "id": id,
        "name": params.name,
        "session": session.id,
    }));

    let reply_jsep = if from_answer {
        None
    } else {
        let audio = tracks.audio.as_ref().map(|t| MediaParams {
            codec: t.codec.clone(),
            payload_type: t.payload_type,
        });
        let video = tracks.video.as_ref().map(|t| MediaParams {
            codec: t.codec.clone(),
            payload_type: t.payload_type,
        });
        let answer = negotiation::generate_sdp(
            session.sdp_session_id(),
            session.sdp_version(),
            Direction::RecvOnly,
            audio.as_ref(),
            video.as_ref(),
        )?;
        Some(Jsep::answer(answer))
    };

    Ok((json!({ "status": "recording", "id": id }), reply_jsep))
}

fn open_writer(
    ctx: &Context,
    file: &str,
    kind: MediaKind,
    codec: &str,
) -> Result<TrackWriter> {
    MjrWriter::create(ctx.path.join(format!("{file}.mjr")), kind, codec)
}

fn remove_track_file(ctx: &Context, track: Option<&Track>) {
    if let Some(track) = track {
        let _ = std::fs::remove_file(ctx.path.join(format!("{}.mjr", track.file)));
    }
}

/// refresh_recorder_sdp serves an ICE-restart on a live recorder: bump the
/// SDP version, regenerate the local description, keep the writers.
fn refresh_recorder_sdp(
    session: &Arc<Session>,
    from_answer: bool,
) -> Result<(Value, Option<Jsep>)> {
    let recording = session
        .recording()
        .ok_or(Error::ErrUnknown("recorder without a recording"))?;

    let version = session.next_sdp_version();
    let audio = recording.audio.as_ref().map(|t| MediaParams {
        codec: t.codec.clone(),
        payload_type: t.payload_type,
    });
    let video = recording.video.as_ref().map(|t| MediaParams {
        codec: t.codec.clone(),
        payload_type: t.payload_type,
    });
    let sdp = negotiation::generate_sdp(
        session.sdp_session_id(),
        version,
        Direction::RecvOnly,
        audio.as_ref(),
        video.as_ref(),
    )?;

    let jsep = if from_answer {
        Jsep::offer(sdp)
    } else {
        Jsep::answer(sdp)
    };
    Ok((
        json!({ "status": "recording", "id": recording.id }),
        Some(jsep),
    ))
}

/// record_generate_offer authors a recvonly offer for a peer that wants the
/// plugin to go first; `record-process-answer` completes it.
fn record_generate_offer(
    session: &Arc<Session>,
    params: GenerateOfferParams,
) -> Result<(Value, Option<Jsep>)> {
    if session.state().in_progress() {
        return Err(Error::ErrInvalidState("session already busy"));
    }

    let audio = params.audio.then(|| MediaParams {
        codec: codecs::AUDIO_PREFERRED[0].to_owned(),
        payload_type: codecs::audio_payload_type(codecs::AUDIO_PREFERRED[0]),
    });
    let video = params.video.then(|| MediaParams {
        codec: codecs::VIDEO_PREFERRED[0].to_owned(),
        payload_type: codecs::VIDEO_PAYLOAD_TYPE,
    });

    let offer = negotiation::generate_sdp(
        session.sdp_session_id(),
        session.next_sdp_version(),
        Direction::RecvOnly,
        audio.as_ref(),
        video.as_ref(),
    )?;
    session.set_pending_offer(Some(PendingOffer {
        audio: params.audio,
        video: params.video,
    }));

    Ok((json!({ "status": "preparing" }), Some(Jsep::offer(offer))))
}

/// play prepares a replay: index the recording's tracks and hand the viewer
/// the cached offer.
fn play(
    ctx: &Arc<Context>,
    session: &Arc<Session>,
    params: PlayParams,
    jsep: Option<Jsep>,
) -> Result<(Value, Option<Jsep>)> {
    if jsep.is_some() {
        return Err(Error::ErrInvalidElement("jsep"));
    }
    if session.state().in_progress() {
        return Err(Error::ErrInvalidState("session already busy"));
    }

    let recording = ctx.registry.lookup(params.id)?;
    if recording.is_destroyed() {
        return Err(Error::ErrNotFound);
    }
    let offer = recording.offer().ok_or(Error::ErrNotFound)?;

    let audio_index = recording
        .audio
        .as_ref()
        .and_then(|track| build_index(ctx, track, MediaKind::Audio));
    let video_index = recording
        .video
        .as_ref()
        .and_then(|track| build_index(ctx, track, MediaKind::Video));
    if audio_index.is_none() && video_index.is_none() {
        return Err(Error::ErrInvalidRecording);
    }

    session.set_role(Role::Player);
    session.set_state(SessionState::Preparing);
    session.set_recording(recording.clone());
    session.set_indices(audio_index, video_index);
    recording.add_viewer(session);

    ctx.emit_event(json!({
        "event": "playout-preparing",
        "id": recording.id,
        "session": session.id,
    }));

    Ok((
        json!({ "status": "preparing", "id": recording.id }),
        Some(Jsep::offer(offer)),
    ))
}

fn build_index(ctx: &Context, track: &Track, kind: MediaKind) -> Option<FrameIndex> {
    let path = ctx.path.join(format!("{}.mjr", track.file));
    let mut reader = match MjrReader::open(&path) {
        Ok(reader) => reader,
        Err(e) => {
            warn!("cannot open {} track {}: {e}", kind, path.display());
            return None;
        }
    };
    if reader.header().kind != kind {
        warn!("{} track {} holds {} media", kind, path.display(), reader.header().kind);
        return None;
    }
    match FrameIndex::build(&mut reader) {
        Ok(index) if index.is_empty() => {
            warn!("{} track {} holds no frames", kind, path.display());
            None
        }
        Ok(index) => Some(index),
        Err(e) => {
            warn!("cannot index {} track {}: {e}", kind, path.display());
            None
        }
    }
}

/// start commits a replay once the viewer's answer arrives; the playout
/// worker begins sending when media comes up.
fn start(session: &Arc<Session>, jsep: Option<Jsep>) -> Result<(Value, Option<Jsep>)> {
    if !session.has_index() {
        return Err(Error::ErrInvalidState("no indexed track loaded"));
    }
    let jsep = jsep.ok_or(Error::ErrMissingElement("jsep"))?;
    if jsep.kind != "answer" {
        return Err(Error::ErrInvalidSdp);
    }
    negotiation::parse_tracks(&jsep.sdp)?;

    session.set_state(SessionState::Playing);
    Ok((json!({ "status": "playing" }), None))
}

/// stop tears the current session down; the peer connection is closed once
/// the stopped event is out.
async fn stop(ctx: &Arc<Context>, session: &Arc<Session>) -> Result<(Value, Option<Jsep>)> {
    let recording_id = session.recording().map(|r| r.id);
    crate::hangup_session(ctx, session).await;

    let mut result = json!({ "status": "stopped" });
    if let Some(id) = recording_id {
        result["id"] = json!(id);
    }
    Ok((result, None))
}
