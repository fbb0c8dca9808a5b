#![warn(rust_2018_idioms)]

pub mod codecs;
pub mod config;
pub mod control;
mod error;
mod feedback;
pub mod frame_index;
pub mod io;
pub mod negotiation;
mod playout;
pub mod recording;
pub mod session;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use util::marshal::Unmarshal;

use codecs::MediaKind;
use control::{ControlMessage, Jsep, Request};
use negotiation::{Direction, MediaParams};
use recording::Registry;
use session::{Role, Session, SessionState, SessionTable};
use transport::{EventSink, PeerTransport};

/// Control messages waiting for the dispatcher.
const CONTROL_QUEUE_DEPTH: usize = 64;

/// MessageResponse is what [`RecordPlay::handle_message`] hands back:
/// either the inline response of a synchronous request (or a validation
/// failure), or an acknowledgement that the request was queued and its
/// outcome will arrive through [`PeerTransport::push_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum MessageResponse {
    Ack,
    Response(Value),
}

/// Context is the process-wide state, packaged into one value constructed
/// at startup and shared by every entry point.
pub(crate) struct Context {
    pub registry: Registry,
    pub sessions: SessionTable,
    pub path: PathBuf,
    pub events: bool,
    pub sink: Mutex<Option<Arc<dyn EventSink>>>,
    pub queue: mpsc::Sender<ControlMessage>,
    pub stopping: AtomicBool,
}

impl Context {
    pub fn emit_event(&self, body: Value) {
        if !self.events {
            return;
        }
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.event(body);
        }
    }
}

/// RecordPlay is the recording-and-replay engine. The signalling host
/// attaches one session per peer, feeds control messages and inbound
/// RTP/RTCP in, and receives events and outbound packets through each
/// session's [`PeerTransport`].
///
/// Construction spawns the dispatcher worker, so it must happen inside a
/// tokio runtime.
pub struct RecordPlay {
    ctx: Arc<Context>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RecordPlay {
    pub fn new(config: Config) -> Result<Self> {
        let path = PathBuf::from(&config.path);
        std::fs::create_dir_all(&path)
            .map_err(|e| Error::ErrInvalidPath(format!("{}: {e}", config.path)))?;

        let (queue, receiver) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let ctx = Arc::new(Context {
            registry: Registry::new(),
            sessions: SessionTable::new(),
            path,
            events: config.events,
            sink: Mutex::new(None),
            queue,
            stopping: AtomicBool::new(false),
        });

        let dispatcher = tokio::spawn(control::run_dispatcher(Arc::clone(&ctx), receiver));
        info!("recordplay engine up, recordings in {}", ctx.path.display());

        Ok(RecordPlay {
            ctx,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// set_event_sink wires the observability sink used when the engine was
    /// configured with `events = true`.
    pub fn set_event_sink(&self, sink: Arc<dyn EventSink>) {
        *self.ctx.sink.lock().unwrap() = Some(sink);
    }

    /// create_session registers a newly attached peer.
    pub fn create_session(&self, id: u64, transport: Arc<dyn PeerTransport>) -> Result<()> {
        if self.ctx.stopping.load(Ordering::SeqCst) {
            return Err(Error::ErrUnknown("engine shutting down"));
        }
        let session = Arc::new(Session::new(id, transport));
        if !self.ctx.sessions.insert(session) {
            return Err(Error::ErrUnknown("session already exists"));
        }
        debug!("session {id} created");
        Ok(())
    }

    /// handle_message validates a control request and either answers it
    /// inline or queues it for the dispatcher.
    pub async fn handle_message(
        &self,
        session_id: u64,
        transaction: &str,
        message: Value,
        jsep: Option<Jsep>,
    ) -> MessageResponse {
        match self
            .try_handle_message(session_id, transaction, message, jsep)
            .await
        {
            Ok(response) => response,
            Err(e) => MessageResponse::Response(control::error_response(&e)),
        }
    }

    async fn try_handle_message(
        &self,
        session_id: u64,
        transaction: &str,
        message: Value,
        jsep: Option<Jsep>,
    ) -> Result<MessageResponse> {
        if self.ctx.stopping.load(Ordering::SeqCst) {
            return Err(Error::ErrUnknown("engine shutting down"));
        }
        let session = self
            .ctx
            .sessions
            .lookup(session_id)
            .ok_or(Error::ErrUnknown("no such session"))?;
        if session.is_destroyed() {
            return Err(Error::ErrUnknown("session destroyed"));
        }

        let request = control::parse_request(&message)?;
        match request {
            Request::List => Ok(MessageResponse::Response(control::list_response(
                self.ctx.registry.list(),
            ))),
            Request::Update => Ok(MessageResponse::Response(control::ok_response())),
            Request::Configure(params) => {
                if let Some(bitrate) = params.video_bitrate_max {
                    session.set_video_bitrate(bitrate);
                }
                if let Some(interval) = params.video_keyframe_interval {
                    session.set_keyframe_interval_ms(interval);
                }
                Ok(MessageResponse::Response(control::configure_response(
                    &session,
                )))
            }
            request => {
                self.ctx
                    .queue
                    .send(ControlMessage::Request {
                        session,
                        transaction: transaction.to_owned(),
                        request,
                        jsep,
                    })
                    .await
                    .map_err(|_| Error::ErrUnknown("control queue closed"))?;
                Ok(MessageResponse::Ack)
            }
        }
    }

    /// setup_media is the host's signal that the peer connection is up.
    /// Players get their playout worker here; recorders get fresh feedback
    /// pacing.
    pub fn setup_media(&self, session_id: u64) {
        let Some(session) = self.ctx.sessions.lookup(session_id) else {
            return;
        };
        if session.is_destroyed() {
            return;
        }
        session.finish_hangup();
        session.set_active(true);
        match session.role() {
            Role::Player => playout::spawn(Arc::clone(&self.ctx), session),
            Role::Recorder => session.reset_feedback(),
            Role::None => {}
        }
    }

    /// incoming_rtp persists one packet from a recording peer. Called on
    /// the transport's threads; never blocks beyond the buffered write.
    pub fn incoming_rtp(&self, session_id: u64, kind: MediaKind, packet: &[u8]) {
        let Some(session) = self.ctx.sessions.lookup(session_id) else {
            return;
        };
        if session.is_destroyed() || !session.is_active() || session.role() != Role::Recorder {
            return;
        }
        let header = match rtp::header::Header::unmarshal(&mut &packet[..]) {
            Ok(header) => header,
            Err(e) => {
                debug!("session {}: dropping malformed rtp packet: {e}", session.id);
                return;
            }
        };
        if kind == MediaKind::Video {
            let base = session.simulcast_ssrc();
            if base != 0 && header.ssrc != base {
                // Demoted simulcast layer.
                return;
            }
        }
        if let Err(e) = session.save_frame(kind, packet) {
            warn!("session {}: saving {kind} frame failed: {e}", session.id);
        }
        if kind == MediaKind::Video {
            feedback::video_frame(&session, header.ssrc);
        }
    }

    /// incoming_rtcp receives feedback from the peer. Nothing in it steers
    /// recording or replay, so it is only traced.
    pub fn incoming_rtcp(&self, session_id: u64, kind: MediaKind, packet: &[u8]) {
        debug!(
            "session {session_id}: {} bytes of {kind} rtcp ignored",
            packet.len()
        );
    }

    /// slow_link reports congestion back as an event carrying the current
    /// target bitrate, with the direction flipped to the peer's view.
    pub async fn slow_link(&self, session_id: u64, uplink: bool, kind: MediaKind) {
        let Some(session) = self.ctx.sessions.lookup(session_id) else {
            return;
        };
        let body = control::event_response(json!({
            "status": "slow_link",
            "media": kind.to_string(),
            "uplink": !uplink,
            "current-bitrate": session.video_bitrate(),
        }));
        session.transport.push_event("", body, None).await;
    }

    /// hangup_media runs the idempotent teardown of the session's media
    /// state.
    pub async fn hangup_media(&self, session_id: u64) {
        let Some(session) = self.ctx.sessions.lookup(session_id) else {
            return;
        };
        hangup_session(&self.ctx, &session).await;
    }

    /// destroy_session detaches a peer for good.
    pub async fn destroy_session(&self, session_id: u64) {
        let Some(session) = self.ctx.sessions.remove(session_id) else {
            return;
        };
        session.mark_destroyed();
        hangup_session(&self.ctx, &session).await;
        debug!("session {session_id} destroyed");
    }

    /// shutdown stops the dispatcher and refuses further work.
    pub async fn shutdown(&self) {
        self.ctx.stopping.store(true, Ordering::SeqCst);
        for session in self.ctx.sessions.all() {
            hangup_session(&self.ctx, &session).await;
        }
        let _ = self.ctx.queue.send(ControlMessage::Shutdown).await;
        let dispatcher = self.dispatcher.lock().unwrap().take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }
        info!("recordplay engine down");
    }
}

/// hangup_session tears down whatever the session was doing. The
/// compare-and-swap on the hangup flag makes concurrent callers collapse
/// into one teardown; the flag is re-armed afterward so the session can
/// negotiate again.
pub(crate) async fn hangup_session(ctx: &Arc<Context>, session: &Arc<Session>) {
    if !session.begin_hangup() {
        return;
    }
    session.set_active(false);

    let role = session.role();
    let recording = session.take_recording();

    match role {
        Role::Recorder => {
            session.close_writers();
            if let Some(rec) = &recording {
                rec.mark_completed();
                let audio = rec.audio.as_ref().map(|t| MediaParams {
                    codec: t.codec.clone(),
                    payload_type: t.payload_type,
                });
                let video = rec.video.as_ref().map(|t| MediaParams {
                    codec: t.codec.clone(),
                    payload_type: t.payload_type,
                });
                match negotiation::generate_sdp(
                    rec.id,
                    1,
                    Direction::SendOnly,
                    audio.as_ref(),
                    video.as_ref(),
                ) {
                    Ok(offer) => rec.set_offer(offer),
                    Err(e) => warn!("cannot build viewer offer for recording {}: {e}", rec.id),
                }
                info!("recording {} completed", rec.id);
                ctx.emit_event(json!({
                    "event": "recording-stopped",
                    "id": rec.id,
                    "session": session.id,
                }));
            }
            session.set_state(if session.is_destroyed() {
                SessionState::Aborted
            } else {
                SessionState::Completed
            });
        }
        Role::Player => {
            session.drop_indices();
            if let Some(rec) = &recording {
                rec.remove_viewer(session.id);
                ctx.emit_event(json!({
                    "event": "playout-stopped",
                    "id": rec.id,
                    "session": session.id,
                }));
            }
            session.set_state(SessionState::Done);
        }
        Role::None => {}
    }
    session.set_simulcast_ssrc(0);
    session.set_pending_offer(None);

    if role != Role::None {
        session
            .transport
            .push_event("", control::event_response(json!({ "status": "done" })), None)
            .await;
    }

    session.set_role(Role::None);
    session.finish_hangup();
}
