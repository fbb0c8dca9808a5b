
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::warn;

use crate::codecs::MediaKind;
use crate::error::Result;
use crate::frame_index::FrameIndex;
use crate::io::mjr_writer::MjrWriter;
use crate::recording::Recording;
use crate::transport::PeerTransport;

/// Outbound video bitrate target until a `configure` changes it.
pub const DEFAULT_VIDEO_BITRATE: u32 = 1024 * 1024;

/// Keyframe request cadence until a `configure` changes it.
pub const DEFAULT_KEYFRAME_INTERVAL_MS: u32 = 15_000;

/// REMB packets sent at a reduced bitrate while a recording peer ramps up.
pub const REMB_RAMPUP_STEPS: u32 = 4;

/// Role a session takes on its first matching control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    None,
    Recorder,
    Player,
}

/// SessionState tracks the per-peer lifecycle: `Idle → Recording →
/// Completed | Aborted` for recorders, `Idle → Preparing → Playing → Done`
/// for players.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Recording,
    Completed,
    Aborted,
    Preparing,
    Playing,
    Done,
}

impl SessionState {
    /// in_progress reports whether the session is mid-lifecycle and cannot
    /// start a new recording or replay.
    pub fn in_progress(&self) -> bool {
        matches!(
            self,
            SessionState::Recording | SessionState::Preparing | SessionState::Playing
        )
    }
}

pub(crate) type TrackWriter = MjrWriter<BufWriter<File>>;

#[derive(Default)]
struct TrackWriters {
    audio: Option<TrackWriter>,
    video: Option<TrackWriter>,
}

/// PendingOffer remembers which tracks a plugin-authored recording offer
/// advertised, between `record-generate-offer` and `record-process-answer`.
#[derive(Debug, Clone, Copy)]
pub struct PendingOffer {
    pub audio: bool,
    pub video: bool,
}

/// Session is the per-peer state, created on attach and destroyed on
/// detach. All of its mutable state is shard-locked so the transport's RTP
/// threads, the dispatcher and the playout worker can touch disjoint parts
/// without contending.
pub struct Session {
    pub id: u64,
    pub transport: Arc<dyn PeerTransport>,

    role: Mutex<Role>,
    state: Mutex<SessionState>,
    active: AtomicBool,
    hangingup: AtomicBool,
    destroyed: AtomicBool,

    recording: Mutex<Option<Arc<Recording>>>,

    // Recorder side. The writers mutex is the record-mutex serializing RTP
    // writes against hangup.
    writers: Mutex<TrackWriters>,
    simulcast_ssrc: AtomicU32,
    pending_offer: Mutex<Option<PendingOffer>>,

    // Player side. The indices are handed to the playout worker wholesale.
    audio_index: Mutex<Option<FrameIndex>>,
    video_index: Mutex<Option<FrameIndex>>,

    sdp_session_id: u64,
    sdp_version: AtomicU64,

    video_bitrate: AtomicU32,
    keyframe_interval: AtomicU32,
    remb_startup: AtomicU32,
    remb_last: Mutex<Instant>,
    pli_last: Mutex<Instant>,
}

impl Session {
    pub fn new(id: u64, transport: Arc<dyn PeerTransport>) -> Self {
        Session {
            id,
            transport,
            role: Mutex::new(Role::None),
            state: Mutex::new(SessionState::Idle),
            active: AtomicBool::new(false),
            hangingup: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            recording: Mutex::new(None),
            writers: Mutex::new(TrackWriters::default()),
            simulcast_ssrc: AtomicU32::new(0),
            pending_offer: Mutex::new(None),
            audio_index: Mutex::new(None),
            video_index: Mutex::new(None),
            sdp_session_id: u64::from(rand::random::<u32>()) + 1,
            sdp_version: AtomicU64::new(1),
            video_bitrate: AtomicU32::new(DEFAULT_VIDEO_BITRATE),
            keyframe_interval: AtomicU32::new(DEFAULT_KEYFRAME_INTERVAL_MS),
            remb_startup: AtomicU32::new(REMB_RAMPUP_STEPS),
            remb_last: Mutex::new(Instant::now()),
            pli_last: Mutex::new(Instant::now()),
        }
    }

    pub fn role(&self) -> Role {
        *self.role.lock().unwrap()
    }

    pub fn set_role(&self, role: Role) {
        *self.role.lock().unwrap() = role;
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    /// begin_hangup wins the race to tear the session down. Exactly one
    /// caller sees `true` per hangup cycle.
    pub fn begin_hangup(&self) -> bool {
        self.hangingup
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// finish_hangup re-arms the session so a later negotiation can reuse
    /// it.
    pub fn finish_hangup(&self) {
        self.hangingup.store(false, Ordering::SeqCst);
    }

    pub fn is_hanging_up(&self) -> bool {
        self.hangingup.load(Ordering::SeqCst)
    }

    pub fn recording(&self) -> Option<Arc<Recording>> {
        self.recording.lock().unwrap().clone()
    }

    pub fn set_recording(&self, recording: Arc<Recording>) {
        *self.recording.lock().unwrap() = Some(recording);
    }

    pub fn take_recording(&self) -> Option<Arc<Recording>> {
        self.recording.lock().unwrap().take()
    }

    /// simulcast_ssrc is the base-layer SSRC a demoted session accepts;
    /// zero means no filtering.
    pub fn simulcast_ssrc(&self) -> u32 {
        self.simulcast_ssrc.load(Ordering::SeqCst)
    }

    pub fn set_simulcast_ssrc(&self, ssrc: u32) {
        self.simulcast_ssrc.store(ssrc, Ordering::SeqCst);
    }

    pub fn pending_offer(&self) -> Option<PendingOffer> {
        *self.pending_offer.lock().unwrap()
    }

    pub fn set_pending_offer(&self, offer: Option<PendingOffer>) {
        *self.pending_offer.lock().unwrap() = offer;
    }

    pub fn sdp_session_id(&self) -> u64 {
        self.sdp_session_id
    }

    /// next_sdp_version bumps and returns the monotonically non-decreasing
    /// SDP version counter.
    pub fn next_sdp_version(&self) -> u64 {
        self.sdp_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn sdp_version(&self) -> u64 {
        self.sdp_version.load(Ordering::SeqCst)
    }

    pub(crate) fn set_writers(&self, audio: Option<TrackWriter>, video: Option<TrackWriter>) {
        let mut writers = self.writers.lock().unwrap();
        writers.audio = audio;
        writers.video = video;
    }

    /// save_frame appends an inbound RTP packet to the track's writer under
    /// the record-mutex. Packets for tracks that are not being recorded are
    /// dropped silently.
    pub(crate) fn save_frame(&self, kind: MediaKind, packet: &[u8]) -> Result<()> {
        let mut writers = self.writers.lock().unwrap();
        let writer = match kind {
            MediaKind::Audio => writers.audio.as_mut(),
            MediaKind::Video => writers.video.as_mut(),
        };
        match writer {
            Some(w) => w.save_frame(packet),
            None => Ok(()),
        }
    }

    pub(crate) fn close_writers(&self) {
        let mut writers = self.writers.lock().unwrap();
        for writer in [writers.audio.take(), writers.video.take()]
            .into_iter()
            .flatten()
        {
            let mut writer = writer;
            if let Err(e) = writer.close() {
                warn!("closing track writer failed: {e}");
            }
        }
    }

    pub(crate) fn set_indices(&self, audio: Option<FrameIndex>, video: Option<FrameIndex>) {
        *self.audio_index.lock().unwrap() = audio;
        *self.video_index.lock().unwrap() = video;
    }

    /// take_indices transfers index ownership to the playout worker.
    pub(crate) fn take_indices(&self) -> (Option<FrameIndex>, Option<FrameIndex>) {
        (
            self.audio_index.lock().unwrap().take(),
            self.video_index.lock().unwrap().take(),
        )
    }

    pub(crate) fn drop_indices(&self) {
        self.audio_index.lock().unwrap().take();
        self.video_index.lock().unwrap().take();
    }

    pub(crate) fn has_index(&self) -> bool {
        self.audio_index.lock().unwrap().is_some() || self.video_index.lock().unwrap().is_some()
    }

    pub fn video_bitrate(&self) -> u32 {
        self.video_bitrate.load(Ordering::SeqCst)
    }

    pub fn set_video_bitrate(&self, bitrate: u32) {
        self.video_bitrate.store(bitrate, Ordering::SeqCst);
    }

    pub fn keyframe_interval_ms(&self) -> u32 {
        self.keyframe_interval.load(Ordering::SeqCst)
    }

    pub fn set_keyframe_interval_ms(&self, interval: u32) {
        self.keyframe_interval.store(interval, Ordering::SeqCst);
    }

    /// reset_feedback re-arms the REMB ramp-up and feedback clocks when
    /// media comes up.
    pub(crate) fn reset_feedback(&self) {
        self.remb_startup.store(REMB_RAMPUP_STEPS, Ordering::SeqCst);
        let now = Instant::now();
        *self.remb_last.lock().unwrap() = now;
        *self.pli_last.lock().unwrap() = now;
    }

    /// take_remb_step returns the remaining ramp-up step count and consumes
    /// one, or `None` once the ramp is over.
    pub(crate) fn take_remb_step(&self) -> Option<u32> {
        let remaining = self.remb_startup.load(Ordering::SeqCst);
        if remaining == 0 {
            return None;
        }
        self.remb_startup.store(remaining - 1, Ordering::SeqCst);
        Some(remaining)
    }

    /// remb_due rolls the 5-second REMB clock forward when it expires.
    pub(crate) fn remb_due(&self, interval_ms: u64) -> bool {
        let mut last = self.remb_last.lock().unwrap();
        if last.elapsed().as_millis() as u64 >= interval_ms {
            *last = Instant::now();
            return true;
        }
        false
    }

    /// pli_due rolls the keyframe-request clock forward when it expires.
    pub(crate) fn pli_due(&self) -> bool {
        let interval = u64::from(self.keyframe_interval_ms());
        let mut last = self.pli_last.lock().unwrap();
        if last.elapsed().as_millis() as u64 >= interval {
            *last = Instant::now();
            return true;
        }
        false
    }
}

/// SessionTable is the process-wide catalogue of live peer sessions, keyed
/// by transport handle.
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable::default()
    }

    pub fn insert(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&session.id) {
            return false;
        }
        sessions.insert(session.id, session);
        true
    }

    pub fn lookup(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().remove(&id)
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }
}
