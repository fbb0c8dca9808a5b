
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::json;
use tokio::time::{sleep, Instant};

use crate::codecs::{self, MediaKind};
use crate::frame_index::{FrameIndex, FrameRecord};
use crate::io::mjr_reader::MjrReader;
use crate::io::FrameLocation;
use crate::recording::Track;
use crate::session::{Session, SessionState};
use crate::Context;

/// Packets are due once real time is within this many microseconds of their
/// reconstructed send time; with nothing due, the worker sleeps this long.
const PACING_SLACK_US: u64 = 5_000;

/// spawn launches the dedicated playout worker of a playing session.
pub(crate) fn spawn(ctx: Arc<Context>, session: Arc<Session>) {
    tokio::spawn(run(ctx, session));
}

/// TrackPlayout is the replay cursor of one track: the ordered frame list,
/// the open file, and the pacing anchor reconstructing the original
/// inter-frame spacing.
struct TrackPlayout {
    kind: MediaKind,
    reader: MjrReader<BufReader<File>>,
    index: FrameIndex,
    at: usize,
    /// Wall-clock anchor of the previously sent packet.
    before: Option<Instant>,
    prev_ts: u64,
    clock: u32,
    payload_type: u8,
}

impl TrackPlayout {
    fn open(ctx: &Context, kind: MediaKind, track: &Track, index: FrameIndex) -> Option<Self> {
        let path = ctx.path.join(format!("{}.mjr", track.file));
        match MjrReader::open(&path) {
            Ok(reader) => Some(TrackPlayout {
                kind,
                reader,
                index,
                at: 0,
                before: None,
                prev_ts: 0,
                clock: codecs::clock_rate(kind, &track.codec),
                payload_type: track.payload_type,
            }),
            Err(e) => {
                warn!("cannot open {kind} track {}: {e}", path.display());
                None
            }
        }
    }

    fn exhausted(&self) -> bool {
        self.at >= self.index.len()
    }

    /// advance sends the next packet if it is due and reports whether
    /// anything went out.
    fn advance(&mut self, session: &Session) -> bool {
        let Some(frame) = self.index.get(self.at).copied() else {
            return false;
        };

        let anchor = match self.before {
            // First packet of the track goes out immediately.
            None => Instant::now(),
            Some(before) => {
                let delta_ts = frame.ts.saturating_sub(self.prev_ts);
                let due_us = delta_ts * 1_000_000 / u64::from(self.clock);
                let elapsed = before.elapsed().as_micros() as u64;
                if elapsed + PACING_SLACK_US < due_us {
                    return false;
                }
                before + Duration::from_micros(due_us)
            }
        };

        self.send(session, &frame);
        self.before = Some(anchor);
        self.prev_ts = frame.ts;
        self.at += 1;

        // A video frame may span several packets on one timestamp; emit the
        // trailing ones together.
        if self.kind == MediaKind::Video {
            while let Some(next) = self.index.get(self.at).copied() {
                if next.ts != frame.ts {
                    break;
                }
                self.send(session, &next);
                self.at += 1;
            }
        }
        true
    }

    fn send(&mut self, session: &Session, frame: &FrameRecord) {
        let loc = FrameLocation {
            offset: frame.offset,
            len: frame.len,
        };
        match self.reader.read_payload(&loc) {
            Ok(mut packet) => {
                packet[1] = (packet[1] & 0x80) | (self.payload_type & 0x7f);
                session.transport.send_rtp(self.kind, &packet);
            }
            Err(e) => {
                warn!("reading {} frame failed, dropping track: {e}", self.kind);
                self.at = self.index.len();
            }
        }
    }
}

async fn run(ctx: Arc<Context>, session: Arc<Session>) {
    let Some(recording) = session.recording() else {
        warn!("playout worker without a recording, session {}", session.id);
        return;
    };
    let (audio_index, video_index) = session.take_indices();

    let mut audio = match (&recording.audio, audio_index) {
        (Some(track), Some(index)) => TrackPlayout::open(&ctx, MediaKind::Audio, track, index),
        _ => None,
    };
    let mut video = match (&recording.video, video_index) {
        (Some(track), Some(index)) => TrackPlayout::open(&ctx, MediaKind::Video, track, index),
        _ => None,
    };
    if audio.is_none() && video.is_none() {
        warn!(
            "no playable track in recording {}, session {}",
            recording.id, session.id
        );
    } else {
        // Wait for the viewer's answer to commit and the media path to come
        // up, then pace the recording out.
        loop {
            if session.is_destroyed() || session.state() == SessionState::Done {
                break;
            }
            if session.is_active() && session.state() == SessionState::Playing {
                info!(
                    "playout of recording {} starting for session {}",
                    recording.id, session.id
                );
                stream(&session, &mut audio, &mut video).await;
                break;
            }
            sleep(Duration::from_micros(PACING_SLACK_US)).await;
        }
    }

    // Teardown: close files, drop the indices, leave the viewer list, then
    // ask the host to fold the peer connection.
    drop(audio);
    drop(video);
    session.drop_indices();
    recording.remove_viewer(session.id);
    ctx.emit_event(json!({
        "event": "playout-done",
        "id": recording.id,
        "session": session.id,
    }));
    debug!(
        "playout worker for session {} leaving, recording {}",
        session.id, recording.id
    );
    if !session.is_destroyed() {
        session.transport.close_peer().await;
    }
}

async fn stream(
    session: &Arc<Session>,
    audio: &mut Option<TrackPlayout>,
    video: &mut Option<TrackPlayout>,
) {
    while !session.is_destroyed() && session.state() == SessionState::Playing {
        let mut sent = false;
        if let Some(track) = audio.as_mut() {
            sent |= track.advance(session);
        }
        if let Some(track) = video.as_mut() {
            sent |= track.advance(session);
        }

        let audio_done = audio.as_ref().map_or(true, TrackPlayout::exhausted);
        let video_done = video.as_ref().map_or(true, TrackPlayout::exhausted);
        if audio_done && video_done {
            break;
        }
        if !sent {
            sleep(Duration::from_micros(PACING_SLACK_US)).await;
        }
    }
}
