
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::session::Session;

/// Track is one persisted media stream of a recording. The codec and the
/// file name travel together: a recording either has both or neither for a
/// given media kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    /// Negotiated codec name, lowercase.
    pub codec: String,
    /// File name stem under the recordings directory, without `.mjr`.
    pub file: String,
    /// Payload type stamped on replayed packets.
    pub payload_type: u8,
}

/// Recording is one recorded session: immutable identity plus the mutable
/// completion state and the list of sessions currently replaying it.
#[derive(Debug)]
pub struct Recording {
    pub id: u64,
    pub name: String,
    /// Creation time, `YYYY-MM-DD HH:MM:SS` local.
    pub date: String,
    pub audio: Option<Track>,
    pub video: Option<Track>,
    offer: Mutex<Option<String>>,
    viewers: Mutex<Vec<Weak<Session>>>,
    completed: AtomicBool,
    destroyed: AtomicBool,
}

impl PartialEq for Recording {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Recording {
    pub fn new(
        id: u64,
        name: String,
        date: String,
        audio: Option<Track>,
        video: Option<Track>,
    ) -> Self {
        Recording {
            id,
            name,
            date,
            audio,
            video,
            offer: Mutex::new(None),
            viewers: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    /// offer returns the precomputed SDP viewers are handed on `play`.
    pub fn offer(&self) -> Option<String> {
        self.offer.lock().unwrap().clone()
    }

    pub fn set_offer(&self, sdp: String) {
        *self.offer.lock().unwrap() = Some(sdp);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    /// add_viewer appends a replaying session. The list holds weak
    /// references so a dangling viewer can never keep the cycle alive.
    pub fn add_viewer(&self, session: &Arc<Session>) {
        let mut viewers = self.viewers.lock().unwrap();
        viewers.retain(|w| w.upgrade().is_some());
        if !viewers
            .iter()
            .any(|w| w.upgrade().is_some_and(|s| s.id == session.id))
        {
            viewers.push(Arc::downgrade(session));
        }
    }

    pub fn remove_viewer(&self, session_id: u64) {
        self.viewers
            .lock()
            .unwrap()
            .retain(|w| w.upgrade().is_some_and(|s| s.id != session_id));
    }

    /// viewers returns the live replaying sessions, pruning dead entries.
    pub fn viewers(&self) -> Vec<Arc<Session>> {
        let mut list = self.viewers.lock().unwrap();
        list.retain(|w| w.upgrade().is_some());
        list.iter().filter_map(Weak::upgrade).collect()
    }
}

/// RecordingSummary is one element of a `list` response.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RecordingSummary {
    pub id: u64,
    pub name: String,
    pub date: String,
    pub audio: bool,
    pub video: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
}

/// Registry is the process-wide catalogue of recordings, keyed by id. The
/// lock is never held across I/O.
#[derive(Default)]
pub struct Registry {
    recordings: Mutex<HashMap<u64, Arc<Recording>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// allocate_id draws random non-zero ids until one is free. The control
    /// dispatcher serializes recording creation, so allocate-then-insert
    /// cannot race against itself.
    pub fn allocate_id(&self) -> u64 {
        loop {
            let id: u64 = rand::random();
            if id != 0 && !self.contains(id) {
                return id;
            }
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.recordings.lock().unwrap().contains_key(&id)
    }

    pub fn insert(&self, recording: Arc<Recording>) -> Result<()> {
        let mut recordings = self.recordings.lock().unwrap();
        if recordings.contains_key(&recording.id) {
            return Err(Error::ErrRecordingExists);
        }
        recordings.insert(recording.id, recording);
        Ok(())
    }

    pub fn lookup(&self, id: u64) -> Result<Arc<Recording>> {
        self.recordings
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::ErrNotFound)
    }

    /// remove drops the registry's reference; the recording lives on until
    /// every other holder releases it.
    pub fn remove(&self, id: u64) -> Option<Arc<Recording>> {
        self.recordings.lock().unwrap().remove(&id)
    }

    /// list snapshots the completed, non-destroyed recordings.
    pub fn list(&self) -> Vec<RecordingSummary> {
        let recordings = self.recordings.lock().unwrap();
        let mut list: Vec<RecordingSummary> = recordings
            .values()
            .filter(|r| r.is_completed() && !r.is_destroyed())
            .map(|r| RecordingSummary {
                id: r.id,
                name: r.name.clone(),
                date: r.date.clone(),
                audio: r.audio.is_some(),
                video: r.video.is_some(),
                audio_codec: r.audio.as_ref().map(|t| t.codec.clone()),
                video_codec: r.video.as_ref().map(|t| t.codec.clone()),
            })
            .collect();
        list.sort_by_key(|s| s.id);
        list
    }
}
