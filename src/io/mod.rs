pub mod mjr_reader;
pub mod mjr_writer;

use std::time::{SystemTime, UNIX_EPOCH};

/// Tag of the file-header record in current-format files.
pub const FILE_HEADER_TAG: &[u8; 8] = b"MJR00002";

/// Tag of every frame record, and of the file-header record in legacy files.
pub const FRAME_HEADER_TAG: &[u8; 8] = b"MEETECHO";

/// Every record starts with an 8-byte tag and a 16-bit big-endian length.
pub const RECORD_TAG_SIZE: usize = 8;

/// Records shorter than a bare RTP header cannot carry a packet and are
/// skipped as side-data.
pub const MIN_RTP_RECORD_SIZE: usize = 12;

/// FrameLocation points at one RTP payload inside an MJR file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLocation {
    /// Byte offset of the payload within the file.
    pub offset: u64,
    /// Payload length in bytes.
    pub len: u16,
}

pub(crate) fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
