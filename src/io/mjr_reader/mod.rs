
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::BytesMut;
use log::warn;
use serde_json::Value;

use super::{FrameLocation, MIN_RTP_RECORD_SIZE};
use crate::codecs::{self, MediaKind};
use crate::error::{Error, Result};

/// MjrHeader is the parsed info header of an MJR file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MjrHeader {
    pub kind: MediaKind,
    pub codec: String,
    /// Creation time, microseconds since epoch (`s` key). 0 in legacy files.
    pub created: i64,
    /// First-write time, microseconds since epoch (`u` key). 0 if absent.
    pub first_write: i64,
}

/// MjrReader walks the records of an MJR file and hands out the offsets of
/// the RTP payloads inside it, plus random access to those payloads.
pub struct MjrReader<R: Read + Seek> {
    reader: R,
    header: MjrHeader,
    legacy: bool,
    frames_start: u64,
    scan_pos: u64,
}

impl MjrReader<BufReader<File>> {
    /// open parses the header of the MJR file at `path` and returns a reader
    /// positioned on its first record.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> MjrReader<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let mut tag = [0u8; 8];
        reader
            .read_exact(&mut tag)
            .map_err(|_| Error::ErrInvalidHeader)?;
        if tag[0] != b'M' {
            return Err(Error::ErrInvalidHeader);
        }
        let len = reader
            .read_u16::<BigEndian>()
            .map_err(|_| Error::ErrInvalidHeader)? as usize;
        let mut payload = vec![0u8; len];
        reader
            .read_exact(&mut payload)
            .map_err(|_| Error::ErrInvalidHeader)?;

        let (header, legacy) = if tag[1] == b'J' {
            (parse_info_header(&payload)?, false)
        } else if tag[1] == b'E' {
            (parse_legacy_header(&payload)?, true)
        } else {
            return Err(Error::ErrInvalidHeader);
        };

        let frames_start = reader.stream_position()?;
        Ok(MjrReader {
            reader,
            header,
            legacy,
            frames_start,
            scan_pos: frames_start,
        })
    }

    pub fn header(&self) -> &MjrHeader {
        &self.header
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    /// rewind restarts record iteration from the first record after the
    /// file header.
    pub fn rewind(&mut self) {
        self.scan_pos = self.frames_start;
    }

    /// next_frame advances to the next RTP record and returns the location
    /// of its payload, skipping side-data records (tag second byte `'J'`)
    /// and records too short to hold an RTP packet. Returns `None` at
    /// end-of-file; a truncated trailing record also ends iteration.
    pub fn next_frame(&mut self) -> Result<Option<FrameLocation>> {
        self.reader.seek(SeekFrom::Start(self.scan_pos))?;
        loop {
            let mut tag = [0u8; 8];
            if let Err(e) = self.reader.read_exact(&mut tag) {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    self.scan_pos = self.reader.stream_position()?;
                    return Ok(None);
                }
                return Err(e.into());
            }
            if tag[0] != b'M' {
                warn!("corrupt record tag, stopping iteration");
                return Ok(None);
            }
            let len = match self.reader.read_u16::<BigEndian>() {
                Ok(len) => len,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!("truncated record length, stopping iteration");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            if tag[1] == b'J' || (len as usize) < MIN_RTP_RECORD_SIZE {
                // Non-RTP side-data.
                self.reader.seek(SeekFrom::Current(len as i64))?;
                continue;
            }
            let offset = self.reader.stream_position()?;
            self.reader.seek(SeekFrom::Current(len as i64))?;
            self.scan_pos = self.reader.stream_position()?;
            return Ok(Some(FrameLocation { offset, len }));
        }
    }

    /// read_payload reads the RTP packet a location points at. Iteration
    /// state is unaffected.
    pub fn read_payload(&mut self, loc: &FrameLocation) -> Result<BytesMut> {
        self.reader.seek(SeekFrom::Start(loc.offset))?;
        let mut payload = BytesMut::with_capacity(loc.len as usize);
        payload.resize(loc.len as usize, 0);
        self.reader.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// read_rtp_prologue reads just the fixed RTP header of a record, enough
    /// for sequence number and timestamp inspection.
    pub fn read_rtp_prologue(&mut self, loc: &FrameLocation) -> Result<[u8; 12]> {
        self.reader.seek(SeekFrom::Start(loc.offset))?;
        let mut prologue = [0u8; 12];
        self.reader.read_exact(&mut prologue)?;
        Ok(prologue)
    }
}

fn parse_info_header(payload: &[u8]) -> Result<MjrHeader> {
    let info: Value = serde_json::from_slice(payload).map_err(|_| Error::ErrInvalidJson)?;
    let info = info.as_object().ok_or(Error::ErrInvalidJson)?;

    let kind = match info.get("t").and_then(Value::as_str) {
        Some("a") => MediaKind::Audio,
        Some("v") => MediaKind::Video,
        Some(_) => return Err(Error::ErrInvalidHeader),
        None => return Err(Error::ErrMissingField("t")),
    };
    let codec = info
        .get("c")
        .and_then(Value::as_str)
        .ok_or(Error::ErrMissingField("c"))?;
    if !codecs::is_supported(kind, codec) {
        return Err(Error::ErrUnsupportedCodec(codec.to_owned()));
    }

    Ok(MjrHeader {
        kind,
        codec: codec.to_owned(),
        created: info.get("s").and_then(Value::as_i64).unwrap_or(0),
        first_write: info.get("u").and_then(Value::as_i64).unwrap_or(0),
    })
}

fn parse_legacy_header(payload: &[u8]) -> Result<MjrHeader> {
    // Legacy header payload is the 5-byte string "video" or "audio", with
    // the codec implied.
    if payload.len() != 5 {
        return Err(Error::ErrInvalidHeader);
    }
    let (kind, codec) = match payload[0] {
        b'v' => (MediaKind::Video, "vp8"),
        b'a' => (MediaKind::Audio, "opus"),
        _ => return Err(Error::ErrInvalidHeader),
    };
    Ok(MjrHeader {
        kind,
        codec: codec.to_owned(),
        created: 0,
        first_write: 0,
    })
}
