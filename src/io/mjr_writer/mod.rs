
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{BigEndian, WriteBytesExt};
use serde_json::json;

use super::{now_micros, FILE_HEADER_TAG, FRAME_HEADER_TAG, MIN_RTP_RECORD_SIZE};
use crate::codecs::{self, MediaKind};
use crate::error::{Error, Result};
use crate::io::mjr_reader::MjrHeader;

/// MjrWriter appends RTP packets to a current-format MJR file, one record
/// per packet. Writers are independent per track.
pub struct MjrWriter<W: Write> {
    writer: W,
    header: MjrHeader,
    frames: u64,
    closed: bool,
}

impl MjrWriter<BufWriter<std::fs::File>> {
    /// create atomically creates the target file and emits the info header.
    /// Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>, kind: MediaKind, codec: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        Self::new(BufWriter::new(file), kind, codec)
    }
}

impl<W: Write> MjrWriter<W> {
    pub fn new(mut writer: W, kind: MediaKind, codec: &str) -> Result<Self> {
        if !codecs::is_supported(kind, codec) {
            return Err(Error::ErrUnsupportedCodec(codec.to_owned()));
        }
        let created = now_micros();
        let info = json!({
            "t": if kind == MediaKind::Audio { "a" } else { "v" },
            "c": codec,
            "s": created,
        })
        .to_string();

        writer.write_all(FILE_HEADER_TAG)?;
        writer.write_u16::<BigEndian>(info.len() as u16)?;
        writer.write_all(info.as_bytes())?;

        Ok(MjrWriter {
            writer,
            header: MjrHeader {
                kind,
                codec: codec.to_owned(),
                created,
                first_write: 0,
            },
            frames: 0,
            closed: false,
        })
    }

    pub fn header(&self) -> &MjrHeader {
        &self.header
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    /// save_frame appends one RTP packet as a frame record. A sealed writer
    /// rejects further frames; a failed write seals the writer.
    pub fn save_frame(&mut self, packet: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::ErrWriterClosed);
        }
        if packet.len() < MIN_RTP_RECORD_SIZE || packet.len() > u16::MAX as usize {
            return Err(Error::ErrInvalidFrame);
        }
        if let Err(e) = self.write_record(packet) {
            self.closed = true;
            return Err(e);
        }
        if self.frames == 0 {
            self.header.first_write = now_micros();
        }
        self.frames += 1;
        Ok(())
    }

    fn write_record(&mut self, packet: &[u8]) -> Result<()> {
        self.writer.write_all(FRAME_HEADER_TAG)?;
        self.writer.write_u16::<BigEndian>(packet.len() as u16)?;
        self.writer.write_all(packet)?;
        Ok(())
    }

    /// close flushes and seals the writer.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.flush()?;
        Ok(())
    }
}

impl<W: Write> Drop for MjrWriter<W> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
