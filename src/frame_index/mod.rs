
use std::io::{Read, Seek};

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::error::Result;
use crate::io::mjr_reader::MjrReader;

/// Backward timestamp jumps larger than this are clock resets; smaller ones
/// are out-of-order packets.
const RESET_JUMP: u32 = 2_000_000_000;

/// Sequence numbers this far apart have wrapped rather than reordered.
const SEQ_WRAP_WINDOW: u32 = 10_000;

/// FrameRecord locates one RTP packet of a recording in its logical
/// position: the 16-bit sequence number, the 64-bit extended timestamp, and
/// where the payload lives in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRecord {
    pub seq: u16,
    pub ts: u64,
    pub len: u16,
    pub offset: u64,
}

/// FrameIndex is the timestamp-ordered list of a recording's frames,
/// rebuilt from file order so that replay reproduces the original send
/// order across RTP clock resets and sequence-number wraps.
#[derive(Debug, Default)]
pub struct FrameIndex {
    frames: Vec<FrameRecord>,
}

impl FrameIndex {
    /// build walks the file twice: once to detect a timestamp reset, once
    /// to place every packet by extended timestamp.
    pub fn build<R: Read + Seek>(reader: &mut MjrReader<R>) -> Result<FrameIndex> {
        // Pass 1: collect packet positions and find the reset point, if any.
        reader.rewind();
        let mut packets = Vec::new();
        let mut first_ts: Option<u32> = None;
        let mut last_ts: Option<u32> = None;
        let mut reset: Option<u32> = None;

        while let Some(loc) = reader.next_frame()? {
            let prologue = reader.read_rtp_prologue(&loc)?;
            let seq = BigEndian::read_u16(&prologue[2..4]);
            let ts = BigEndian::read_u32(&prologue[4..8]);
            packets.push((loc, seq, ts));

            if first_ts.is_none() {
                // Leave some room under the first timestamp so that slightly
                // older out-of-order packets still count as pre-reset. The
                // subtraction wraps with the 32-bit clock.
                first_ts = Some(ts.wrapping_sub(1_000_000));
            }
            match reset {
                Some(r) if ts < r => reset = Some(ts),
                Some(_) => {}
                None => {
                    if let Some(last) = last_ts {
                        if ts < last && last - ts > RESET_JUMP {
                            reset = Some(ts);
                        }
                    }
                }
            }
            last_ts = Some(ts);
        }

        let first_ts = first_ts.unwrap_or(0);
        if reset.is_some() {
            debug!(
                "timestamp reset detected at {:?}, lifting post-reset packets",
                reset
            );
        }

        // Pass 2: extend timestamps across the reset and insert from the
        // tail backward.
        let mut frames: Vec<FrameRecord> = Vec::with_capacity(packets.len());
        for (loc, seq, ts) in packets {
            let ext = match reset {
                None => u64::from(ts),
                Some(_) if ts > first_ts => u64::from(ts),
                Some(_) => u64::from(ts) + (1u64 << 32),
            };
            let rec = FrameRecord {
                seq,
                ts: ext,
                len: loc.len,
                offset: loc.offset,
            };

            let mut at = frames.len();
            while at > 0 {
                let candidate = &frames[at - 1];
                if candidate.ts < rec.ts {
                    break;
                }
                if candidate.ts == rec.ts
                    && (candidate.seq == rec.seq || seq_comes_after(candidate.seq, rec.seq))
                {
                    break;
                }
                at -= 1;
            }
            frames.insert(at, rec);
        }

        Ok(FrameIndex { frames })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, at: usize) -> Option<&FrameRecord> {
        self.frames.get(at)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FrameRecord> {
        self.frames.iter()
    }
}

/// seq_comes_after reports whether a packet with sequence number `seq`
/// logically follows `candidate` at the same timestamp, treating distances
/// beyond the wrap window as a 16-bit wrap-around.
fn seq_comes_after(candidate: u16, seq: u16) -> bool {
    let diff = (i32::from(candidate) - i32::from(seq)).unsigned_abs();
    (candidate < seq && diff < SEQ_WRAP_WINDOW) || (candidate > seq && diff > SEQ_WRAP_WINDOW)
}
