use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use flate2::{Decompress, FlushDecompress, Status};
use memmap2::Mmap;
use thiserror::Error;

use crate::event::{self, decode_record, Event, RecordError};
use crate::FRAME_PAYLOAD_SIZE;

/// Errors raised by the trace codec. Every variant names the byte offset
/// the reader was looking at when it gave up; offsets inside a frame are
/// reported relative to the frame's position in the file, since the
/// payload itself is compressed.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to open trace file {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: io::Error,
    },
    #[error("truncated frame header at offset {offset:#x}")]
    TruncatedFrame { offset: u64 },
    #[error("frame length {len:#x} at offset {offset:#x} runs past the end of the trace")]
    FrameOutOfBounds { offset: u64, len: u64 },
    #[error("trace ends without a trailing length sentinel (expected at offset {offset:#x})")]
    MissingSentinel { offset: u64 },
    #[error(
        "frame at offset {offset:#x}: trailing length {trailing:#x} does not match \
         leading length {len:#x}"
    )]
    LengthMismatch { offset: u64, len: u64, trailing: u64 },
    #[error("frame at offset {offset:#x} failed to decompress: {source}")]
    Decompress {
        offset: u64,
        source: flate2::DecompressError,
    },
    #[error("frame at offset {offset:#x} decompresses past the {max}-byte payload bound")]
    PayloadOverflow { offset: u64, max: usize },
    #[error("unknown event label {label:#04x} at offset {offset:#x} in the frame at {frame:#x}")]
    UnknownLabel { frame: u64, offset: u64, label: u8 },
    #[error("event record at offset {offset:#x} in the frame at {frame:#x} is cut short")]
    TruncatedRecord { frame: u64, offset: u64 },
    #[error(
        "event record at offset {offset:#x} in the frame at {frame:#x}: trailing label \
         {trailing:#04x} does not match leading label {label:#04x}"
    )]
    TrailingLabelMismatch {
        frame: u64,
        offset: u64,
        label: u8,
        trailing: u8,
    },
}

fn record_error(err: RecordError, frame: u64, offset: u64) -> TraceError {
    match err {
        RecordError::UnknownLabel(label) => TraceError::UnknownLabel { frame, offset, label },
        RecordError::Truncated => TraceError::TruncatedRecord { frame, offset },
        RecordError::TrailingLabelMismatch { label, trailing } => {
            TraceError::TrailingLabelMismatch { frame, offset, label, trailing }
        }
    }
}

/// A memory-mapped trace file. The map is read-only; all decoding happens
/// into a per-iterator payload buffer.
pub struct TraceReader {
    mmap: Option<Mmap>,
}

impl TraceReader {
    pub fn open(path: &Path) -> Result<Self, TraceError> {
        let open_err = |source| TraceError::Open { path: path.to_owned(), source };
        let file = File::open(path).map_err(open_err)?;
        let len = file.metadata().map_err(open_err)?.len();
        let mmap = if len == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&file) }.map_err(open_err)?)
        };
        Ok(TraceReader { mmap })
    }

    fn data(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// Iterate events front to back, one decompressed frame at a time.
    pub fn forward(&self) -> ForwardEvents<'_> {
        ForwardEvents {
            data: self.data(),
            pos: 0,
            frame: 0,
            payload: Vec::new(),
            payload_len: 0,
            payload_pos: 0,
            done: false,
        }
    }

    /// Iterate events back to front. Whole frames are decoded at a time
    /// and replayed in reverse, so the event sequence is exactly the
    /// reverse of [`TraceReader::forward`].
    pub fn backward(&self) -> BackwardEvents<'_> {
        let data = self.data();
        BackwardEvents {
            data,
            end: data.len(),
            payload: Vec::new(),
            events: Vec::new(),
            idx: 0,
            done: false,
        }
    }
}

fn decompress_frame(
    input: &[u8],
    payload: &mut Vec<u8>,
    frame_offset: u64,
) -> Result<usize, TraceError> {
    if payload.is_empty() {
        payload.resize(FRAME_PAYLOAD_SIZE, 0);
    }
    let mut decompress = Decompress::new(false);
    let status = decompress
        .decompress(input, payload, FlushDecompress::Finish)
        .map_err(|source| TraceError::Decompress { offset: frame_offset, source })?;
    let consumed = decompress.total_in() as usize;
    if status != Status::StreamEnd || consumed < input.len() {
        // The output buffer filled up before the stream ended.
        return Err(TraceError::PayloadOverflow {
            offset: frame_offset,
            max: FRAME_PAYLOAD_SIZE,
        });
    }
    Ok(decompress.total_out() as usize)
}

pub struct ForwardEvents<'a> {
    data: &'a [u8],
    pos: usize,
    frame: u64,
    payload: Vec<u8>,
    payload_len: usize,
    payload_pos: usize,
    done: bool,
}

impl ForwardEvents<'_> {
    /// Load and decompress the next frame. `Ok(false)` means clean EOF.
    fn next_frame(&mut self) -> Result<bool, TraceError> {
        if self.pos >= self.data.len() {
            return Ok(false);
        }
        let offset = self.pos as u64;
        if self.pos + 8 > self.data.len() {
            return Err(TraceError::TruncatedFrame { offset });
        }
        let len = LittleEndian::read_u64(&self.data[self.pos..self.pos + 8]);
        let start = self.pos + 8;
        let end = match (len as usize).checked_add(start) {
            Some(end) if end + 8 <= self.data.len() => end,
            _ => return Err(TraceError::FrameOutOfBounds { offset, len }),
        };
        let trailing = LittleEndian::read_u64(&self.data[end..end + 8]);
        if trailing != len {
            return Err(TraceError::LengthMismatch { offset, len, trailing });
        }

        self.payload_len = decompress_frame(&self.data[start..end], &mut self.payload, offset)?;
        self.payload_pos = 0;
        self.frame = offset;
        self.pos = end + 8;
        Ok(true)
    }
}

impl Iterator for ForwardEvents<'_> {
    type Item = Result<Event, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            while self.payload_pos < self.payload_len {
                match self.payload[self.payload_pos] {
                    event::label::END => {
                        self.done = true;
                        return None;
                    }
                    event::label::PLACE_HOLDER => {
                        self.payload_pos += 1;
                    }
                    _ => {
                        let offset = self.payload_pos as u64;
                        match decode_record(&self.payload[..self.payload_len], self.payload_pos) {
                            Ok((ev, size)) => {
                                self.payload_pos += size;
                                return Some(Ok(ev));
                            }
                            Err(err) => {
                                self.done = true;
                                return Some(Err(record_error(err, self.frame, offset)));
                            }
                        }
                    }
                }
            }
            match self.next_frame() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

pub struct BackwardEvents<'a> {
    data: &'a [u8],
    end: usize,
    payload: Vec<u8>,
    events: Vec<Event>,
    idx: usize,
    done: bool,
}

impl BackwardEvents<'_> {
    /// Decode the frame that ends at `self.end` and stage its events.
    /// A final frame cut off mid-write surfaces as `MissingSentinel`.
    fn prev_frame(&mut self) -> Result<bool, TraceError> {
        if self.end == 0 {
            return Ok(false);
        }
        if self.end < 16 {
            return Err(TraceError::MissingSentinel { offset: self.end as u64 });
        }
        let len = LittleEndian::read_u64(&self.data[self.end - 8..self.end]);
        let frame_offset = match (len as usize).checked_add(16) {
            Some(total) if total <= self.end => self.end - total,
            _ => {
                return Err(TraceError::MissingSentinel {
                    offset: (self.end - 8) as u64,
                })
            }
        };
        let leading = LittleEndian::read_u64(&self.data[frame_offset..frame_offset + 8]);
        if leading != len {
            return Err(TraceError::LengthMismatch {
                offset: frame_offset as u64,
                len: leading,
                trailing: len,
            });
        }

        let start = frame_offset + 8;
        let payload_len = decompress_frame(
            &self.data[start..start + len as usize],
            &mut self.payload,
            frame_offset as u64,
        )?;

        self.events.clear();
        let mut pos = 0;
        while pos < payload_len {
            match self.payload[pos] {
                event::label::END => break,
                event::label::PLACE_HOLDER => pos += 1,
                _ => match decode_record(&self.payload[..payload_len], pos) {
                    Ok((ev, size)) => {
                        self.events.push(ev);
                        pos += size;
                    }
                    Err(err) => {
                        return Err(record_error(err, frame_offset as u64, pos as u64));
                    }
                },
            }
        }
        self.idx = self.events.len();
        self.end = frame_offset;
        Ok(true)
    }
}

impl Iterator for BackwardEvents<'_> {
    type Item = Result<Event, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.idx > 0 {
                self.idx -= 1;
                return Some(Ok(self.events[self.idx]));
            }
            match self.prev_frame() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
