use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::event::{label, Event};
use crate::FRAME_PAYLOAD_SIZE;

/// Append-only writer for the framed trace format.
///
/// Records are buffered into a raw payload. When the next record would not
/// fit, the rest of the payload is filled with `PlaceHolder` bytes and the
/// whole 32 MiB payload is compressed into one frame, so a record never
/// straddles a frame boundary. [`TraceWriter::finish`] appends the `End`
/// terminator and flushes the final frame.
pub struct TraceWriter {
    out: BufWriter<File>,
    payload: Vec<u8>,
}

impl TraceWriter {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(TraceWriter {
            out: BufWriter::new(File::create(path)?),
            payload: Vec::with_capacity(FRAME_PAYLOAD_SIZE),
        })
    }

    pub fn write_event(&mut self, event: &Event) -> io::Result<()> {
        if self.payload.len() + event.wire_size() > FRAME_PAYLOAD_SIZE {
            self.flush_frame()?;
        }
        event.encode_into(&mut self.payload);
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<()> {
        if self.payload.len() + 1 > FRAME_PAYLOAD_SIZE {
            self.flush_frame()?;
        }
        self.payload.push(label::END);
        self.flush_frame()?;
        self.out.flush()
    }

    fn flush_frame(&mut self) -> io::Result<()> {
        self.payload.resize(FRAME_PAYLOAD_SIZE, label::PLACE_HOLDER);
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&self.payload)?;
        let compressed = encoder.finish()?;
        self.out.write_u64::<LittleEndian>(compressed.len() as u64)?;
        self.out.write_all(&compressed)?;
        self.out.write_u64::<LittleEndian>(compressed.len() as u64)?;
        self.payload.clear();
        Ok(())
    }
}
