use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

/// Wire labels of the trace event records. Every record starts and ends
/// with its label byte; the duplicated trailing byte is what makes the
/// stream parseable backwards.
pub mod label {
    pub const BASIC_BLOCK: u8 = 0;
    pub const MEMORY: u8 = 1;
    pub const CALL: u8 = 2;
    pub const RETURN: u8 = 3;
    pub const SYSCALL: u8 = 4;
    pub const ARGUMENT: u8 = 5;
    pub const MEMSET: u8 = 6;
    pub const MEMMOVE: u8 = 7;
    pub const END: u8 = 125;
    pub const PLACE_HOLDER: u8 = 126;
}

/// A single record from either trace stream.
///
/// The compiler-level stream carries `BasicBlock`, `Memory`, `Return`,
/// `Argument`, `Memset` and `Memmove`; the syscall-level stream carries
/// `Call`, `Return` and `Syscall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// An instrumented basic block started executing.
    BasicBlock { tid: u64, bb: u32 },
    /// A load, store or atomic access of `[addr, addr + len)`.
    Memory { tid: u64, inst: u32, addr: u64, len: u64 },
    /// A function call observed by the syscall tracer.
    Call { tid: u64, callee: u64 },
    /// An external call returned. `callee` is the callee's address; in the
    /// syscall stream `inst` is zero.
    Return { tid: u64, inst: u32, callee: u64 },
    /// A side-effecting system call executed.
    Syscall { tid: u64 },
    /// A pointer-valued argument recorded just before an external call.
    Argument { tid: u64, ptr: u64 },
    Memset { tid: u64, inst: u32, addr: u64, len: u64 },
    Memmove { tid: u64, inst: u32, dst: u64, src: u64, len: u64 },
}

pub(crate) const SIZE_BASIC_BLOCK: usize = 14;
pub(crate) const SIZE_MEMORY: usize = 30;
pub(crate) const SIZE_CALL: usize = 18;
pub(crate) const SIZE_RETURN: usize = 22;
pub(crate) const SIZE_SYSCALL: usize = 10;
pub(crate) const SIZE_ARGUMENT: usize = 18;
pub(crate) const SIZE_MEMSET: usize = 30;
pub(crate) const SIZE_MEMMOVE: usize = 38;

pub(crate) fn record_size(label: u8) -> Option<usize> {
    match label {
        label::BASIC_BLOCK => Some(SIZE_BASIC_BLOCK),
        label::MEMORY => Some(SIZE_MEMORY),
        label::CALL => Some(SIZE_CALL),
        label::RETURN => Some(SIZE_RETURN),
        label::SYSCALL => Some(SIZE_SYSCALL),
        label::ARGUMENT => Some(SIZE_ARGUMENT),
        label::MEMSET => Some(SIZE_MEMSET),
        label::MEMMOVE => Some(SIZE_MEMMOVE),
        label::END | label::PLACE_HOLDER => Some(1),
        _ => None,
    }
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, value);
    out.extend_from_slice(&buf);
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, value);
    out.extend_from_slice(&buf);
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum RecordError {
    UnknownLabel(u8),
    Truncated,
    TrailingLabelMismatch { label: u8, trailing: u8 },
}

/// Decode the record starting at `pos`. Returns the event and its wire
/// size. `End` and `PlaceHolder` must be filtered out by the caller.
pub(crate) fn decode_record(payload: &[u8], pos: usize) -> Result<(Event, usize), RecordError> {
    let label = payload[pos];
    let size = record_size(label).ok_or(RecordError::UnknownLabel(label))?;
    if pos + size > payload.len() {
        return Err(RecordError::Truncated);
    }
    let record = &payload[pos..pos + size];
    let trailing = record[size - 1];
    if trailing != label {
        return Err(RecordError::TrailingLabelMismatch { label, trailing });
    }

    let tid = LittleEndian::read_u64(&record[1..9]);
    let event = match label {
        label::BASIC_BLOCK => Event::BasicBlock {
            tid,
            bb: LittleEndian::read_u32(&record[9..13]),
        },
        label::MEMORY => Event::Memory {
            tid,
            inst: LittleEndian::read_u32(&record[9..13]),
            addr: LittleEndian::read_u64(&record[13..21]),
            len: LittleEndian::read_u64(&record[21..29]),
        },
        label::CALL => Event::Call {
            tid,
            callee: LittleEndian::read_u64(&record[9..17]),
        },
        label::RETURN => Event::Return {
            tid,
            inst: LittleEndian::read_u32(&record[9..13]),
            callee: LittleEndian::read_u64(&record[13..21]),
        },
        label::SYSCALL => Event::Syscall { tid },
        label::ARGUMENT => Event::Argument {
            tid,
            ptr: LittleEndian::read_u64(&record[9..17]),
        },
        label::MEMSET => Event::Memset {
            tid,
            inst: LittleEndian::read_u32(&record[9..13]),
            addr: LittleEndian::read_u64(&record[13..21]),
            len: LittleEndian::read_u64(&record[21..29]),
        },
        label::MEMMOVE => Event::Memmove {
            tid,
            inst: LittleEndian::read_u32(&record[9..13]),
            dst: LittleEndian::read_u64(&record[13..21]),
            src: LittleEndian::read_u64(&record[21..29]),
            len: LittleEndian::read_u64(&record[29..37]),
        },
        _ => unreachable!("End/PlaceHolder are handled by the frame walker"),
    };
    Ok((event, size))
}

impl Event {
    pub fn label(&self) -> u8 {
        match self {
            Event::BasicBlock { .. } => label::BASIC_BLOCK,
            Event::Memory { .. } => label::MEMORY,
            Event::Call { .. } => label::CALL,
            Event::Return { .. } => label::RETURN,
            Event::Syscall { .. } => label::SYSCALL,
            Event::Argument { .. } => label::ARGUMENT,
            Event::Memset { .. } => label::MEMSET,
            Event::Memmove { .. } => label::MEMMOVE,
        }
    }

    pub fn tid(&self) -> u64 {
        match *self {
            Event::BasicBlock { tid, .. }
            | Event::Memory { tid, .. }
            | Event::Call { tid, .. }
            | Event::Return { tid, .. }
            | Event::Syscall { tid }
            | Event::Argument { tid, .. }
            | Event::Memset { tid, .. }
            | Event::Memmove { tid, .. } => tid,
        }
    }

    pub fn wire_size(&self) -> usize {
        match self {
            Event::BasicBlock { .. } => SIZE_BASIC_BLOCK,
            Event::Memory { .. } => SIZE_MEMORY,
            Event::Call { .. } => SIZE_CALL,
            Event::Return { .. } => SIZE_RETURN,
            Event::Syscall { .. } => SIZE_SYSCALL,
            Event::Argument { .. } => SIZE_ARGUMENT,
            Event::Memset { .. } => SIZE_MEMSET,
            Event::Memmove { .. } => SIZE_MEMMOVE,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let label = self.label();
        out.push(label);
        match *self {
            Event::BasicBlock { tid, bb } => {
                push_u64(out, tid);
                push_u32(out, bb);
            }
            Event::Memory { tid, inst, addr, len } | Event::Memset { tid, inst, addr, len } => {
                push_u64(out, tid);
                push_u32(out, inst);
                push_u64(out, addr);
                push_u64(out, len);
            }
            Event::Call { tid, callee } => {
                push_u64(out, tid);
                push_u64(out, callee);
            }
            Event::Return { tid, inst, callee } => {
                push_u64(out, tid);
                push_u32(out, inst);
                push_u64(out, callee);
            }
            Event::Syscall { tid } => {
                push_u64(out, tid);
            }
            Event::Argument { tid, ptr } => {
                push_u64(out, tid);
                push_u64(out, ptr);
            }
            Event::Memmove { tid, inst, dst, src, len } => {
                push_u64(out, tid);
                push_u32(out, inst);
                push_u64(out, dst);
                push_u64(out, src);
                push_u64(out, len);
            }
        }
        out.push(label);
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Event::BasicBlock { tid, bb } => write!(f, "BasicBlockEvent: {tid}\t{bb}"),
            Event::Memory { tid, inst, addr, len } => {
                write!(f, "MemoryEvent:     {tid}\t{inst}\t{addr:#x}\t{len}")
            }
            Event::Call { tid, callee } => write!(f, "CallEvent:       {tid}\t{callee:#x}"),
            Event::Return { tid, inst, callee } => {
                write!(f, "ReturnEvent:     {tid}\t{inst}\t{callee:#x}")
            }
            Event::Syscall { tid } => write!(f, "SyscallEvent:    {tid}"),
            Event::Argument { tid, ptr } => write!(f, "ArgumentEvent:   {tid}\t{ptr:#x}"),
            Event::Memset { tid, inst, addr, len } => {
                write!(f, "MemsetEvent:     {tid}\t{inst}\t{addr:#x}\t{len}")
            }
            Event::Memmove { tid, inst, dst, src, len } => {
                write!(f, "MemmoveEvent:    {tid}\t{inst}\t{dst:#x}\t{src:#x}\t{len}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(event: Event) {
        let mut buf = Vec::new();
        event.encode_into(&mut buf);
        assert_eq!(buf.len(), event.wire_size());
        assert_eq!(buf[0], event.label());
        assert_eq!(buf[buf.len() - 1], event.label());
        let (decoded, size) = decode_record(&buf, 0).unwrap();
        assert_eq!(size, buf.len());
        assert_eq!(decoded, event);
    }

    #[test]
    fn record_encodings_roundtrip() {
        roundtrip(Event::BasicBlock { tid: 7, bb: 42 });
        roundtrip(Event::Memory { tid: 7, inst: 3, addr: 0xdead_beef, len: 8 });
        roundtrip(Event::Call { tid: 1, callee: 0x4000_1000 });
        roundtrip(Event::Return { tid: 1, inst: 9, callee: 0x4000_1000 });
        roundtrip(Event::Syscall { tid: 2 });
        roundtrip(Event::Argument { tid: 2, ptr: 0x7fff_0000 });
        roundtrip(Event::Memset { tid: 3, inst: 11, addr: 0x1000, len: 256 });
        roundtrip(Event::Memmove { tid: 3, inst: 12, dst: 0x2000, src: 0x1000, len: 64 });
    }

    #[test]
    fn wire_sizes_match_the_format() {
        assert_eq!(Event::BasicBlock { tid: 0, bb: 0 }.wire_size(), 14);
        assert_eq!(Event::Memory { tid: 0, inst: 0, addr: 0, len: 0 }.wire_size(), 30);
        assert_eq!(Event::Call { tid: 0, callee: 0 }.wire_size(), 18);
        assert_eq!(Event::Return { tid: 0, inst: 0, callee: 0 }.wire_size(), 22);
        assert_eq!(Event::Syscall { tid: 0 }.wire_size(), 10);
        assert_eq!(Event::Argument { tid: 0, ptr: 0 }.wire_size(), 18);
        assert_eq!(Event::Memset { tid: 0, inst: 0, addr: 0, len: 0 }.wire_size(), 30);
        assert_eq!(
            Event::Memmove { tid: 0, inst: 0, dst: 0, src: 0, len: 0 }.wire_size(),
            38
        );
    }

    #[test]
    fn trailing_label_mismatch_is_detected() {
        let mut buf = Vec::new();
        Event::Syscall { tid: 5 }.encode_into(&mut buf);
        let last = buf.len() - 1;
        buf[last] = label::MEMORY;
        assert!(matches!(
            decode_record(&buf, 0),
            Err(RecordError::TrailingLabelMismatch { .. })
        ));
    }

    #[test]
    fn unknown_label_is_rejected() {
        assert!(matches!(
            decode_record(&[0x55, 0, 0], 0),
            Err(RecordError::UnknownLabel(0x55))
        ));
    }
}
