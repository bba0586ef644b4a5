use thiserror::Error;

use slimmer_trace::{MetadataError, TraceError};

/// A mismatch between the recorded streams and the static metadata, or
/// between the two streams themselves. These indicate a broken recording
/// (or the wrong info directory), not a broken analyzer.
#[derive(Debug, Error)]
pub enum Inconsistency {
    #[error(
        "thread {tid}: return from {found:#x} but the call stack top is {expected:#x} \
         (syscall stream out of balance)"
    )]
    UnbalancedReturn { tid: u64, expected: u64, found: u64 },
    #[error("thread {tid}: return from {callee:#x} with an empty call stack")]
    ReturnOnEmptyStack { tid: u64, callee: u64 },
    #[error("basic block {bb} is not in the static metadata")]
    UnknownBasicBlock { bb: u32 },
    #[error(
        "thread {tid}: trace carries instruction {found} where basic block {bb} \
         expects instruction {expected}"
    )]
    CursorMismatch {
        tid: u64,
        bb: u32,
        expected: u32,
        found: u32,
    },
    #[error("thread {tid}: event for an empty call stack (missing basic-block event?)")]
    NoActiveFrame { tid: u64 },
    #[error(
        "thread {tid}: event for instruction {found} but basic block {bb} is already exhausted"
    )]
    EventPastBlockEnd { tid: u64, bb: u32, found: u32 },
    #[error("thread {tid}: entered a callee from basic block {bb} before any call was consumed")]
    MissingCallSite { tid: u64, bb: u32 },
    #[error("function entry at basic block {bb}: call site {caller} is not a call instruction")]
    CallerNotCall { bb: u32, caller: u32 },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("trace inconsistency: {0}")]
    Inconsistency(#[from] Inconsistency),
    #[error(
        "memory budget exceeded: {what} holds {count} nodes (limit {limit}); \
         the trace is too large for this machine"
    )]
    MemoryBudget {
        what: &'static str,
        count: usize,
        limit: usize,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
