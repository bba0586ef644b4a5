//! Shared data model for the slimmer analyzer.
//!
//! This crate owns everything that both the recording side and the offline
//! analysis pipeline need to agree on:
//!
//! - the trace event records and their wire encoding ([`Event`]),
//! - the framed, block-compressed trace codec ([`TraceReader`],
//!   [`TraceWriter`]),
//! - the interval map used for address bookkeeping ([`IntervalMap`]),
//! - the static per-instruction metadata emitted by the instrumentation
//!   pass ([`Metadata`]),
//! - the merged-trace building blocks ([`SmallestBlock`], [`DynamicInst`]).
//!
//! The analysis passes themselves live in the `slimmer` binary crate.

mod block;
mod dynamic;
mod event;
mod interval_map;
mod metadata;
mod reader;
mod writer;

pub use block::{BlockKind, EntryMark, ExitMark, SmallestBlock};
pub use dynamic::DynamicInst;
pub use event::{label, Event};
pub use interval_map::{IntervalMap, Segment, DOMAIN_END};
pub use metadata::{InstInfo, InstKind, Metadata, MetadataError, ValueRef};
pub use reader::{BackwardEvents, ForwardEvents, TraceError, TraceReader};
pub use writer::TraceWriter;

/// Decompressed size of every trace frame. Records never straddle a frame
/// boundary; the writer pads the tail of each payload with placeholder
/// bytes instead.
pub const FRAME_PAYLOAD_SIZE: usize = 32 << 20;
