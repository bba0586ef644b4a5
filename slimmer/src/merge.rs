use std::collections::BTreeSet;

use log::warn;
use rustc_hash::FxHashMap;

use slimmer_trace::{
    BlockKind, EntryMark, Event, ExitMark, InstKind, Metadata, SmallestBlock, TraceReader,
};

use crate::error::{Error, Inconsistency};
use crate::impactful::ImpactfulCalls;

/// One entry of a thread's virtual call stack: the basic block being
/// replayed and the index of the next unconsumed instruction in it.
struct Frame {
    bb: u32,
    cursor: usize,
}

#[derive(Default)]
struct ThreadState {
    frames: Vec<Frame>,
    /// Current basic block, one entry per live activation.
    this_bb: Vec<u32>,
    /// Previously executed basic block, one entry per live activation.
    last_bb: Vec<Option<u32>>,
    /// Pointer arguments collected since the last external call.
    args: BTreeSet<u64>,
    /// Entry marker to attach to the next emitted block.
    entry: Option<EntryMark>,
    /// Set in lenient mode once this thread's events stopped making
    /// sense; the rest of the thread is dropped.
    dead: bool,
}

impl ThreadState {
    fn take_entry(&mut self) -> EntryMark {
        self.entry.take().unwrap_or(EntryMark::NotFirst)
    }

    fn current_last_bb(&self) -> Option<u32> {
        self.last_bb.last().copied().flatten()
    }
}

/// Reconstructs the smallest-block sequence from the compiler-level
/// stream.
///
/// The stream records every executed basic block, every memory access and
/// every external call's return. Replaying it against the static
/// instruction lists recovers the call structure: a basic-block event
/// either starts a thread, continues the current function, or is the
/// first block of an instrumented callee whose call site is the
/// just-consumed `Call` instruction.
pub struct Merger<'a> {
    meta: &'a Metadata,
    impactful: &'a ImpactfulCalls,
    lenient: bool,
    threads: FxHashMap<u64, ThreadState>,
    /// How many times `(tid, callee address)` has returned so far.
    invocations: FxHashMap<(u64, u64), u32>,
    blocks: Vec<SmallestBlock>,
}

/// Merge the whole compiler-level stream into the smallest-block trace.
pub fn merge_trace(
    meta: &Metadata,
    reader: &TraceReader,
    impactful: &ImpactfulCalls,
    lenient: bool,
) -> Result<Vec<SmallestBlock>, Error> {
    let mut merger = Merger {
        meta,
        impactful,
        lenient,
        threads: FxHashMap::default(),
        invocations: FxHashMap::default(),
        blocks: Vec::new(),
    };
    for event in reader.forward() {
        merger.handle_event(event?)?;
    }
    merger.flush()
}

impl Merger<'_> {
    fn handle_event(&mut self, event: Event) -> Result<(), Error> {
        let tid = event.tid();
        if self.threads.get(&tid).is_some_and(|t| t.dead) {
            return Ok(());
        }
        let result = self.dispatch(&event);
        match result {
            Ok(()) => Ok(()),
            Err(inconsistency) if self.lenient => {
                warn!("dropping thread {tid} after inconsistency: {inconsistency}");
                self.threads.entry(tid).or_default().dead = true;
                Ok(())
            }
            Err(inconsistency) => Err(inconsistency.into()),
        }
    }

    fn dispatch(&mut self, event: &Event) -> Result<(), Inconsistency> {
        match *event {
            Event::Argument { tid, ptr } => {
                self.threads.entry(tid).or_default().args.insert(ptr);
                Ok(())
            }
            Event::BasicBlock { tid, bb } => {
                self.on_basic_block(tid, bb)?;
                self.drain(tid)
            }
            Event::Memory { tid, inst, addr, len } => {
                let (bb, index) = self.consume_slot(tid, inst)?;
                let kind = BlockKind::MemoryAccess { lo: addr, hi: addr.wrapping_add(len) };
                self.emit_single(tid, bb, index, kind);
                self.drain(tid)
            }
            Event::Memset { tid, inst, addr, len } => {
                let (bb, index) = self.consume_slot(tid, inst)?;
                let kind = BlockKind::Memset { lo: addr, hi: addr.wrapping_add(len) };
                self.emit_single(tid, bb, index, kind);
                self.drain(tid)
            }
            Event::Memmove { tid, inst, dst, src, len } => {
                let (bb, index) = self.consume_slot(tid, inst)?;
                let kind = BlockKind::Memmove {
                    dst_lo: dst,
                    dst_hi: dst.wrapping_add(len),
                    src_lo: src,
                    src_hi: src.wrapping_add(len),
                };
                self.emit_single(tid, bb, index, kind);
                self.drain(tid)
            }
            Event::Return { tid, inst, callee } => {
                let (bb, index) = self.consume_slot(tid, inst)?;
                let invocation = {
                    let counter = self.invocations.entry((tid, callee)).or_insert(0);
                    let current = *counter;
                    *counter += 1;
                    current
                };
                let callee_name = self.meta.instructions[inst as usize].callee.as_deref();
                let ptr_args: Vec<u64> = {
                    let state = self.threads.get_mut(&tid).expect("slot was just consumed");
                    std::mem::take(&mut state.args).into_iter().collect()
                };
                let kind = if self
                    .impactful
                    .is_impactful(tid, callee, invocation, callee_name)
                {
                    BlockKind::ImpactfulCall { callee, ptr_args }
                } else {
                    BlockKind::ExternalCall { callee, ptr_args }
                };
                self.emit_single(tid, bb, index, kind);
                self.drain(tid)
            }
            Event::Call { .. } | Event::Syscall { .. } => {
                warn!("unexpected {event} in the compiler stream");
                Ok(())
            }
        }
    }

    fn on_basic_block(&mut self, tid: u64, bb: u32) -> Result<(), Inconsistency> {
        if self.meta.bb_insts(bb).is_none() {
            return Err(Inconsistency::UnknownBasicBlock { bb });
        }
        let state = self.threads.entry(tid).or_default();
        match state.frames.last() {
            None => {
                // First basic block of a thread.
                state.entry = Some(EntryMark::ThreadEntry);
                state.this_bb.push(bb);
                state.last_bb.push(None);
            }
            Some(top) if top.cursor >= self.meta.bb_instructions[top.bb as usize].len() => {
                // The previous basic block of this function is exhausted;
                // control moved on within the same activation.
                state.frames.pop();
                state.entry = Some(EntryMark::NotFirst);
                let this = state.this_bb.last_mut().expect("one entry per activation");
                *state.last_bb.last_mut().expect("one entry per activation") = Some(*this);
                *this = bb;
            }
            Some(top) => {
                // Mid-block: the just-consumed call transferred control
                // into an instrumented callee.
                let call_index = top
                    .cursor
                    .checked_sub(1)
                    .ok_or(Inconsistency::MissingCallSite { tid, bb: top.bb })?;
                let caller = self.meta.bb_instructions[top.bb as usize][call_index];
                if self.meta.instructions[caller as usize].kind != InstKind::Call {
                    return Err(Inconsistency::CallerNotCall { bb: top.bb, caller });
                }
                state.entry = Some(EntryMark::FunctionEntry { caller });
                state.this_bb.push(bb);
                state.last_bb.push(None);
            }
        }
        state.frames.push(Frame { bb, cursor: 0 });
        Ok(())
    }

    /// Advance the top frame over the instruction the event reports,
    /// checking that trace and metadata agree on which one that is.
    fn consume_slot(&mut self, tid: u64, inst: u32) -> Result<(u32, u32), Inconsistency> {
        let state = self
            .threads
            .get_mut(&tid)
            .filter(|s| !s.frames.is_empty())
            .ok_or(Inconsistency::NoActiveFrame { tid })?;
        let top = state.frames.last_mut().expect("checked non-empty");
        let insts = &self.meta.bb_instructions[top.bb as usize];
        let expected = *insts
            .get(top.cursor)
            .ok_or(Inconsistency::EventPastBlockEnd { tid, bb: top.bb, found: inst })?;
        if expected != inst {
            return Err(Inconsistency::CursorMismatch { tid, bb: top.bb, expected, found: inst });
        }
        top.cursor += 1;
        Ok((top.bb, (top.cursor - 1) as u32))
    }

    fn emit_single(&mut self, tid: u64, bb: u32, index: u32, kind: BlockKind) {
        let state = self.threads.get_mut(&tid).expect("slot was just consumed");
        let entry = state.take_entry();
        let last_bb = state.current_last_bb();
        self.blocks.push(SmallestBlock {
            kind,
            tid,
            bb,
            start: index,
            end: index + 1,
            entry,
            exit: ExitMark::NotLast,
            last_bb,
        });
    }

    /// Emit `Normal` blocks for the top frame until it waits on the next
    /// event. A run stops before calls, loads, stores and atomics; a
    /// non-intrinsic internal call is included in the run because the
    /// callee's basic-block event comes next. A run that finishes a
    /// `Return`-terminated basic block ends the activation.
    fn drain(&mut self, tid: u64) -> Result<(), Inconsistency> {
        loop {
            let state = self.threads.get_mut(&tid).expect("drained after an event");
            let Some(top) = state.frames.last_mut() else {
                return Ok(());
            };
            let insts = &self.meta.bb_instructions[top.bb as usize];
            let start = top.cursor;
            let mut end = start;
            while end < insts.len() {
                let info = &self.meta.instructions[insts[end] as usize];
                match info.kind {
                    InstKind::Call
                    | InstKind::ExternalCall
                    | InstKind::Load
                    | InstKind::Store
                    | InstKind::Atomic => break,
                    _ => end += 1,
                }
            }
            if end < insts.len() {
                let info = &self.meta.instructions[insts[end] as usize];
                let intrinsic = info.callee.as_deref().is_some_and(|n| n.starts_with("llvm."));
                if info.kind == InstKind::Call && !intrinsic {
                    end += 1;
                }
            }
            top.cursor = end;
            if end == start {
                return Ok(());
            }

            let bb = top.bb;
            let ends_activation = end == insts.len()
                && insts
                    .last()
                    .is_some_and(|&last| self.meta.instructions[last as usize].kind == InstKind::Return);

            let entry = state.take_entry();
            let last_bb = state.current_last_bb();
            let mut block = SmallestBlock {
                kind: BlockKind::Normal,
                tid,
                bb,
                start: start as u32,
                end: end as u32,
                entry,
                exit: ExitMark::NotLast,
                last_bb,
            };
            if ends_activation {
                state.frames.pop();
                state.this_bb.pop();
                state.last_bb.pop();
                block.exit = self.exit_mark(tid)?;
            }
            self.blocks.push(block);
            if !ends_activation {
                return Ok(());
            }
        }
    }

    /// The exit marker for an activation that just ended on `tid`, looking
    /// at the caller's frame left on the stack.
    fn exit_mark(&self, tid: u64) -> Result<ExitMark, Inconsistency> {
        let state = &self.threads[&tid];
        let Some(parent) = state.frames.last() else {
            return Ok(ExitMark::ThreadExit);
        };
        let call_index = parent
            .cursor
            .checked_sub(1)
            .ok_or(Inconsistency::MissingCallSite { tid, bb: parent.bb })?;
        let caller = self.meta.bb_instructions[parent.bb as usize][call_index];
        if self.meta.instructions[caller as usize].kind != InstKind::Call {
            return Err(Inconsistency::CallerNotCall { bb: parent.bb, caller });
        }
        Ok(ExitMark::FunctionExit { caller })
    }

    /// The stream may end while threads still have live activations (the
    /// program was killed, or recording stopped early). Close every frame
    /// with an empty block so the exit markers stay balanced.
    fn flush(mut self) -> Result<Vec<SmallestBlock>, Error> {
        let mut tids: Vec<u64> = self.threads.keys().copied().collect();
        tids.sort_unstable();
        for tid in tids {
            if self.threads[&tid].dead {
                continue;
            }
            loop {
                let state = self.threads.get_mut(&tid).expect("listed above");
                let Some(frame) = state.frames.pop() else {
                    break;
                };
                let entry = state.take_entry();
                let last_bb = state.current_last_bb();
                state.this_bb.pop();
                state.last_bb.pop();
                let exit = match self.exit_mark(tid) {
                    Ok(exit) => exit,
                    Err(inconsistency) if self.lenient => {
                        warn!("dropping thread {tid} during flush: {inconsistency}");
                        break;
                    }
                    Err(inconsistency) => return Err(inconsistency.into()),
                };
                self.blocks.push(SmallestBlock {
                    kind: BlockKind::Normal,
                    tid,
                    bb: frame.bb,
                    start: frame.cursor as u32,
                    end: frame.cursor as u32,
                    entry,
                    exit,
                    last_bb,
                });
            }
        }
        Ok(self.blocks)
    }
}
