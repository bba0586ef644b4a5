use std::collections::BTreeSet;

use rustc_hash::{FxHashMap, FxHashSet};

use slimmer_trace::{
    BlockKind, DynamicInst, EntryMark, ExitMark, InstKind, Metadata, SmallestBlock, ValueRef,
};

use crate::memdep::MemoryDeps;

/// External calls that may be elided without changing observable output,
/// whatever the trace says about them.
const NEVER_NEEDED_CALLS: &[&str] = &["free", "va_start", "va_end"];

/// What the backward walk produced: the dynamic instructions whose
/// effects never reached an impactful call, the SSA/phi producer-consumer
/// pairs whose exact paired executions were both unneeded, and an index
/// from written first-address to the unneeded writers of that address
/// (the latter two stitch report clusters together).
pub struct LivenessResult {
    pub unneeded: FxHashSet<DynamicInst>,
    /// Undirected `(smaller id, larger id)` pairs recorded when an
    /// unneeded execution consumed a value from an execution that was
    /// itself unneeded. Purely static SSA shape is not enough: when a
    /// producer has both needed and unneeded executions, only the
    /// consumers of its unneeded ones belong in the same cluster.
    pub ssa_edges: FxHashSet<(u32, u32)>,
    pub addr2unneeded: FxHashMap<u64, BTreeSet<u32>>,
}

fn ordered_pair(a: u32, b: u32) -> (u32, u32) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Per-activation liveness state. One of these per live frame on each
/// thread's stack; pushed when the reverse walk crosses the activation's
/// exit marker and popped at its entry marker.
struct FrameState {
    /// Whether any instruction of this activation was needed. Decides at
    /// the entry marker whether the caller's call site becomes needed.
    fun_used: bool,
    /// The basic block the walk most recently left (the dynamic successor
    /// of the block being processed), with its accumulated neededness.
    next_bb: u32,
    next_bb_used: bool,
}

struct Analyzer<'a> {
    meta: &'a Metadata,
    mem_deps: &'a MemoryDeps,
    pdom: &'a FxHashMap<u32, FxHashSet<u32>>,
    /// Static `(tid, inst)` pairs whose most recent (not yet seen)
    /// execution is needed.
    needed: FxHashSet<(u64, u32)>,
    /// Dynamic instructions whose memory effects a later needed
    /// instruction consumed.
    mem_depended: FxHashSet<DynamicInst>,
    /// Executions seen so far per instruction; the backward count is the
    /// negation.
    counts: FxHashMap<(u64, u32), i64>,
    frames: FxHashMap<u64, Vec<FrameState>>,
    unneeded: FxHashSet<DynamicInst>,
    /// Unneeded consumers waiting for the producer execution their SSA or
    /// phi operand resolves to: the next earlier execution of the keyed
    /// static instruction. Consumed (and either turned into edges or
    /// discarded) when that execution is visited.
    ssa_waiters: FxHashMap<(u64, u32), FxHashSet<u32>>,
    ssa_edges: FxHashSet<(u32, u32)>,
    addr2unneeded: FxHashMap<u64, BTreeSet<u32>>,
}

/// Walk the smallest blocks in reverse execution order, propagating
/// neededness backwards from impactful calls across SSA, phi, memory,
/// control-dependence and call-return edges. Whatever is never reached is
/// unneeded: it could have been elided from this run without changing
/// any observable behavior.
pub fn analyze_liveness(
    meta: &Metadata,
    blocks: &[SmallestBlock],
    mem_deps: &MemoryDeps,
    pdom: &FxHashMap<u32, FxHashSet<u32>>,
) -> LivenessResult {
    let mut analyzer = Analyzer {
        meta,
        mem_deps,
        pdom,
        needed: FxHashSet::default(),
        mem_depended: FxHashSet::default(),
        counts: FxHashMap::default(),
        frames: FxHashMap::default(),
        unneeded: FxHashSet::default(),
        ssa_waiters: FxHashMap::default(),
        ssa_edges: FxHashSet::default(),
        addr2unneeded: FxHashMap::default(),
    };
    for block in blocks.iter().rev() {
        analyzer.handle_block(block);
    }
    LivenessResult {
        unneeded: analyzer.unneeded,
        ssa_edges: analyzer.ssa_edges,
        addr2unneeded: analyzer.addr2unneeded,
    }
}

impl Analyzer<'_> {
    fn handle_block(&mut self, block: &SmallestBlock) {
        let tid = block.tid;
        if block.exit != ExitMark::NotLast {
            self.frames.entry(tid).or_default().push(FrameState {
                fun_used: false,
                next_bb: block.bb,
                next_bb_used: false,
            });
        } else if self.frames.get(&tid).is_none_or(|f| f.is_empty()) {
            // A trace cut short in lenient mode can start mid-activation;
            // give it a frame so the walk can proceed.
            self.frames.entry(tid).or_default().push(FrameState {
                fun_used: false,
                next_bb: block.bb,
                next_bb_used: false,
            });
        }

        let mut this_bb_used = false;
        match &block.kind {
            BlockKind::ImpactfulCall { .. } => {
                let dyn_inst = self.dynamic_inst(block);
                self.process(true, false, dyn_inst, block.last_bb);
                self.top_frame(tid).fun_used = true;
                this_bb_used = true;
            }
            BlockKind::ExternalCall { .. }
            | BlockKind::MemoryAccess { .. }
            | BlockKind::Memset { .. }
            | BlockKind::Memmove { .. } => {
                let dyn_inst = self.dynamic_inst(block);
                let is_needed = self.needed.contains(&(tid, dyn_inst.inst))
                    || self.mem_depended.contains(&dyn_inst);
                let recorded = !is_needed && !self.is_exempt_call(block);
                self.process(is_needed, recorded, dyn_inst, block.last_bb);
                if recorded {
                    self.record_unneeded(dyn_inst, block);
                }
                self.top_frame(tid).fun_used |= is_needed;
                this_bb_used |= is_needed;
            }
            BlockKind::Normal => {
                let insts = &self.meta.bb_instructions[block.bb as usize];
                for index in (block.start..block.end).rev() {
                    let id = insts[index as usize];
                    let info = &self.meta.instructions[id as usize];
                    let dyn_inst = self.dynamic_inst_for(tid, id);
                    let mut is_needed = self.needed.contains(&(tid, id));
                    let mut record = true;

                    match info.kind {
                        InstKind::Terminator => {
                            let frame = self.top_frame(tid);
                            let (next_bb, next_used) = (frame.next_bb, frame.next_bb_used);
                            let post_dominated = self
                                .pdom
                                .get(&block.bb)
                                .is_some_and(|set| set.contains(&next_bb));
                            if !post_dominated
                                && info.successors.contains(&next_bb)
                                && next_used
                            {
                                is_needed = true;
                            }
                            // An unconditional branch carries no decision
                            // worth reporting.
                            record = info.successors.len() > 1;
                        }
                        InstKind::Return => {
                            if info.is_return_void() {
                                // Control only; nothing to elide.
                                continue;
                            }
                            match block.exit {
                                ExitMark::ThreadExit => {
                                    // The value escapes to the OS.
                                    is_needed = true;
                                }
                                ExitMark::FunctionExit { caller } => {
                                    is_needed |= self.needed.contains(&(tid, caller));
                                }
                                ExitMark::NotLast => {}
                            }
                        }
                        _ => {}
                    }

                    let recorded = !is_needed && record;
                    self.process(is_needed, recorded, dyn_inst, block.last_bb);
                    if recorded {
                        self.record_unneeded(dyn_inst, block);
                    }
                    self.top_frame(tid).fun_used |= is_needed;
                    this_bb_used |= is_needed;
                }
            }
            BlockKind::Declare { .. } => {}
        }

        let frame = self.top_frame(tid);
        if frame.next_bb != block.bb {
            frame.next_bb = block.bb;
            frame.next_bb_used = this_bb_used;
        } else {
            frame.next_bb_used |= this_bb_used;
        }

        if block.entry != EntryMark::NotFirst {
            let frame = self
                .frames
                .get_mut(&tid)
                .and_then(Vec::pop)
                .expect("entry marker without a frame");
            if let EntryMark::FunctionEntry { caller } = block.entry {
                if frame.fun_used {
                    self.needed.insert((tid, caller));
                }
            }
        }
    }

    /// Consume one dynamic instruction: clear its pending markers, turn
    /// the unneeded consumers waiting on this execution into report edges,
    /// and mark everything it depends on.
    ///
    /// `recorded` is true when this execution lands in the unneeded set.
    /// Only then do waiting consumers become edges, and only then does
    /// this instruction wait on its own producers in turn. A needed
    /// execution discards its waiters: those consumers took their value
    /// from an execution that had to happen anyway, so they are separate
    /// findings.
    fn process(
        &mut self,
        is_needed: bool,
        recorded: bool,
        dyn_inst: DynamicInst,
        last_bb: Option<u32>,
    ) {
        let tid = dyn_inst.tid;
        self.needed.remove(&(tid, dyn_inst.inst));
        self.mem_depended.remove(&dyn_inst);
        let waiters = self.ssa_waiters.remove(&(tid, dyn_inst.inst));
        if recorded {
            for consumer in waiters.into_iter().flatten() {
                if consumer != dyn_inst.inst {
                    self.ssa_edges.insert(ordered_pair(dyn_inst.inst, consumer));
                }
            }
        }

        let info = &self.meta.instructions[dyn_inst.inst as usize];
        for dep in &info.ssa_deps {
            if let ValueRef::Inst(dep_id) = dep {
                if is_needed {
                    self.needed.insert((tid, *dep_id));
                } else if recorded {
                    self.ssa_waiters
                        .entry((tid, *dep_id))
                        .or_default()
                        .insert(dyn_inst.inst);
                }
            }
        }
        if is_needed {
            for writer in self.mem_deps.of(&dyn_inst) {
                self.mem_depended.insert(*writer);
            }
        }
        // The phi edge taken this time is the one whose predecessor is
        // the basic block executed before this one.
        if let Some(last_bb) = last_bb {
            if let Some((_, value)) = info.phi_deps.iter().find(|(pred, _)| *pred == last_bb) {
                if let ValueRef::Inst(dep_id) = value {
                    if is_needed {
                        self.needed.insert((tid, *dep_id));
                    } else if recorded {
                        self.ssa_waiters
                            .entry((tid, *dep_id))
                            .or_default()
                            .insert(dyn_inst.inst);
                    }
                }
            }
        }
    }

    fn record_unneeded(&mut self, dyn_inst: DynamicInst, block: &SmallestBlock) {
        self.unneeded.insert(dyn_inst);
        let is_write = match block.kind {
            BlockKind::MemoryAccess { .. } => matches!(
                self.meta.instructions[dyn_inst.inst as usize].kind,
                InstKind::Store | InstKind::Atomic
            ),
            BlockKind::Memset { .. } | BlockKind::Memmove { .. } => true,
            _ => false,
        };
        if is_write {
            if let Some((lo, _)) = block.write_range() {
                self.addr2unneeded.entry(lo).or_default().insert(dyn_inst.inst);
            }
        }
    }

    /// `free` and the va-arg bookkeeping calls are exempt from being
    /// reported: eliding them never changes observable output.
    fn is_exempt_call(&self, block: &SmallestBlock) -> bool {
        let BlockKind::ExternalCall { .. } = block.kind else {
            return false;
        };
        let inst = self.meta.bb_instructions[block.bb as usize][block.start as usize];
        self.meta.instructions[inst as usize]
            .callee
            .as_deref()
            .is_some_and(|name| NEVER_NEEDED_CALLS.contains(&name))
    }

    fn dynamic_inst(&mut self, block: &SmallestBlock) -> DynamicInst {
        let inst = self.meta.bb_instructions[block.bb as usize][block.start as usize];
        self.dynamic_inst_for(block.tid, inst)
    }

    /// Number this execution backwards: the final execution is 0, the one
    /// before it -1, and so on, matching the normalized dependency table.
    fn dynamic_inst_for(&mut self, tid: u64, inst: u32) -> DynamicInst {
        let count = self.counts.entry((tid, inst)).or_insert(0);
        let dyn_inst = DynamicInst::new(tid, inst, -*count);
        *count += 1;
        dyn_inst
    }

    fn top_frame(&mut self, tid: u64) -> &mut FrameState {
        self.frames
            .get_mut(&tid)
            .and_then(|frames| frames.last_mut())
            .expect("every processed block sits inside an activation")
    }
}
