use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use slimmer_trace::{
    BlockKind, DynamicInst, InstKind, IntervalMap, Metadata, SmallestBlock, DOMAIN_END,
};

use crate::grouping::MemoryGroups;

/// Dynamic load-after-store edges: for each reading dynamic instruction,
/// the writers it observed. Counts use the backward convention (`0` is
/// the final execution of an instruction, `-1` the one before), matching
/// how the liveness pass numbers the trace.
pub struct MemoryDeps {
    pub deps: FxHashMap<DynamicInst, Vec<DynamicInst>>,
}

impl MemoryDeps {
    pub fn of(&self, reader: &DynamicInst) -> &[DynamicInst] {
        self.deps.get(reader).map(Vec::as_slice).unwrap_or(&[])
    }
}

struct Extractor<'a> {
    meta: &'a Metadata,
    groups: &'a MemoryGroups,
    last_writer: IntervalMap<DynamicInst>,
    counts: FxHashMap<(u64, u32), i64>,
    edges: FxHashMap<DynamicInst, BTreeSet<DynamicInst>>,
}

/// Forward pass over the smallest blocks computing, for every read, the
/// last dynamic instruction that wrote each byte of the read range.
///
/// External calls are treated conservatively: every byte of every group
/// reachable through a pointer argument is read and then overwritten by
/// the call, so anything the callee may have consumed or produced is
/// linked through it.
pub fn extract_memory_deps(
    meta: &Metadata,
    blocks: &[SmallestBlock],
    groups: &MemoryGroups,
) -> MemoryDeps {
    let mut extractor = Extractor {
        meta,
        groups,
        last_writer: IntervalMap::new(),
        counts: FxHashMap::default(),
        edges: FxHashMap::default(),
    };
    for block in blocks {
        extractor.handle_block(block);
    }
    extractor.finish()
}

impl Extractor<'_> {
    /// Number this execution of the block's instruction, counting forward.
    fn dynamic_inst(&mut self, block: &SmallestBlock) -> DynamicInst {
        let inst = self.meta.bb_instructions[block.bb as usize][block.start as usize];
        let count = self.counts.entry((block.tid, inst)).or_insert(0);
        let dyn_inst = DynamicInst::new(block.tid, inst, *count);
        *count += 1;
        dyn_inst
    }

    fn handle_block(&mut self, block: &SmallestBlock) {
        match &block.kind {
            BlockKind::MemoryAccess { lo, hi } => {
                let dyn_inst = self.dynamic_inst(block);
                if lo >= hi {
                    return; // Inefficacious write.
                }
                match self.meta.instructions[dyn_inst.inst as usize].kind {
                    InstKind::Store => self.last_writer.set(*lo, *hi, dyn_inst),
                    InstKind::Load => self.read(dyn_inst, *lo, *hi),
                    InstKind::Atomic => {
                        // A compare-and-swap both observes and replaces
                        // the location.
                        self.read(dyn_inst, *lo, *hi);
                        self.last_writer.set(*lo, *hi, dyn_inst);
                    }
                    _ => {}
                }
            }
            BlockKind::Memset { lo, hi } => {
                let dyn_inst = self.dynamic_inst(block);
                if lo >= hi {
                    return;
                }
                self.last_writer.set(*lo, *hi, dyn_inst);
            }
            BlockKind::Memmove { dst_lo, dst_hi, src_lo, src_hi } => {
                let dyn_inst = self.dynamic_inst(block);
                if dst_lo >= dst_hi {
                    return;
                }
                self.read(dyn_inst, *src_lo, *src_hi);
                self.last_writer.set(*dst_lo, *dst_hi, dyn_inst);
            }
            BlockKind::ExternalCall { ptr_args, .. } | BlockKind::ImpactfulCall { ptr_args, .. } => {
                let dyn_inst = self.dynamic_inst(block);
                let mut arg_groups = BTreeSet::new();
                for &arg in ptr_args {
                    if let Some(&group) = self.groups.addr2group.get(arg) {
                        arg_groups.insert(group);
                    }
                }
                for group in arg_groups {
                    let Some(membership) = self.groups.group2addr.get(&group) else {
                        continue;
                    };
                    for segment in membership.collect(0, DOMAIN_END) {
                        if segment.value.is_none() {
                            continue;
                        }
                        self.read(dyn_inst, segment.lo, segment.hi);
                        self.last_writer.set(segment.lo, segment.hi, dyn_inst);
                    }
                }
            }
            BlockKind::Normal | BlockKind::Declare { .. } => {}
        }
    }

    fn read(&mut self, reader: DynamicInst, lo: u64, hi: u64) {
        for segment in self.last_writer.collect(lo, hi) {
            if let Some(writer) = segment.value {
                if writer != reader {
                    self.edges.entry(reader).or_default().insert(writer);
                }
            }
        }
    }

    /// Renumber all counts into the backward convention so that the final
    /// execution of every instruction is count 0.
    fn finish(self) -> MemoryDeps {
        let normalize = |d: &DynamicInst, counts: &FxHashMap<(u64, u32), i64>| {
            let total = counts[&(d.tid, d.inst)];
            DynamicInst::new(d.tid, d.inst, d.count - (total - 1))
        };
        let mut deps = FxHashMap::default();
        for (reader, writers) in &self.edges {
            deps.insert(
                normalize(reader, &self.counts),
                writers.iter().map(|w| normalize(w, &self.counts)).collect(),
            );
        }
        MemoryDeps { deps }
    }
}
