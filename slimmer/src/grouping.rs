use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use slimmer_trace::{
    BlockKind, EntryMark, IntervalMap, Metadata, SmallestBlock, ValueRef, DOMAIN_END,
};

/// Key for the instruction-to-group tables. Pointer-valued function
/// arguments have no instruction id of their own, so they get a tag
/// instead of borrowing the tail of the id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PointerKey {
    Inst(u32),
    Arg(u32),
}

/// The pointer-provenance result handed to the memory-dependency pass:
/// which group every byte belongs to, and the byte membership of each
/// group.
pub struct MemoryGroups {
    pub addr2group: IntervalMap<u32>,
    pub group2addr: FxHashMap<u32, IntervalMap<()>>,
}

impl MemoryGroups {
    /// Live interval-map nodes across both directions of the mapping.
    pub fn node_count(&self) -> usize {
        self.addr2group.node_count()
            + self.group2addr.values().map(IntervalMap::node_count).sum::<usize>()
    }
}

struct Grouper<'a> {
    meta: &'a Metadata,
    addr2group: IntervalMap<u32>,
    group2addr: FxHashMap<u32, IntervalMap<()>>,
    inst2group: FxHashMap<(u64, PointerKey), u32>,
    group2inst: FxHashMap<u32, BTreeSet<(u64, PointerKey)>>,
    next_group: u32,
    /// Pointer-argument keys labelled during the current activation of
    /// each thread, to be mapped back at the activation's entry block.
    labeled_args: FxHashMap<u64, BTreeSet<u32>>,
}

/// Assign a pointer-provenance group to every byte touched by the trace.
///
/// The pass runs over the smallest blocks in reverse execution order, so
/// an address is first seen at its last use and every earlier producer of
/// the same pointer gets merged into the group the later uses already
/// settled on. Group ids attached to an instruction only ever decrease:
/// a merge survives at the smallest id of its inputs.
pub fn group_memory(meta: &Metadata, blocks: &[SmallestBlock]) -> MemoryGroups {
    let mut grouper = Grouper {
        meta,
        addr2group: IntervalMap::new(),
        group2addr: FxHashMap::default(),
        inst2group: FxHashMap::default(),
        group2inst: FxHashMap::default(),
        next_group: 0,
        labeled_args: FxHashMap::default(),
    };
    for block in blocks.iter().rev() {
        grouper.handle_block(block);
    }
    MemoryGroups {
        addr2group: grouper.addr2group,
        group2addr: grouper.group2addr,
    }
}

impl Grouper<'_> {
    fn handle_block(&mut self, block: &SmallestBlock) {
        match &block.kind {
            BlockKind::MemoryAccess { lo, hi } | BlockKind::Memset { lo, hi } => {
                if lo < hi {
                    self.group_access(block, &[(*lo, *hi)]);
                }
            }
            BlockKind::Memmove { dst_lo, dst_hi, src_lo, src_hi } => {
                if dst_lo < dst_hi {
                    self.group_access(block, &[(*dst_lo, *dst_hi), (*src_lo, *src_hi)]);
                }
            }
            BlockKind::Declare { lo, hi } => {
                let mut should_merge = BTreeSet::new();
                let unassigned = self.collect_groups(&[(*lo, *hi)], &mut should_merge);
                let group = self.merge(should_merge);
                self.assign_ranges(group, &unassigned);
            }
            BlockKind::ExternalCall { ptr_args, .. } | BlockKind::ImpactfulCall { ptr_args, .. } => {
                // Every argument pointer must land in some group so the
                // dependency pass can enumerate what the callee may touch.
                for &arg in ptr_args {
                    if self.addr2group.get(arg).is_none() {
                        let group = self.alloc_group();
                        self.assign_ranges(group, &[(arg, arg + 1)]);
                    }
                }
            }
            BlockKind::Normal => {
                let insts = &self.meta.bb_instructions[block.bb as usize];
                for index in (block.start..block.end).rev() {
                    let id = insts[index as usize];
                    let info = &self.meta.instructions[id as usize];
                    if !info.is_pointer || info.kind == slimmer_trace::InstKind::Call {
                        continue;
                    }
                    let should_merge = BTreeSet::new();
                    self.merge_inst(should_merge, block.tid, id);
                }
            }
        }

        if block.entry != EntryMark::NotFirst {
            self.on_activation_entry(block);
        }
    }

    /// A memory-touching block: every byte of its ranges plus the access
    /// instruction's pointer operands end up in one group.
    fn group_access(&mut self, block: &SmallestBlock, ranges: &[(u64, u64)]) {
        let mut should_merge = BTreeSet::new();
        let unassigned = self.collect_groups(ranges, &mut should_merge);
        let id = self.meta.bb_instructions[block.bb as usize][block.start as usize];
        let group = self.merge_inst(should_merge, block.tid, id);
        self.assign_ranges(group, &unassigned);
    }

    /// Gather the groups already covering `ranges` into `should_merge`;
    /// returns the still-unassigned sub-ranges.
    fn collect_groups(
        &self,
        ranges: &[(u64, u64)],
        should_merge: &mut BTreeSet<u32>,
    ) -> Vec<(u64, u64)> {
        let mut unassigned = Vec::new();
        for &(lo, hi) in ranges {
            for segment in self.addr2group.collect(lo, hi) {
                match segment.value {
                    Some(group) => {
                        should_merge.insert(group);
                    }
                    None => unassigned.push((segment.lo, segment.hi)),
                }
            }
        }
        unassigned
    }

    fn assign_ranges(&mut self, group: u32, ranges: &[(u64, u64)]) {
        let membership = self.group2addr.entry(group).or_default();
        for &(lo, hi) in ranges {
            membership.set(lo, hi, ());
            self.addr2group.set(lo, hi, group);
        }
    }

    fn alloc_group(&mut self) -> u32 {
        self.next_group += 1;
        self.group2addr.entry(self.next_group).or_default();
        self.next_group
    }

    /// Merge a set of groups; the smallest id survives. The losers'
    /// address ranges are replayed into the survivor's membership map and
    /// re-labelled in `addr2group`, and their instructions move over.
    fn merge(&mut self, groups: BTreeSet<u32>) -> u32 {
        let mut iter = groups.into_iter();
        let Some(survivor) = iter.next() else {
            return self.alloc_group();
        };
        for loser in iter {
            if let Some(membership) = self.group2addr.remove(&loser) {
                for segment in membership.collect(0, DOMAIN_END) {
                    if segment.value.is_some() {
                        self.assign_ranges(survivor, &[(segment.lo, segment.hi)]);
                    }
                }
            }
            if let Some(keys) = self.group2inst.remove(&loser) {
                for &key in &keys {
                    self.inst2group.insert(key, survivor);
                }
                self.group2inst.entry(survivor).or_default().extend(keys);
            }
        }
        survivor
    }

    /// Merge the groups of an instruction's result and of its
    /// pointer-typed operands, then move the labels: the result's group
    /// entry is cleared (this execution produced it, earlier code did
    /// not), and each pointer operand is labelled with the merged group.
    fn merge_inst(&mut self, mut should_merge: BTreeSet<u32>, tid: u64, id: u32) -> u32 {
        let result_key = (tid, PointerKey::Inst(id));
        if let Some(&group) = self.inst2group.get(&result_key) {
            should_merge.insert(group);
        }
        for dep in &self.meta.instructions[id as usize].ssa_deps {
            if let Some(key) = self.pointer_key(*dep) {
                if let Some(&group) = self.inst2group.get(&(tid, key)) {
                    should_merge.insert(group);
                }
            }
        }

        let group = self.merge(should_merge);

        if let Some(old) = self.inst2group.remove(&result_key) {
            if let Some(keys) = self.group2inst.get_mut(&old) {
                keys.remove(&result_key);
            }
        }
        let meta = self.meta;
        for &dep in &meta.instructions[id as usize].ssa_deps {
            if let Some(key) = self.pointer_key(dep) {
                if let PointerKey::Arg(index) = key {
                    self.labeled_args.entry(tid).or_default().insert(index);
                }
                self.attach(tid, key, group);
            }
        }
        group
    }

    /// An operand's key in the group tables, if it is pointer-typed.
    fn pointer_key(&self, dep: ValueRef) -> Option<PointerKey> {
        match dep {
            ValueRef::Inst(id) if self.meta.instructions[id as usize].is_pointer => {
                Some(PointerKey::Inst(id))
            }
            ValueRef::PointerArg(index) => Some(PointerKey::Arg(index)),
            _ => None,
        }
    }

    fn attach(&mut self, tid: u64, key: PointerKey, group: u32) {
        self.inst2group.insert((tid, key), group);
        self.group2inst.entry(group).or_default().insert((tid, key));
    }

    /// At the first block of an activation, pointer-argument labels made
    /// inside it are resolved: the group moves to the matching operand of
    /// the call site in the caller's frame (merging with whatever group
    /// that operand already has), or is dropped at a thread entry.
    fn on_activation_entry(&mut self, block: &SmallestBlock) {
        let tid = block.tid;
        let labeled = self.labeled_args.remove(&tid).unwrap_or_default();
        for index in labeled {
            let key = (tid, PointerKey::Arg(index));
            let Some(arg_group) = self.inst2group.remove(&key) else {
                continue;
            };
            if let Some(keys) = self.group2inst.get_mut(&arg_group) {
                keys.remove(&key);
            }

            let EntryMark::FunctionEntry { caller } = block.entry else {
                continue;
            };
            let Some(used_arg) = self.meta.instructions[caller as usize]
                .ssa_deps
                .get(index as usize)
                .copied()
            else {
                continue;
            };
            let Some(operand_key) = self.pointer_key(used_arg) else {
                continue;
            };

            let mut group = arg_group;
            if let Some(&existing) = self.inst2group.get(&(tid, operand_key)) {
                group = self.merge(BTreeSet::from([arg_group, existing]));
            }
            if let PointerKey::Arg(outer) = operand_key {
                self.labeled_args.entry(tid).or_default().insert(outer);
            }
            self.attach(tid, operand_key, group);
        }
    }
}
