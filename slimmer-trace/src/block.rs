use std::fmt::Write as _;

use crate::metadata::Metadata;

/// What a smallest block does, with the addresses it touches.
///
/// Address ranges are half-open. For external calls, `ptr_args` holds the
/// deduplicated pointer arguments collected from `Argument` events before
/// the call returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    /// A run of instructions with no memory access and no external call.
    Normal,
    /// A single load, store or atomic access.
    MemoryAccess { lo: u64, hi: u64 },
    /// An external call whose side effects did not reach the outside.
    ExternalCall { callee: u64, ptr_args: Vec<u64> },
    /// An external call during which a side-effecting syscall executed.
    ImpactfulCall { callee: u64, ptr_args: Vec<u64> },
    Memset { lo: u64, hi: u64 },
    Memmove { dst_lo: u64, dst_hi: u64, src_lo: u64, src_hi: u64 },
    /// Synthetic block that seeds an address range into the group map.
    Declare { lo: u64, hi: u64 },
}

/// Position of a smallest block at the start of an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMark {
    NotFirst,
    /// First block of a called function; `caller` is the call-site
    /// instruction in the parent frame.
    FunctionEntry { caller: u32 },
    /// First block of a thread.
    ThreadEntry,
}

/// Position of a smallest block at the end of an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitMark {
    NotLast,
    /// Last block of a called function; `caller` is the call-site
    /// instruction in the parent frame.
    FunctionExit { caller: u32 },
    /// Last block of a thread.
    ThreadExit,
}

/// The atomic unit of the analysis: a maximal contiguous prefix of a basic
/// block's instruction sequence that always executes as a unit.
///
/// `start..end` index into the owning basic block's instruction list.
/// `last_bb` is the basic block executed before this one on the same
/// thread within the same activation, used to select phi edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmallestBlock {
    pub kind: BlockKind,
    pub tid: u64,
    pub bb: u32,
    pub start: u32,
    pub end: u32,
    pub entry: EntryMark,
    pub exit: ExitMark,
    pub last_bb: Option<u32>,
}

impl SmallestBlock {
    /// The address range written by this block, if it writes memory.
    pub fn write_range(&self) -> Option<(u64, u64)> {
        match self.kind {
            BlockKind::Memset { lo, hi } => Some((lo, hi)),
            BlockKind::Memmove { dst_lo, dst_hi, .. } => Some((dst_lo, dst_hi)),
            BlockKind::MemoryAccess { lo, hi } => Some((lo, hi)),
            _ => None,
        }
    }

    /// Human-readable rendering of the block with the IR of the
    /// instructions it covers, for trace debugging.
    pub fn describe(&self, meta: &Metadata) -> String {
        let mut out = String::new();
        let name = match &self.kind {
            BlockKind::Normal => "NormalBlock",
            BlockKind::MemoryAccess { .. } => "MemoryAccessBlock",
            BlockKind::ExternalCall { .. } => "ExternalCallBlock",
            BlockKind::ImpactfulCall { .. } => "ImpactfulCallBlock",
            BlockKind::Memset { .. } => "MemsetBlock",
            BlockKind::Memmove { .. } => "MemmoveBlock",
            BlockKind::Declare { .. } => "DeclareBlock",
        };
        let _ = writeln!(out, "[Thread {}] {}", self.tid, name);
        let _ = writeln!(
            out,
            "\t<BB {}, Index {}> -> <BB {}, Index {}>",
            self.bb, self.start, self.bb, self.end
        );
        match &self.kind {
            BlockKind::MemoryAccess { lo, hi }
            | BlockKind::Memset { lo, hi }
            | BlockKind::Declare { lo, hi } => {
                let _ = writeln!(out, "\tAddress [{lo:#x}, {hi:#x})");
            }
            BlockKind::Memmove { dst_lo, dst_hi, src_lo, src_hi } => {
                let _ = writeln!(
                    out,
                    "\tAddress [{dst_lo:#x}, {dst_hi:#x}) [{src_lo:#x}, {src_hi:#x})"
                );
            }
            BlockKind::ExternalCall { callee, ptr_args }
            | BlockKind::ImpactfulCall { callee, ptr_args } => {
                let _ = write!(out, "\tCallee {callee:#x} Args");
                for arg in ptr_args {
                    let _ = write!(out, " {arg:#x}");
                }
                let _ = writeln!(out);
            }
            BlockKind::Normal => {}
        }
        let _ = writeln!(out, "\tEntry {:?} Exit {:?}", self.entry, self.exit);
        match self.last_bb {
            Some(bb) => {
                let _ = writeln!(out, "\tLast BB {bb}");
            }
            None => {
                let _ = writeln!(out, "\tLast BB -");
            }
        }
        if let Some(insts) = meta.bb_insts(self.bb) {
            for &id in insts
                .iter()
                .skip(self.start as usize)
                .take((self.end - self.start) as usize)
            {
                if let Some(info) = meta.instruction(id) {
                    let ir = info.ir.as_deref().unwrap_or("[UNKNOWN]");
                    let _ = writeln!(out, "\t{id}: {ir}");
                }
            }
        }
        out
    }
}
