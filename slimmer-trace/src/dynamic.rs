/// One specific execution of a static instruction.
///
/// `count` is the invocation index. Forward passes number executions
/// upwards from zero; the liveness pass numbers them downwards from the
/// final execution (`0, -1, -2, …`). The memory-dependency extractor
/// renumbers its output to the backward convention once its total counts
/// are known, so the two sides compare equal.
///
/// The derived ordering is lexicographic on `(tid, inst, count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DynamicInst {
    pub tid: u64,
    pub inst: u32,
    pub count: i64,
}

impl DynamicInst {
    pub fn new(tid: u64, inst: u32, count: i64) -> Self {
        DynamicInst { tid, inst, count }
    }
}
