//! Builders for synthetic metadata and traces used across the pass tests.

use std::path::PathBuf;

use rustc_hash::{FxHashMap, FxHashSet};
use tempfile::TempDir;

use slimmer_trace::{Event, InstInfo, InstKind, Metadata, TraceWriter, ValueRef};

pub fn inst(id: u32, bb: u32, kind: InstKind) -> InstInfo {
    InstInfo {
        id,
        bb,
        is_pointer: false,
        line: 0,
        file: None,
        ir: None,
        ssa_deps: Vec::new(),
        kind,
        callee: None,
        successors: Vec::new(),
        phi_deps: Vec::new(),
    }
}

pub fn call(id: u32, bb: u32, callee: &str) -> InstInfo {
    let mut info = inst(id, bb, InstKind::Call);
    info.callee = Some(callee.to_owned());
    info
}

pub fn external_call(id: u32, bb: u32, callee: &str, deps: Vec<ValueRef>) -> InstInfo {
    let mut info = inst(id, bb, InstKind::ExternalCall);
    info.callee = Some(callee.to_owned());
    info.ssa_deps = deps;
    info
}

pub fn terminator(id: u32, bb: u32, successors: &[u32]) -> InstInfo {
    let mut info = inst(id, bb, InstKind::Terminator);
    info.successors = successors.to_vec();
    info
}

pub fn ret(id: u32, bb: u32, deps: Vec<ValueRef>) -> InstInfo {
    let mut info = inst(id, bb, InstKind::Return);
    info.ir = Some("  ret i32 %r".to_owned());
    info.ssa_deps = deps;
    info
}

pub fn ret_void(id: u32, bb: u32) -> InstInfo {
    let mut info = inst(id, bb, InstKind::Return);
    info.ir = Some("  ret void".to_owned());
    info
}

/// Assemble a [`Metadata`] from an instruction list (ids must be dense and
/// grouped the way the loader would produce them) and a successor edge
/// list.
pub fn meta(instructions: Vec<InstInfo>, edges: &[(u32, u32)]) -> Metadata {
    let mut bb_instructions: Vec<Vec<u32>> = Vec::new();
    for (index, info) in instructions.iter().enumerate() {
        assert_eq!(index as u32, info.id, "test metadata ids must be dense");
        if info.bb as usize >= bb_instructions.len() {
            bb_instructions.resize(info.bb as usize + 1, Vec::new());
        }
        bb_instructions[info.bb as usize].push(info.id);
    }
    let mut bb_successors: FxHashMap<u32, Vec<u32>> = FxHashMap::default();
    for &(from, to) in edges {
        bb_successors.entry(from).or_default().push(to);
    }
    Metadata {
        instructions,
        bb_instructions,
        bb_successors,
        instrumented: FxHashSet::default(),
    }
}

/// Write `events` through the real codec into a fresh temp file.
pub fn write_trace(events: &[Event]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace");
    let mut writer = TraceWriter::create(&path).unwrap();
    for event in events {
        writer.write_event(event).unwrap();
    }
    writer.finish().unwrap();
    (dir, path)
}
