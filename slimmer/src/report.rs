use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};

use log::debug;
use rustc_hash::FxHashMap;

use slimmer_trace::Metadata;

use crate::liveness::LivenessResult;
use crate::memdep::MemoryDeps;

/// Where the reporter gets source text from. The real loader reads files
/// off disk; tests substitute their own.
pub trait SourceLoader {
    /// The 1-based `line` of `path`, or `None` when the file or the line
    /// does not exist.
    fn line(&mut self, path: &str, line: u32) -> Option<String>;
}

/// Reads source files lazily and caches them by path. A file that cannot
/// be read stays cached as empty, so the report degrades to the IR view
/// for it.
#[derive(Default)]
pub struct FsSourceLoader {
    cache: FxHashMap<String, Vec<String>>,
}

impl SourceLoader for FsSourceLoader {
    fn line(&mut self, path: &str, line: u32) -> Option<String> {
        let lines = self.cache.entry(path.to_owned()).or_insert_with(|| {
            match std::fs::read_to_string(path) {
                Ok(text) => text.lines().map(str::to_owned).collect(),
                Err(err) => {
                    debug!("cannot read source file {path}: {err}");
                    Vec::new()
                }
            }
        });
        if line == 0 {
            return None;
        }
        lines.get(line as usize - 1).cloned()
    }
}

/// Group the unneeded dynamic instructions into clusters and render the
/// report.
///
/// The cluster graph connects static instructions (restricted to those
/// with at least one unneeded execution) whose exact paired executions
/// were SSA-related and both unneeded, that form an unneeded memory
/// dependency, or that wrote the same unneeded address. Components are
/// emitted in ascending instruction order, so the same inputs always
/// print the same bytes.
pub fn print_bugs(
    meta: &Metadata,
    liveness: &LivenessResult,
    mem_deps: &MemoryDeps,
    loader: &mut dyn SourceLoader,
    out: &mut dyn Write,
) -> io::Result<()> {
    // Unneeded executions per static instruction.
    let mut inst_count: BTreeMap<u32, u32> = BTreeMap::new();
    for dyn_inst in &liveness.unneeded {
        *inst_count.entry(dyn_inst.inst).or_insert(0) += 1;
    }

    let mut adjacency: FxHashMap<u32, BTreeSet<u32>> = FxHashMap::default();
    let mut connect = |adjacency: &mut FxHashMap<u32, BTreeSet<u32>>, a: u32, b: u32| {
        if a != b {
            adjacency.entry(a).or_default().insert(b);
            adjacency.entry(b).or_default().insert(a);
        }
    };

    // SSA and phi edges discovered during the backward walk. The static
    // dependency shape alone is too coarse: a producer with both needed
    // and unneeded executions must only link to the consumers of its
    // unneeded ones, so the walk records the exact pairs.
    for &(a, b) in &liveness.ssa_edges {
        connect(&mut adjacency, a, b);
    }
    // Memory-dependency edges where both endpoints went unneeded.
    for (reader, writers) in &mem_deps.deps {
        if !liveness.unneeded.contains(reader) {
            continue;
        }
        for writer in writers {
            if liveness.unneeded.contains(writer) {
                connect(&mut adjacency, reader.inst, writer.inst);
            }
        }
    }
    // Instructions that wrote the same unneeded address.
    for ids in liveness.addr2unneeded.values() {
        let mut iter = ids.iter();
        if let Some(&first) = iter.next() {
            for &other in iter {
                connect(&mut adjacency, first, other);
            }
        }
    }

    let mut printed: BTreeSet<u32> = BTreeSet::new();
    let mut bug_index = 0u32;
    for &seed in inst_count.keys() {
        if printed.contains(&seed) {
            continue;
        }
        // Collect the connected component, restricted to unneeded
        // instructions.
        let mut component: BTreeSet<u32> = BTreeSet::new();
        let mut stack = vec![seed];
        while let Some(id) = stack.pop() {
            if !component.insert(id) {
                continue;
            }
            if let Some(neighbors) = adjacency.get(&id) {
                for &next in neighbors {
                    if inst_count.contains_key(&next) && !component.contains(&next) {
                        stack.push(next);
                    }
                }
            }
        }
        printed.extend(component.iter().copied());

        bug_index += 1;
        writeln!(out, "===============")?;
        writeln!(out, "Bug {bug_index}")?;
        writeln!(out, "===============")?;
        writeln!(out)?;
        writeln!(out, "------IR------")?;
        for &id in &component {
            let count = inst_count[&id];
            let ir = meta.instructions[id as usize].ir.as_deref().unwrap_or("[UNKNOWN]");
            writeln!(out, "({count:4})\t{id}:\t{ir}")?;
        }

        writeln!(out)?;
        writeln!(out, "------Related Code------")?;
        // Source lines referenced by this component, with context.
        let mut used_lines: BTreeMap<&str, BTreeSet<u32>> = BTreeMap::new();
        let mut line_counts: FxHashMap<(&str, u32), u32> = FxHashMap::default();
        for &id in &component {
            let info = &meta.instructions[id as usize];
            let Some(file) = info.file.as_deref() else {
                continue;
            };
            let lines = used_lines.entry(file).or_default();
            for delta in -3i64..=3 {
                let line = info.line as i64 + delta;
                if line > 0 {
                    lines.insert(line as u32);
                }
            }
            *line_counts.entry((file, info.line)).or_insert(0) += inst_count[&id];
        }

        for (file, lines) in used_lines {
            writeln!(out)?;
            writeln!(out, "{file}")?;
            let mut previous = None;
            for &line in &lines {
                if previous.is_some_and(|p| p + 1 != line) {
                    writeln!(out)?;
                }
                if let Some(text) = loader.line(file, line).filter(|t| !t.is_empty()) {
                    match line_counts.get(&(file, line)) {
                        Some(count) => writeln!(out, "({count:4})\t{line}:\t{text}")?,
                        None => writeln!(out, "      \t{line}:\t{text}")?,
                    }
                }
                previous = Some(line);
            }
        }
    }
    Ok(())
}
