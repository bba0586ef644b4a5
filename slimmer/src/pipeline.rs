use std::io::{self, Write};

use log::{debug, info};

use slimmer_trace::{Metadata, SmallestBlock, TraceReader};

use crate::cli::{DumpTraceArgs, PrintBugArgs};
use crate::error::Error;
use crate::grouping::group_memory;
use crate::impactful::{extract_impactful_calls, ImpactfulCalls};
use crate::liveness::analyze_liveness;
use crate::memdep::extract_memory_deps;
use crate::merge::merge_trace;
use crate::postdom::build_post_dominators;
use crate::report::{print_bugs, FsSourceLoader, SourceLoader};

/// Ceiling on live interval-map nodes. A trace that fragments the address
/// maps past this point would take the machine down long before the
/// analysis finishes, so it is reported instead.
const MEMORY_BUDGET_NODES: usize = 1 << 27;

pub fn run_print_bug(args: &PrintBugArgs) -> Result<(), Error> {
    let (meta, blocks) = load_and_merge(args)?;
    let stdout = io::stdout();
    let mut loader = FsSourceLoader::default();
    analyze_and_report(&meta, &blocks, &mut loader, &mut stdout.lock())
}

/// Shared front half of `print-bug` and `dump-blocks`: load the metadata,
/// classify impactful calls, merge the compiler stream.
fn load_and_merge(args: &PrintBugArgs) -> Result<(Metadata, Vec<SmallestBlock>), Error> {
    let meta = Metadata::load(&args.info_dir)?;
    info!(
        "loaded metadata: {} instructions over {} basic blocks",
        meta.instructions.len(),
        meta.bb_instructions.len()
    );

    let impactful = match &args.syscall_trace {
        Some(path) => {
            let reader = TraceReader::open(path)?;
            let set = extract_impactful_calls(&reader)?;
            info!("{} impactful activations in the syscall trace", set.len());
            ImpactfulCalls::Traced(set)
        }
        None => {
            info!("no syscall trace; falling back to the libc allow-list");
            ImpactfulCalls::AllowList
        }
    };

    let reader = TraceReader::open(&args.compiler_trace)?;
    let blocks = merge_trace(&meta, &reader, &impactful, args.lenient)?;
    info!("merged {} smallest blocks", blocks.len());
    Ok((meta, blocks))
}

/// The analysis half of the pipeline, from smallest blocks to the printed
/// report: group memory, extract dependencies, build post-dominators,
/// run liveness, cluster and print.
pub fn analyze_and_report(
    meta: &Metadata,
    blocks: &[SmallestBlock],
    loader: &mut dyn SourceLoader,
    out: &mut dyn Write,
) -> Result<(), Error> {
    let groups = group_memory(meta, blocks);
    check_budget("pointer-provenance maps", groups.node_count())?;

    let mem_deps = extract_memory_deps(meta, blocks, &groups);
    drop(groups);
    debug!("{} dynamic instructions carry memory dependencies", mem_deps.deps.len());

    let pdom = build_post_dominators(&meta.bb_successors);
    let liveness = analyze_liveness(meta, blocks, &mem_deps, &pdom);
    info!("{} unneeded dynamic instructions", liveness.unneeded.len());

    print_bugs(meta, &liveness, &mem_deps, loader, out)?;
    Ok(())
}

fn check_budget(what: &'static str, count: usize) -> Result<(), Error> {
    if count > MEMORY_BUDGET_NODES {
        return Err(Error::MemoryBudget {
            what,
            count,
            limit: MEMORY_BUDGET_NODES,
        });
    }
    Ok(())
}

pub fn dump_trace(args: &DumpTraceArgs) -> Result<(), Error> {
    let reader = TraceReader::open(&args.trace)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for event in reader.forward() {
        writeln!(out, "{}", event?)?;
    }
    Ok(())
}

pub fn dump_blocks(args: &PrintBugArgs) -> Result<(), Error> {
    let (meta, blocks) = load_and_merge(args)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for block in &blocks {
        out.write_all(block.describe(&meta).as_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::LivenessResult;
    use crate::testutil::{call, external_call, inst, meta, ret, ret_void, terminator, write_trace};
    use slimmer_trace::{DynamicInst, Event, InstKind, ValueRef};

    struct NoSource;

    impl SourceLoader for NoSource {
        fn line(&mut self, _path: &str, _line: u32) -> Option<String> {
            None
        }
    }

    /// Drive the whole pipeline through the real codec: write both
    /// streams, extract impactful calls, merge, analyze, print.
    fn run_pipeline(
        meta: &Metadata,
        compiler: &[Event],
        syscall: Option<&[Event]>,
    ) -> (LivenessResult, String) {
        let impactful = match syscall {
            Some(events) => {
                let (_dir, path) = write_trace(events);
                let reader = TraceReader::open(&path).unwrap();
                ImpactfulCalls::Traced(extract_impactful_calls(&reader).unwrap())
            }
            None => ImpactfulCalls::AllowList,
        };
        let (_dir, path) = write_trace(compiler);
        let reader = TraceReader::open(&path).unwrap();
        let blocks = merge_trace(meta, &reader, &impactful, false).unwrap();

        let groups = group_memory(meta, &blocks);
        let mem_deps = extract_memory_deps(meta, &blocks, &groups);
        let pdom = build_post_dominators(&meta.bb_successors);
        let liveness = analyze_liveness(meta, &blocks, &mem_deps, &pdom);

        let mut out = Vec::new();
        print_bugs(meta, &liveness, &mem_deps, &mut NoSource, &mut out).unwrap();
        (liveness, String::from_utf8(out).unwrap())
    }

    /// The standard syscall-side companion: one call into `callee` that
    /// executes a syscall and returns.
    fn impactful_call_trace(tid: u64, callee: u64) -> Vec<Event> {
        vec![
            Event::Call { tid, callee },
            Event::Syscall { tid },
            Event::Return { tid, inst: 0, callee },
        ]
    }

    /// E1: a store whose value is overwritten before anything reads it.
    /// bb0 runs twice (conditional back edge), storing to `p` each time;
    /// only the second store feeds the printf in bb1.
    #[test]
    fn dead_branch_store() {
        let p = 0x1000u64;
        let meta = meta(
            vec![
                inst(0, 0, InstKind::Store),
                terminator(1, 0, &[0, 1]),
                external_call(2, 1, "printf", Vec::new()),
                ret_void(3, 1),
            ],
            &[(0, 0), (0, 1)],
        );
        let compiler = vec![
            Event::BasicBlock { tid: 1, bb: 0 },
            Event::Memory { tid: 1, inst: 0, addr: p, len: 4 },
            Event::BasicBlock { tid: 1, bb: 0 },
            Event::Memory { tid: 1, inst: 0, addr: p, len: 4 },
            Event::BasicBlock { tid: 1, bb: 1 },
            Event::Argument { tid: 1, ptr: p },
            Event::Return { tid: 1, inst: 2, callee: 0xaa },
        ];
        let (live, report) = run_pipeline(&meta, &compiler, Some(&impactful_call_trace(1, 0xaa)));

        // First execution of the store is unneeded, the second is not.
        assert!(live.unneeded.contains(&DynamicInst::new(1, 0, -1)));
        assert!(!live.unneeded.contains(&DynamicInst::new(1, 0, 0)));
        // The impactful printf can never be unneeded.
        assert!(!live.unneeded.iter().any(|d| d.inst == 2));
        assert!(report.contains("Bug 1"));
    }

    /// E2, caller-discard case: everything computing the unused return
    /// value of `foo` is unneeded, including the `ret` itself.
    #[test]
    fn unused_return_value() {
        let meta = meta(
            vec![
                // main (bb0): call foo, impactful write, ret void
                call(0, 0, "foo"),
                external_call(1, 0, "write", Vec::new()),
                ret_void(2, 0),
                // foo (bb1): compute %r, ret %r
                inst(3, 1, InstKind::Normal),
                ret(4, 1, vec![ValueRef::Inst(3)]),
            ],
            &[],
        );
        let compiler = vec![
            Event::BasicBlock { tid: 1, bb: 0 },
            Event::BasicBlock { tid: 1, bb: 1 },
            Event::Return { tid: 1, inst: 1, callee: 0xbb },
        ];
        let (live, _) = run_pipeline(&meta, &compiler, Some(&impactful_call_trace(1, 0xbb)));

        assert!(live.unneeded.contains(&DynamicInst::new(1, 3, 0)));
        assert!(live.unneeded.contains(&DynamicInst::new(1, 4, 0)));
        // The discarded call itself is unneeded too.
        assert!(live.unneeded.contains(&DynamicInst::new(1, 0, 0)));
    }

    /// E2, thread-exit case: the returned value escapes to the OS, so
    /// the computation chain stays needed.
    #[test]
    fn return_value_at_thread_exit_is_needed() {
        let meta = meta(
            vec![
                inst(0, 0, InstKind::Normal),
                ret(1, 0, vec![ValueRef::Inst(0)]),
            ],
            &[],
        );
        let compiler = vec![Event::BasicBlock { tid: 1, bb: 0 }];
        let (live, _) = run_pipeline(&meta, &compiler, Some(&[]));
        assert!(live.unneeded.is_empty());
    }

    /// E3: memcpy followed by printf of the destination. The argument
    /// group spans both buffers, so the memcpy and the original store
    /// stay needed.
    #[test]
    fn external_call_aliasing() {
        let (src, dst) = (0x100u64, 0x200u64);
        let mut memcpy = inst(1, 0, InstKind::Call);
        memcpy.callee = Some("llvm.memcpy.p0i8.p0i8.i64".to_owned());
        let meta = meta(
            vec![
                inst(0, 0, InstKind::Store),
                memcpy,
                external_call(2, 0, "printf", Vec::new()),
                ret_void(3, 0),
            ],
            &[],
        );
        let compiler = vec![
            Event::BasicBlock { tid: 1, bb: 0 },
            Event::Memory { tid: 1, inst: 0, addr: src, len: 16 },
            Event::Memmove { tid: 1, inst: 1, dst, src, len: 16 },
            Event::Argument { tid: 1, ptr: dst },
            Event::Return { tid: 1, inst: 2, callee: 0xaa },
        ];
        let (live, _) = run_pipeline(&meta, &compiler, Some(&impactful_call_trace(1, 0xaa)));

        assert!(!live.unneeded.contains(&DynamicInst::new(1, 1, 0)), "memcpy must be needed");
        assert!(!live.unneeded.contains(&DynamicInst::new(1, 0, 0)), "store must be needed");
    }

    /// E4: both arms of a branch rejoin at an impactful block. The branch
    /// decides nothing observable, so the conditional terminator (and the
    /// arm it took) is unneeded, while the unconditional branch of the
    /// arm is not even reported.
    #[test]
    fn post_dominator_suppression() {
        let meta = meta(
            vec![
                inst(0, 0, InstKind::Normal),
                terminator(1, 0, &[1, 2]),
                inst(2, 1, InstKind::Normal),
                terminator(3, 1, &[3]),
                inst(4, 2, InstKind::Normal),
                terminator(5, 2, &[3]),
                external_call(6, 3, "printf", Vec::new()),
                ret_void(7, 3),
            ],
            &[(0, 1), (0, 2), (1, 3), (2, 3)],
        );
        let compiler = vec![
            Event::BasicBlock { tid: 1, bb: 0 },
            Event::BasicBlock { tid: 1, bb: 1 },
            Event::BasicBlock { tid: 1, bb: 3 },
            Event::Return { tid: 1, inst: 6, callee: 0xaa },
        ];
        let (live, _) = run_pipeline(&meta, &compiler, Some(&impactful_call_trace(1, 0xaa)));

        assert!(live.unneeded.contains(&DynamicInst::new(1, 1, 0)), "the if is unneeded");
        assert!(
            !live.unneeded.iter().any(|d| d.inst == 3),
            "single-successor branches are never reported"
        );
        assert!(!live.unneeded.iter().any(|d| d.inst == 6));
    }

    /// E5: a store in thread A read by thread B, which prints it.
    #[test]
    fn cross_thread_write() {
        let x = 0x100u64;
        let meta = meta(
            vec![
                // thread A entry function (bb0)
                inst(0, 0, InstKind::Store),
                ret_void(1, 0),
                // thread B entry function (bb1)
                inst(2, 1, InstKind::Load),
                external_call(3, 1, "printf", vec![ValueRef::Inst(2)]),
                ret_void(4, 1),
            ],
            &[],
        );
        let compiler = vec![
            Event::BasicBlock { tid: 1, bb: 0 },
            Event::Memory { tid: 1, inst: 0, addr: x, len: 4 },
            Event::BasicBlock { tid: 2, bb: 1 },
            Event::Memory { tid: 2, inst: 2, addr: x, len: 4 },
            Event::Return { tid: 2, inst: 3, callee: 0xaa },
        ];
        let (live, _) = run_pipeline(&meta, &compiler, Some(&impactful_call_trace(2, 0xaa)));

        assert!(!live.unneeded.contains(&DynamicInst::new(1, 0, 0)), "A's store is needed");
        assert!(!live.unneeded.contains(&DynamicInst::new(2, 2, 0)), "B's load is needed");
    }

    /// E6: a CAS whose loaded value feeds a printf: the CAS reads the
    /// store before it and everything stays needed.
    #[test]
    fn compare_and_swap() {
        let x = 0x100u64;
        let meta = meta(
            vec![
                inst(0, 0, InstKind::Store),
                inst(1, 0, InstKind::Atomic),
                external_call(2, 0, "printf", vec![ValueRef::Inst(1)]),
                ret_void(3, 0),
            ],
            &[],
        );
        let compiler = vec![
            Event::BasicBlock { tid: 1, bb: 0 },
            Event::Memory { tid: 1, inst: 0, addr: x, len: 4 },
            Event::Memory { tid: 1, inst: 1, addr: x, len: 4 },
            Event::Return { tid: 1, inst: 2, callee: 0xaa },
        ];
        let (live, _) = run_pipeline(&meta, &compiler, Some(&impactful_call_trace(1, 0xaa)));

        assert!(!live.unneeded.contains(&DynamicInst::new(1, 0, 0)), "store read by the CAS");
        assert!(!live.unneeded.contains(&DynamicInst::new(1, 1, 0)), "CAS read by the printf");
    }

    /// A producer with mixed needed/unneeded executions links only the
    /// consumers of its unneeded ones. Instruction 0 runs twice: the
    /// first execution feeds an impactful call (needed) and an unneeded
    /// consumer, the second feeds only an unneeded consumer. The report
    /// must cluster {0, second consumer} and leave the first consumer on
    /// its own.
    #[test]
    fn mixed_instance_producer_clusters_per_execution() {
        let mut a = inst(0, 0, InstKind::Normal);
        a.ir = Some("  %a = add i32 %x, 1".to_owned());
        let mut b = inst(2, 1, InstKind::Normal);
        b.ssa_deps = vec![ValueRef::Inst(0)];
        b.ir = Some("  %b = mul i32 %a, 5".to_owned());
        let mut d = inst(5, 2, InstKind::Normal);
        d.ssa_deps = vec![ValueRef::Inst(0)];
        d.ir = Some("  %d = sub i32 %a, 1".to_owned());
        let meta = meta(
            vec![
                a,
                terminator(1, 0, &[1, 2]),
                b,
                external_call(3, 1, "printf", vec![ValueRef::Inst(0)]),
                terminator(4, 1, &[0]),
                d,
                ret_void(6, 2),
            ],
            &[(0, 1), (0, 2), (1, 0)],
        );
        // bb0 (compute), bb1 (consume + print), bb0 again, bb2 (consume).
        let compiler = vec![
            Event::BasicBlock { tid: 1, bb: 0 },
            Event::BasicBlock { tid: 1, bb: 1 },
            Event::Return { tid: 1, inst: 3, callee: 0xaa },
            Event::BasicBlock { tid: 1, bb: 0 },
            Event::BasicBlock { tid: 1, bb: 2 },
        ];
        let (live, report) =
            run_pipeline(&meta, &compiler, Some(&impactful_call_trace(1, 0xaa)));

        // The first execution of 0 is needed (the printf read it); the
        // second went dead along with its consumer.
        assert!(!live.unneeded.contains(&DynamicInst::new(1, 0, -1)));
        assert!(live.unneeded.contains(&DynamicInst::new(1, 0, 0)));
        assert!(live.unneeded.contains(&DynamicInst::new(1, 2, 0)));
        assert!(live.unneeded.contains(&DynamicInst::new(1, 5, 0)));

        // Only the exact unneeded pair is linked.
        assert!(live.ssa_edges.contains(&(0, 5)));
        assert!(!live.ssa_edges.contains(&(0, 2)));

        // In the report, %d shares the first cluster with %a; %b sits in
        // a later cluster of its own.
        let d_at = report.find("%d = sub").unwrap();
        let b_at = report.find("%b = mul").unwrap();
        let bug2_at = report.find("Bug 2").unwrap();
        assert!(d_at < bug2_at);
        assert!(b_at > bug2_at);
    }

    /// A phi only needs the incoming value of the edge that was taken:
    /// the other candidate is unneeded.
    #[test]
    fn phi_selects_the_taken_edge() {
        let mut phi = inst(5, 3, InstKind::Phi);
        phi.phi_deps = vec![(1, ValueRef::Inst(0)), (2, ValueRef::Inst(1))];
        let meta = meta(
            vec![
                inst(0, 0, InstKind::Normal),
                inst(1, 0, InstKind::Normal),
                terminator(2, 0, &[1, 2]),
                terminator(3, 1, &[3]),
                terminator(4, 2, &[3]),
                phi,
                external_call(6, 3, "printf", vec![ValueRef::Inst(5)]),
                ret_void(7, 3),
            ],
            &[(0, 1), (0, 2), (1, 3), (2, 3)],
        );
        let compiler = vec![
            Event::BasicBlock { tid: 1, bb: 0 },
            Event::BasicBlock { tid: 1, bb: 1 },
            Event::BasicBlock { tid: 1, bb: 3 },
            Event::Return { tid: 1, inst: 6, callee: 0xaa },
        ];
        let (live, _) = run_pipeline(&meta, &compiler, Some(&impactful_call_trace(1, 0xaa)));

        assert!(!live.unneeded.contains(&DynamicInst::new(1, 0, 0)), "value of the taken edge");
        assert!(live.unneeded.contains(&DynamicInst::new(1, 1, 0)), "value of the untaken edge");
        assert!(!live.unneeded.iter().any(|d| d.inst == 5), "the phi itself is needed");
    }

    /// `free` is exempt: a dead allocation's `free` is not itself a bug.
    #[test]
    fn free_is_not_reported() {
        let meta = meta(
            vec![external_call(0, 0, "free", Vec::new()), ret_void(1, 0)],
            &[],
        );
        let compiler = vec![
            Event::BasicBlock { tid: 1, bb: 0 },
            Event::Argument { tid: 1, ptr: 0x100 },
            Event::Return { tid: 1, inst: 0, callee: 0xcc },
        ];
        let (live, report) = run_pipeline(&meta, &compiler, Some(&[]));
        assert!(live.unneeded.is_empty());
        assert!(!report.contains("Bug"));
    }

    /// Allow-list fallback: with no syscall stream, a call to `write` is
    /// impactful by name.
    #[test]
    fn allow_list_fallback_marks_write_impactful() {
        let p = 0x100u64;
        let meta = meta(
            vec![
                inst(0, 0, InstKind::Store),
                external_call(1, 0, "write", Vec::new()),
                ret_void(2, 0),
            ],
            &[],
        );
        let compiler = vec![
            Event::BasicBlock { tid: 1, bb: 0 },
            Event::Memory { tid: 1, inst: 0, addr: p, len: 4 },
            Event::Argument { tid: 1, ptr: p },
            Event::Return { tid: 1, inst: 1, callee: 0xaa },
        ];
        let (live, _) = run_pipeline(&meta, &compiler, None);
        assert!(!live.unneeded.iter().any(|d| d.inst == 1));
        assert!(!live.unneeded.contains(&DynamicInst::new(1, 0, 0)), "write's buffer is read");
    }

    /// Property 10: the report is byte-identical across runs.
    #[test]
    fn report_is_idempotent() {
        let p = 0x1000u64;
        let build = || {
            let meta = meta(
                vec![
                    inst(0, 0, InstKind::Store),
                    terminator(1, 0, &[0, 1]),
                    external_call(2, 1, "printf", Vec::new()),
                    ret_void(3, 1),
                ],
                &[(0, 0), (0, 1)],
            );
            let compiler = vec![
                Event::BasicBlock { tid: 1, bb: 0 },
                Event::Memory { tid: 1, inst: 0, addr: p, len: 4 },
                Event::BasicBlock { tid: 1, bb: 0 },
                Event::Memory { tid: 1, inst: 0, addr: p, len: 4 },
                Event::BasicBlock { tid: 1, bb: 1 },
                Event::Argument { tid: 1, ptr: p },
                Event::Return { tid: 1, inst: 2, callee: 0xaa },
            ];
            run_pipeline(&meta, &compiler, Some(&impactful_call_trace(1, 0xaa))).1
        };
        assert_eq!(build(), build());
    }
}
