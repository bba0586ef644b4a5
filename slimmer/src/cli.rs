use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "slimmer",
    version,
    about = r#"
slimmer finds unneeded computations in a recorded execution of an
instrumented program: operations whose observable effects never influence
any output of that run.

EXAMPLES:
    # Analyze a recording and print the ranked bug report:
    slimmer print-bug ./slimmer-info compiler.trace syscall.trace

    # Without a syscall trace, fall back to the libc allow-list:
    slimmer print-bug ./slimmer-info compiler.trace

    # Inspect a raw trace stream:
    slimmer dump-trace compiler.trace
"#
)]
pub struct Opt {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Analyze a recorded execution and print the bug report.
    #[command(name = "print-bug")]
    PrintBug(PrintBugArgs),

    /// Pretty-print the events of a raw trace stream.
    #[command(name = "dump-trace")]
    DumpTrace(DumpTraceArgs),

    /// Merge a recording and pretty-print the smallest-block trace.
    #[command(name = "dump-blocks")]
    DumpBlocks(PrintBugArgs),
}

#[derive(Debug, Args)]
pub struct PrintBugArgs {
    /// Directory holding the Inst, BBGraph and InstrumentedFun files
    /// written by the instrumentation pass.
    pub info_dir: PathBuf,

    /// The compiler-level trace recorded by the instrumented program.
    pub compiler_trace: PathBuf,

    /// The syscall-level trace recorded by the external tracer. Without
    /// it, impactful calls are identified by callee name instead.
    pub syscall_trace: Option<PathBuf>,

    /// Log and drop a thread's trailing events on trace inconsistencies
    /// instead of aborting.
    #[arg(long)]
    pub lenient: bool,
}

#[derive(Debug, Args)]
pub struct DumpTraceArgs {
    /// Path to the trace file. Both stream kinds share the record
    /// format, so either can be dumped.
    pub trace: PathBuf,
}
