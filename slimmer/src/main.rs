mod cli;
mod error;
mod grouping;
mod impactful;
mod liveness;
mod memdep;
mod merge;
mod pipeline;
mod postdom;
mod report;
#[cfg(test)]
mod testutil;

use clap::Parser;

use crate::pipeline::{dump_blocks, dump_trace, run_print_bug};

fn main() {
    env_logger::init();

    let opt = cli::Opt::parse();
    let result = match opt.action {
        cli::Action::PrintBug(args) => run_print_bug(&args),
        cli::Action::DumpTrace(args) => dump_trace(&args),
        cli::Action::DumpBlocks(args) => dump_blocks(&args),
    };

    if let Err(err) = result {
        eprintln!("slimmer: {err}");
        std::process::exit(1);
    }
}
