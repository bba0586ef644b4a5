use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHashSet};

use slimmer_trace::{Event, TraceReader};

use crate::error::{Error, Inconsistency};

/// How external-call activations are classified as impactful.
///
/// The traced form records exactly which activations were live when a
/// side-effecting syscall executed. The allow-list form is the fallback
/// when no syscall stream was recorded: any call whose callee name is a
/// known syscall-bearing libc entry point counts.
pub enum ImpactfulCalls {
    Traced(ImpactfulSet),
    AllowList,
}

/// The set of `(tid, callee address, invocation index)` activations that
/// executed at least one syscall.
pub type ImpactfulSet = FxHashSet<(u64, u64, u32)>;

impl ImpactfulCalls {
    pub fn is_impactful(
        &self,
        tid: u64,
        callee_addr: u64,
        invocation: u32,
        callee_name: Option<&str>,
    ) -> bool {
        match self {
            ImpactfulCalls::Traced(set) => set.contains(&(tid, callee_addr, invocation)),
            ImpactfulCalls::AllowList => callee_name.is_some_and(is_impactful_name),
        }
    }
}

/// Libc entry points that always reach the outside world. Used only when
/// no syscall-level trace is available.
fn is_impactful_name(name: &str) -> bool {
    matches!(
        name,
        "poll"
            | "fcntl"
            | "fclose"
            | "write"
            | "getpid"
            | "listen"
            | "close"
            | "fflush"
            | "signal"
            | "fstate"
            | "exit"
    ) || name.starts_with("pthread_")
}

/// Scan the syscall-level stream and collect the impactful activations.
///
/// Maintains one virtual call stack per thread, keyed by callee address.
/// A `Syscall` marks the activation on top of its thread's stack; a
/// `Syscall` before the first instrumented call is ignored. A `Return`
/// that does not match the stack top means the tracer lost events, which
/// is fatal.
pub fn extract_impactful_calls(reader: &TraceReader) -> Result<ImpactfulSet, Error> {
    let mut stacks: FxHashMap<u64, Vec<(u64, u32)>> = FxHashMap::default();
    let mut invocations: FxHashMap<(u64, u64), u32> = FxHashMap::default();
    let mut impactful = ImpactfulSet::default();

    for event in reader.forward() {
        match event? {
            Event::Call { tid, callee } => {
                let index = invocations.entry((tid, callee)).or_insert(0);
                stacks.entry(tid).or_default().push((callee, *index));
                *index += 1;
            }
            Event::Return { tid, callee, .. } => {
                let stack = stacks.entry(tid).or_default();
                match stack.pop() {
                    Some((top, _)) if top == callee => {}
                    Some((top, _)) => {
                        return Err(Inconsistency::UnbalancedReturn {
                            tid,
                            expected: top,
                            found: callee,
                        }
                        .into())
                    }
                    None => return Err(Inconsistency::ReturnOnEmptyStack { tid, callee }.into()),
                }
            }
            Event::Syscall { tid } => {
                match stacks.get(&tid).and_then(|s| s.last()) {
                    Some(&(callee, index)) => {
                        impactful.insert((tid, callee, index));
                    }
                    // Syscalls before the tracee's first instrumented
                    // call (loader, libc startup) carry no blame.
                    None => debug!("thread {tid}: syscall outside any traced call"),
                }
            }
            other => {
                warn!("unexpected {other} in the syscall stream");
            }
        }
    }

    Ok(impactful)
}
