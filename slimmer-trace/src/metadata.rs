use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: io::Error,
    },
    #[error("malformed {file} metadata near token {index}: {detail}")]
    Parse {
        file: &'static str,
        index: usize,
        detail: String,
    },
    #[error("instruction ids in Inst are not dense: expected {expected}, found {found}")]
    NonDenseId { expected: u32, found: u32 },
}

/// Opcode class of a static instruction, as recorded by the
/// instrumentation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstKind {
    Normal,
    Load,
    Store,
    Call,
    ExternalCall,
    Return,
    Terminator,
    Phi,
    VarArg,
    Atomic,
    Alloca,
}

/// One operand of an instruction: another instruction's SSA value, a
/// function argument (pointer-typed or not), or a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRef {
    Inst(u32),
    Arg(u32),
    PointerArg(u32),
    Constant,
}

/// Static description of one instrumented instruction.
#[derive(Debug, Clone)]
pub struct InstInfo {
    pub id: u32,
    pub bb: u32,
    pub is_pointer: bool,
    /// Source line from debug info; 0 when unknown.
    pub line: u32,
    /// Source file path; `None` when the pass recorded `[UNKNOWN]`.
    pub file: Option<String>,
    /// The IR text of the instruction; `None` when unknown.
    pub ir: Option<String>,
    pub ssa_deps: Vec<ValueRef>,
    pub kind: InstKind,
    /// Callee name for `Call`/`ExternalCall`.
    pub callee: Option<String>,
    /// Successor basic blocks for `Terminator`/`Return`.
    pub successors: Vec<u32>,
    /// `(predecessor bb, incoming value)` edges for `Phi`.
    pub phi_deps: Vec<(u32, ValueRef)>,
}

impl InstInfo {
    /// True for `ret void`, which carries control but no value.
    pub fn is_return_void(&self) -> bool {
        self.ir
            .as_deref()
            .is_some_and(|ir| ir.trim_start().starts_with("ret void"))
    }
}

/// The static side of an instrumented program: the instruction table, the
/// per-basic-block instruction lists, the basic-block successor graph and
/// the set of instrumented function names. Built once, read-only after.
pub struct Metadata {
    pub instructions: Vec<InstInfo>,
    pub bb_instructions: Vec<Vec<u32>>,
    pub bb_successors: FxHashMap<u32, Vec<u32>>,
    pub instrumented: FxHashSet<String>,
}

impl Metadata {
    /// Load `Inst`, `BBGraph` and `InstrumentedFun` from the info
    /// directory written by the instrumentation pass.
    pub fn load(dir: &Path) -> Result<Self, MetadataError> {
        let inst_path = dir.join("Inst");
        let inst_text = read(&inst_path)?;
        let (instructions, bb_instructions) = parse_instructions(&inst_text)?;

        let graph_path = dir.join("BBGraph");
        let graph_text = read(&graph_path)?;
        let bb_successors = parse_bb_graph(&graph_text)?;

        // The instrumented-function list is informational; older traces
        // were recorded without it.
        let instrumented = match std::fs::read_to_string(dir.join("InstrumentedFun")) {
            Ok(text) => text.split_whitespace().map(str::to_owned).collect(),
            Err(err) => {
                debug!("no InstrumentedFun file in {}: {err}", dir.display());
                FxHashSet::default()
            }
        };

        Ok(Metadata {
            instructions,
            bb_instructions,
            bb_successors,
            instrumented,
        })
    }

    pub fn instruction(&self, id: u32) -> Option<&InstInfo> {
        self.instructions.get(id as usize)
    }

    pub fn bb_insts(&self, bb: u32) -> Option<&[u32]> {
        self.bb_instructions.get(bb as usize).map(Vec::as_slice)
    }
}

fn read(path: &Path) -> Result<String, MetadataError> {
    std::fs::read_to_string(path).map_err(|source| MetadataError::Io {
        path: path.to_owned(),
        source,
    })
}

/// Whitespace-separated token cursor with positional error reporting.
struct Tokens<'a> {
    iter: std::str::SplitWhitespace<'a>,
    file: &'static str,
    index: usize,
}

impl<'a> Tokens<'a> {
    fn new(text: &'a str, file: &'static str) -> Self {
        Tokens {
            iter: text.split_whitespace(),
            file,
            index: 0,
        }
    }

    fn error(&self, detail: impl Into<String>) -> MetadataError {
        MetadataError::Parse {
            file: self.file,
            index: self.index,
            detail: detail.into(),
        }
    }

    fn next(&mut self) -> Option<&'a str> {
        let token = self.iter.next()?;
        self.index += 1;
        Some(token)
    }

    fn expect(&mut self) -> Result<&'a str, MetadataError> {
        self.next()
            .ok_or_else(|| self.error("unexpected end of file"))
    }

    fn expect_u32(&mut self) -> Result<u32, MetadataError> {
        let token = self.expect()?;
        token
            .parse()
            .map_err(|_| self.error(format!("expected a number, found {token:?}")))
    }

    fn expect_usize(&mut self) -> Result<usize, MetadataError> {
        let token = self.expect()?;
        token
            .parse()
            .map_err(|_| self.error(format!("expected a count, found {token:?}")))
    }
}

fn parse_text_field(tokens: &mut Tokens<'_>) -> Result<Option<String>, MetadataError> {
    let token = tokens.expect()?;
    if token == "[UNKNOWN]" {
        return Ok(None);
    }
    let bytes = BASE64
        .decode(token)
        .map_err(|err| tokens.error(format!("bad base64 field: {err}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|err| tokens.error(format!("base64 field is not utf-8: {err}")))?;
    Ok(Some(text))
}

fn parse_value_ref(tokens: &mut Tokens<'_>) -> Result<ValueRef, MetadataError> {
    let kind = tokens.expect()?;
    let value = tokens.expect_u32()?;
    Ok(match kind {
        "Inst" => ValueRef::Inst(value),
        "Arg" => ValueRef::Arg(value),
        "PointerArg" => ValueRef::PointerArg(value),
        "Constant" => ValueRef::Constant,
        other => return Err(tokens.error(format!("unknown operand kind {other:?}"))),
    })
}

fn parse_inst_kind(tokens: &mut Tokens<'_>) -> Result<InstKind, MetadataError> {
    let token = tokens.expect()?;
    Ok(match token {
        "Inst" => InstKind::Normal,
        "LoadInst" => InstKind::Load,
        "StoreInst" => InstKind::Store,
        "CallInst" => InstKind::Call,
        "ExternalCallInst" => InstKind::ExternalCall,
        "ReturnInst" => InstKind::Return,
        "TerminatorInst" => InstKind::Terminator,
        "PhiNode" => InstKind::Phi,
        "VarArgInst" => InstKind::VarArg,
        "AtomicInst" => InstKind::Atomic,
        "AllocaInst" => InstKind::Alloca,
        other => return Err(tokens.error(format!("unknown opcode class {other:?}"))),
    })
}

fn parse_instructions(text: &str) -> Result<(Vec<InstInfo>, Vec<Vec<u32>>), MetadataError> {
    let mut tokens = Tokens::new(text, "Inst");
    let mut instructions: Vec<InstInfo> = Vec::new();
    let mut bb_instructions: Vec<Vec<u32>> = Vec::new();

    while let Some(first) = tokens.next() {
        let id: u32 = first
            .parse()
            .map_err(|_| tokens.error(format!("expected an instruction id, found {first:?}")))?;
        if id as usize != instructions.len() {
            return Err(MetadataError::NonDenseId {
                expected: instructions.len() as u32,
                found: id,
            });
        }

        let bb = tokens.expect_u32()?;
        let is_pointer = match tokens.expect()? {
            "0" => false,
            "1" => true,
            other => return Err(tokens.error(format!("expected 0 or 1, found {other:?}"))),
        };
        let line = tokens.expect_u32()?;
        let file = parse_text_field(&mut tokens)?;
        let ir = parse_text_field(&mut tokens)?;

        let dep_count = tokens.expect_usize()?;
        let mut ssa_deps = Vec::with_capacity(dep_count);
        for _ in 0..dep_count {
            ssa_deps.push(parse_value_ref(&mut tokens)?);
        }

        let kind = parse_inst_kind(&mut tokens)?;
        let mut callee = None;
        let mut successors = Vec::new();
        let mut phi_deps = Vec::new();
        match kind {
            InstKind::Call | InstKind::ExternalCall => {
                callee = Some(tokens.expect()?.to_owned());
            }
            InstKind::Terminator | InstKind::Return => {
                let count = tokens.expect_usize()?;
                for _ in 0..count {
                    successors.push(tokens.expect_u32()?);
                }
            }
            InstKind::Phi => {
                let count = tokens.expect_usize()?;
                for _ in 0..count {
                    let pred = tokens.expect_u32()?;
                    let value = parse_value_ref(&mut tokens)?;
                    phi_deps.push((pred, value));
                }
            }
            _ => {}
        }

        if bb as usize >= bb_instructions.len() {
            bb_instructions.resize(bb as usize + 1, Vec::new());
        }
        bb_instructions[bb as usize].push(id);

        instructions.push(InstInfo {
            id,
            bb,
            is_pointer,
            line,
            file,
            ir,
            ssa_deps,
            kind,
            callee,
            successors,
            phi_deps,
        });
    }

    Ok((instructions, bb_instructions))
}

fn parse_bb_graph(text: &str) -> Result<FxHashMap<u32, Vec<u32>>, MetadataError> {
    let mut tokens = Tokens::new(text, "BBGraph");
    let mut successors: FxHashMap<u32, Vec<u32>> = FxHashMap::default();
    while let Some(first) = tokens.next() {
        let from: u32 = first
            .parse()
            .map_err(|_| tokens.error(format!("expected a basic block id, found {first:?}")))?;
        let to = tokens.expect_u32()?;
        successors.entry(from).or_default().push(to);
    }
    Ok(successors)
}
