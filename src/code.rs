//! The instruction set and compiled code objects.
//!
//! A `Code` is the interpreter-executable form of one function: frame layout
//! metadata plus a linear instruction vector. Instructions address values in
//! the executing frame through [`FrameIndex`] operands and write results to
//! local slots. Each instruction optionally carries a short list of profile
//! operations to replay just before it executes.

use std::fmt::Write as _;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::name::{Loc, Name};
use crate::profile::{BlockId, Profile};

/// The position of a value in an executing frame.
///
/// Statics are the closed-over values of the called function; locals are the
/// function's working set, including its arguments in the first slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameIndex {
    Static(usize),
    Local(usize),
}

impl std::fmt::Display for FrameIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameIndex::Static(i) => write!(f, "s{}", i),
            FrameIndex::Local(i) => write!(f, "l{}", i),
        }
    }
}

/// The position of a value in the locals section of a frame.
pub type LocalIndex = usize;

/// A profiling operation attached to an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileOp {
    /// Enter the given profiling block
    Enter(BlockId),
    /// Exit the current profiling block
    Exit,
    /// Exit the current block ahead of a frame-terminating instruction
    AutoExit,
}

/// One instruction operation.
#[derive(Debug)]
pub enum Op {
    /// `dest <- struct(args...)`
    StructValue {
        args: Vec<FrameIndex>,
        dest: LocalIndex,
    },

    /// `dest <- union(tag, arg)`
    UnionValue {
        tag: usize,
        arg: FrameIndex,
        dest: LocalIndex,
    },

    /// `dest <- obj.tag` for a struct object. Aborts if `obj` is undefined.
    StructAccess {
        obj: FrameIndex,
        tag: usize,
        dest: LocalIndex,
        loc: Loc,
    },

    /// `dest <- obj.tag` for a union object. Aborts if `obj` is undefined or
    /// carries a different tag.
    UnionAccess {
        obj: FrameIndex,
        tag: usize,
        dest: LocalIndex,
        loc: Loc,
    },

    /// `pc <- pc + 1 + jumps[condition.tag]`. Aborts if the condition is
    /// undefined.
    UnionSelect {
        condition: FrameIndex,
        jumps: SmallVec<[usize; 4]>,
        loc: Loc,
    },

    /// `pc <- pc + 1 + count`. Jumping backwards is not supported.
    Jump { count: usize },

    /// `dest <- func(code, statics = [scope...])`
    FuncValue {
        code: Arc<Code>,
        scope: Vec<FrameIndex>,
        dest: LocalIndex,
    },

    /// Call a function. With `exit` set this is a tail call: the current
    /// frame is replaced and `dest` is ignored.
    Call {
        func: FrameIndex,
        args: Vec<FrameIndex>,
        dest: LocalIndex,
        exit: bool,
        loc: Loc,
    },

    /// Allocate a fresh link and store its get proc and put function.
    Link { get: LocalIndex, put: LocalIndex },

    /// Fork one child thread per argument proc; each child's result is
    /// delivered to the corresponding dest local.
    Fork {
        args: Vec<FrameIndex>,
        dests: Vec<LocalIndex>,
    },

    /// `dest <- src`
    Copy { src: FrameIndex, dest: LocalIndex },

    /// `dest <- ref()`, an undefined reference cell
    RefValue { dest: LocalIndex },

    /// Tie a reference cell to its value. Aborts on a vacuous (ref-only)
    /// cycle.
    RefDef {
        r#ref: LocalIndex,
        value: FrameIndex,
        loc: Loc,
    },

    /// Pop the frame, delivering `result` to the caller
    Return { result: FrameIndex },

    /// `dest <- type`
    TypeValue { dest: LocalIndex },

    /// Drop the strong reference held by a local slot and mark it empty
    Release { target: LocalIndex },
}

/// An instruction: profile operations to replay, then the operation itself.
#[derive(Debug)]
pub struct Instr {
    pub profile_ops: SmallVec<[ProfileOp; 2]>,
    pub op: Op,
}

impl Instr {
    /// An instruction with no profile operations
    pub fn new(op: Op) -> Self {
        Self {
            profile_ops: SmallVec::new(),
            op,
        }
    }
}

/// A compiled function body: frame layout plus instructions.
///
/// Invariant: `locals >= args`; arguments occupy the first `args` local
/// slots. `Code` objects are shared (`Arc`) between the instructions that
/// allocate functions over them and the function values at runtime.
#[derive(Debug)]
pub struct Code {
    /// Number of arguments to the function
    pub args: usize,
    /// Number of values captured from the enclosing scope
    pub statics: usize,
    /// Total number of local slots, including the arguments
    pub locals: usize,
    /// The profile block entered when the function body runs
    pub profile_block_id: BlockId,
    /// Names of the profile blocks this code allocated, in id order starting
    /// at `profile_block_id`; carried so external tooling can rebase ids
    pub profile_blocks: Vec<Name>,
    /// The instruction vector
    pub instrs: Vec<Instr>,
}

impl Code {
    /// Create a new, empty code object
    pub fn new(args: usize, statics: usize, locals: usize, profile_block_id: BlockId) -> Self {
        Self {
            args,
            statics,
            locals,
            profile_block_id,
            profile_blocks: Vec::new(),
            instrs: Vec::new(),
        }
    }

    /// Number of instructions
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    /// True if the code has no instructions
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Disassemble this code and, once each, every child function body it
    /// references.
    pub fn disassemble(&self) -> String {
        self.disassemble_with(None)
    }

    /// Disassemble with profile-block names resolved against `profile`.
    ///
    /// Block ids in headers, function allocations, and enter ops are
    /// annotated with their dotted block path, which makes the listing
    /// legible for whole programs where every body is just "block N"
    /// otherwise.
    pub fn disassemble_with(&self, profile: Option<&Profile>) -> String {
        let mut output = String::new();
        let mut seen: Vec<*const Code> = Vec::new();
        let mut pending: Vec<&Code> = vec![self];
        while let Some(code) = pending.pop() {
            if seen.contains(&(code as *const Code)) {
                continue;
            }
            seen.push(code as *const Code);
            code.disassemble_one(profile, &mut output);
            for instr in &code.instrs {
                if let Op::FuncValue { code: child, .. } = &instr.op {
                    pending.push(child);
                }
            }
        }
        output
    }

    /// Disassemble just this code object into `output`
    fn disassemble_one(&self, profile: Option<&Profile>, output: &mut String) {
        let _ = writeln!(
            output,
            "=== block {} (args: {}, statics: {}, locals: {}) ===",
            block_label(profile, self.profile_block_id),
            self.args,
            self.statics,
            self.locals
        );
        for pc in 0..self.instrs.len() {
            let _ = writeln!(output, "{:4} {}", pc, self.instruction_with(profile, pc));
        }
    }

    /// Disassemble the single instruction at `pc`, profile-op prefix
    /// included.
    pub fn disassemble_instruction(&self, pc: usize) -> String {
        self.instruction_with(None, pc)
    }

    fn instruction_with(&self, profile: Option<&Profile>, pc: usize) -> String {
        let instr = &self.instrs[pc];
        let mut ops = String::new();
        for op in &instr.profile_ops {
            match op {
                ProfileOp::Enter(block) => {
                    let _ = write!(ops, "[enter {}] ", block_label(profile, *block));
                }
                ProfileOp::Exit => ops.push_str("[exit] "),
                ProfileOp::AutoExit => ops.push_str("[auto_exit] "),
            }
        }
        format!("{}{}", ops, disassemble_op(profile, pc, &instr.op))
    }
}

/// Render a block id, with its dotted name when a profile can resolve it.
fn block_label(profile: Option<&Profile>, id: BlockId) -> String {
    match profile {
        Some(profile) if id < profile.len() => {
            format!("{} ({})", id, profile.block(id).name)
        }
        _ => id.to_string(),
    }
}

fn list(indices: &[FrameIndex]) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn disassemble_op(profile: Option<&Profile>, pc: usize, op: &Op) -> String {
    match op {
        Op::StructValue { args, dest } => {
            format!("struct_value l{} <- [{}]", dest, list(args))
        }
        Op::UnionValue { tag, arg, dest } => {
            format!("union_value l{} <- {}:{}", dest, tag, arg)
        }
        Op::StructAccess { obj, tag, dest, .. } => {
            format!("struct_access l{} <- {}.{}", dest, obj, tag)
        }
        Op::UnionAccess { obj, tag, dest, .. } => {
            format!("union_access l{} <- {}.{}", dest, obj, tag)
        }
        Op::UnionSelect {
            condition, jumps, ..
        } => {
            let targets = jumps
                .iter()
                .map(|count| (pc + 1 + count).to_string())
                .collect::<Vec<_>>()
                .join(", ");
            format!("union_select {} -> [{}]", condition, targets)
        }
        Op::Jump { count } => format!("jump -> {}", pc + 1 + count),
        Op::FuncValue { code, scope, dest } => {
            format!(
                "func_value l{} <- block {} [{}]",
                dest,
                block_label(profile, code.profile_block_id),
                list(scope)
            )
        }
        Op::Call {
            func,
            args,
            dest,
            exit,
            ..
        } => {
            if *exit {
                format!("tail_call {}({})", func, list(args))
            } else {
                format!("call l{} <- {}({})", dest, func, list(args))
            }
        }
        Op::Link { get, put } => format!("link get: l{}, put: l{}", get, put),
        Op::Fork { args, dests } => {
            let dests = dests
                .iter()
                .map(|d| format!("l{}", d))
                .collect::<Vec<_>>()
                .join(", ");
            format!("fork [{}] -> [{}]", list(args), dests)
        }
        Op::Copy { src, dest } => format!("copy l{} <- {}", dest, src),
        Op::RefValue { dest } => format!("ref_value l{}", dest),
        Op::RefDef { r#ref, value, .. } => format!("ref_def l{} <- {}", r#ref, value),
        Op::Return { result } => format!("return {}", result),
        Op::TypeValue { dest } => format!("type_value l{}", dest),
        Op::Release { target } => format!("release l{}", target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_invariant_args_in_locals() {
        let code = Code::new(2, 0, 3, 0);
        assert!(code.locals >= code.args);
        assert!(code.is_empty());
    }

    #[test]
    fn test_disassemble_basic() {
        let mut code = Code::new(0, 0, 2, 0);
        code.instrs.push(Instr::new(Op::StructValue {
            args: vec![],
            dest: 0,
        }));
        code.instrs.push(Instr::new(Op::UnionValue {
            tag: 1,
            arg: FrameIndex::Local(0),
            dest: 1,
        }));
        code.instrs.push(Instr::new(Op::Return {
            result: FrameIndex::Local(1),
        }));

        let disasm = code.disassemble();
        assert!(disasm.contains("struct_value l0 <- []"));
        assert!(disasm.contains("union_value l1 <- 1:l0"));
        assert!(disasm.contains("return l1"));
    }

    #[test]
    fn test_disassemble_jump_targets() {
        let mut code = Code::new(0, 0, 1, 0);
        code.instrs.push(Instr::new(Op::UnionSelect {
            condition: FrameIndex::Local(0),
            jumps: SmallVec::from_slice(&[0, 2]),
            loc: Loc::builtin(),
        }));
        code.instrs.push(Instr::new(Op::Jump { count: 1 }));

        let disasm = code.disassemble();
        assert!(disasm.contains("union_select l0 -> [1, 3]"));
        assert!(disasm.contains("jump -> 3"));
    }

    #[test]
    fn test_disassemble_child_codes_once() {
        let child = Arc::new(Code::new(1, 0, 1, 7));
        let mut code = Code::new(0, 0, 2, 0);
        code.instrs.push(Instr::new(Op::FuncValue {
            code: Arc::clone(&child),
            scope: vec![],
            dest: 0,
        }));
        code.instrs.push(Instr::new(Op::FuncValue {
            code: Arc::clone(&child),
            scope: vec![],
            dest: 1,
        }));

        let disasm = code.disassemble();
        assert_eq!(disasm.matches("=== block 7").count(), 1);
    }

    #[test]
    fn test_disassemble_with_profile_names() {
        let mut profile = Profile::new();
        let main = profile.add_block(Name::normal("Main", Loc::builtin()));

        let mut code = Code::new(0, 0, 1, main);
        let mut instr = Instr::new(Op::TypeValue { dest: 0 });
        instr.profile_ops.push(ProfileOp::Enter(main));
        code.instrs.push(instr);

        let annotated = code.disassemble_with(Some(&profile));
        assert!(annotated.contains("=== block 0 (Main)"));
        assert!(annotated.contains("[enter 0 (Main)]"));

        // Without a profile the ids stay bare.
        let bare = code.disassemble();
        assert!(bare.contains("[enter 0]"));
    }

    #[test]
    fn test_profile_op_prefix_rendered() {
        let mut code = Code::new(0, 0, 1, 0);
        let mut instr = Instr::new(Op::TypeValue { dest: 0 });
        instr.profile_ops.push(ProfileOp::Enter(3));
        instr.profile_ops.push(ProfileOp::Exit);
        code.instrs.push(instr);

        let disasm = code.disassemble();
        assert!(disasm.contains("[enter 3] [exit] type_value l0"));
    }
}
