//! The compiler: lowers type-checked trees to instruction streams.
//!
//! One [`Code`] is produced per function value plus one for the top-level
//! expression. Compilation works against a `Scope` that tracks the frame
//! layout: captured statics, the De Bruijn stack of visible variables, and a
//! refcounted pool of local slots so that a value read several times is
//! compiled once and its slot reused only after the last read. Profile
//! operations accumulate in the scope and attach to the next emitted
//! instruction.

use std::rc::Rc;
use std::sync::Arc;

use itertools::Itertools;
use smallvec::SmallVec;
use tracing::debug;

use crate::code::{Code, FrameIndex, Instr, LocalIndex, Op, ProfileOp};
use crate::name::{Loc, ModulePath, Name, Namespace};
use crate::profile::{BlockId, Profile};
use crate::tc::{DataType, LetBinding, Tc, TcProfiled, VarIndex, VarSource};


/// A module ready to compile: its path, dependencies, and type-checked body.
///
/// The body is a function of the module's dependency values, so it compiles
/// with `deps.len()` arguments.
#[derive(Debug)]
pub struct TcModule {
    pub path: ModulePath,
    pub deps: Vec<ModulePath>,
    pub tc: Tc,
}

/// One compiled module.
#[derive(Debug)]
pub struct CompiledModule {
    pub path: ModulePath,
    pub deps: Vec<ModulePath>,
    pub code: Arc<Code>,
}

/// A compiled program: modules in dependency order.
#[derive(Debug)]
pub struct CompiledProgram {
    pub modules: Vec<CompiledModule>,
}

/// Scope of variables visible during compilation of one function body.
///
/// `vars` is the De Bruijn stack: entries may be `None` for bindings whose
/// definitions have not been compiled yet. `locals` carries a refcount per
/// frame slot; a slot with count zero is free for reuse, and the frame size
/// is the high-water mark of allocated slots.
struct Scope {
    vars: Vec<Option<FrameIndex>>,
    locals: Vec<usize>,
    code: Code,
    pending_profile_ops: SmallVec<[ProfileOp; 2]>,
}

impl Scope {
    fn new(args: usize, statics: usize) -> Self {
        Self {
            vars: Vec::new(),
            locals: Vec::new(),
            code: Code::new(args, statics, 0, 0),
            pending_profile_ops: SmallVec::new(),
        }
    }

    /// Allocate an anonymous local slot, reusing a free one when possible
    fn new_local(&mut self) -> LocalIndex {
        match self.locals.iter().position(|&count| count == 0) {
            Some(index) => {
                self.locals[index] = 1;
                index
            }
            None => {
                self.locals.push(1);
                self.code.locals = self.locals.len();
                self.locals.len() - 1
            }
        }
    }

    /// Take another reference to a frame position. Statics are owned by the
    /// scope for its whole lifetime and are not counted.
    fn retain(&mut self, index: FrameIndex) {
        if let FrameIndex::Local(i) = index {
            debug_assert!(self.locals[i] > 0);
            self.locals[i] += 1;
        }
    }

    /// Drop a reference to a frame position; a local slot whose count hits
    /// zero returns to the free pool.
    fn release(&mut self, index: FrameIndex) {
        if let FrameIndex::Local(i) = index {
            debug_assert!(self.locals[i] > 0);
            self.locals[i] -= 1;
        }
    }

    fn release_opt(&mut self, index: Option<FrameIndex>) {
        if let Some(index) = index {
            self.release(index);
        }
    }

    /// Push a variable onto the De Bruijn stack, taking ownership of its
    /// reference
    fn push_var(&mut self, var: Option<FrameIndex>) {
        self.vars.push(var);
    }

    /// Pop the innermost variable, dropping its reference
    fn pop_var(&mut self) {
        let var = self.vars.pop().expect("pop from empty var stack");
        self.release_opt(var);
    }

    /// Look up a variable. Local index 0 is the innermost binding.
    fn get_var(&self, index: VarIndex) -> FrameIndex {
        match index.source {
            VarSource::Local => {
                let position = self
                    .vars
                    .len()
                    .checked_sub(1 + index.index)
                    .expect("local variable index out of range");
                self.vars[position].expect("reference to a variable before its definition")
            }
            VarSource::Static => {
                debug_assert!(index.index < self.code.statics);
                FrameIndex::Static(index.index)
            }
        }
    }

    /// Replace the variable at an absolute stack position, dropping the
    /// previous reference and taking ownership of the new one
    fn set_var(&mut self, position: usize, var: FrameIndex) {
        let old = self.vars[position].replace(var);
        self.release_opt(old);
    }

    /// Append an instruction, attaching any pending profile operations
    fn append(&mut self, op: Op) {
        let profile_ops = std::mem::take(&mut self.pending_profile_ops);
        self.code.instrs.push(Instr { profile_ops, op });
    }

    /// Queue a profile operation for the next emitted instruction
    fn append_profile_op(&mut self, op: ProfileOp) {
        self.pending_profile_ops.push(op);
    }

    /// Finish the scope, yielding its code. Pending profile ops with no
    /// instruction to carry them are dropped.
    fn finish(self) -> Code {
        self.code
    }
}

/// The stack of profiling blocks enclosing the expression being compiled.
struct Blocks<'a> {
    stack: Vec<BlockId>,
    profile: &'a mut Profile,
}

impl<'a> Blocks<'a> {
    fn new(profile: &'a mut Profile) -> Self {
        Blocks {
            stack: Vec::new(),
            profile,
        }
    }

    fn current_name(&self) -> &str {
        match self.stack.last() {
            Some(&id) => &self.profile.block(id).name.name,
            None => "",
        }
    }

    /// Enter a block named by appending `.name` to the current block path.
    /// Emits a pending enter op into `scope`.
    fn enter(&mut self, name: &Name, loc: &Loc, scope: &mut Scope) -> BlockId {
        let current = self.current_name();
        let mut path = String::with_capacity(current.len() + name.name.len() + 2);
        if !current.is_empty() {
            path.push_str(current);
            path.push('.');
        }
        path.push_str(&name.name);
        if name.space == Namespace::Type {
            path.push('@');
        }

        let id = self
            .profile
            .add_block(Name::normal(path, loc.clone()));
        scope.append_profile_op(ProfileOp::Enter(id));
        self.stack.push(id);
        id
    }

    /// Enter the body block of a function, named by appending `!` to the
    /// current block path. Body blocks run when the function is called, not
    /// where it is defined.
    fn enter_body(&mut self, loc: &Loc, scope: &mut Scope) -> BlockId {
        let mut path = self.current_name().to_string();
        path.push('!');

        let id = self
            .profile
            .add_block(Name::normal(path, loc.clone()));
        scope.append_profile_op(ProfileOp::Enter(id));
        self.stack.push(id);
        id
    }

    /// Exit the current block. When `exit` is set the frame is being left by
    /// a tail instruction that already unwinds the profile stack, so no exit
    /// op is emitted.
    fn exit(&mut self, scope: &mut Scope, exit: bool) {
        debug_assert!(!self.stack.is_empty());
        self.stack.pop();
        if !exit {
            scope.append_profile_op(ProfileOp::Exit);
        }
    }
}

/// If in tail position, return `result` from the frame, exiting the current
/// profile block on the way out.
fn compile_exit(exit: bool, scope: &mut Scope, result: Option<FrameIndex>) {
    if exit {
        if let Some(result) = result {
            scope.append_profile_op(ProfileOp::Exit);
            scope.append(Op::Return { result });
        }
    }
}

/// Compile one expression, emitting instructions that leave its value in the
/// returned frame position. In tail position (`exit`) the value is returned
/// from the frame instead and the result is `None` for cases that terminate
/// directly.
fn compile_expr(
    blocks: &mut Blocks<'_>,
    exit: bool,
    scope: &mut Scope,
    tc: &Tc,
) -> Option<FrameIndex> {
    match tc {
        Tc::TypeValue => {
            let local = scope.new_local();
            scope.append(Op::TypeValue { dest: local });
            let result = Some(FrameIndex::Local(local));
            compile_exit(exit, scope, result);
            result
        }

        Tc::Var(index) => {
            let var = scope.get_var(*index);
            scope.retain(var);
            compile_exit(exit, scope, Some(var));
            Some(var)
        }

        Tc::Let {
            recursive,
            bindings,
            body,
        } => compile_let(blocks, exit, scope, *recursive, bindings, body),

        Tc::StructValue { fields } => {
            let args: Vec<FrameIndex> = fields
                .iter()
                .map(|field| {
                    compile_expr(blocks, false, scope, field).expect("field has no value")
                })
                .collect();

            let local = scope.new_local();
            scope.append(Op::StructValue {
                args: args.clone(),
                dest: local,
            });
            let result = Some(FrameIndex::Local(local));
            compile_exit(exit, scope, result);
            for arg in args {
                scope.release(arg);
            }
            result
        }

        Tc::UnionValue { tag, arg } => {
            let arg = compile_expr(blocks, false, scope, arg).expect("arg has no value");

            let local = scope.new_local();
            scope.append(Op::UnionValue {
                tag: *tag,
                arg,
                dest: local,
            });
            let result = Some(FrameIndex::Local(local));
            compile_exit(exit, scope, result);
            scope.release(arg);
            result
        }

        Tc::UnionSelect {
            condition,
            loc,
            choices,
        } => compile_select(blocks, exit, scope, condition, loc, choices),

        Tc::DataAccess {
            datatype,
            obj,
            tag,
            loc,
        } => {
            let obj = compile_expr(blocks, false, scope, obj).expect("object has no value");

            let local = scope.new_local();
            let op = match datatype {
                DataType::Struct => Op::StructAccess {
                    obj,
                    tag: *tag,
                    dest: local,
                    loc: loc.clone(),
                },
                DataType::Union => Op::UnionAccess {
                    obj,
                    tag: *tag,
                    dest: local,
                    loc: loc.clone(),
                },
            };
            scope.append(op);
            let result = Some(FrameIndex::Local(local));
            compile_exit(exit, scope, result);
            scope.release(obj);
            result
        }

        Tc::FuncValue {
            body_loc,
            scope: captured,
            argc,
            body,
        } => {
            let capture: Vec<FrameIndex> =
                captured.iter().map(|&var| scope.get_var(var)).collect();

            let mut func_scope = Scope::new(*argc, captured.len());
            let body_block = blocks.enter_body(body_loc, &mut func_scope);
            func_scope.code.profile_block_id = body_block;

            for _ in 0..*argc {
                let arg = func_scope.new_local();
                func_scope.push_var(Some(FrameIndex::Local(arg)));
            }

            let body_result = compile_expr(blocks, true, &mut func_scope, body);
            blocks.exit(&mut func_scope, true);
            func_scope.release_opt(body_result);
            let code = Arc::new(func_scope.finish());

            let local = scope.new_local();
            scope.append(Op::FuncValue {
                code,
                scope: capture,
                dest: local,
            });
            let result = Some(FrameIndex::Local(local));
            compile_exit(exit, scope, result);
            result
        }

        Tc::FuncApply { func, args, loc } => {
            let func = compile_expr(blocks, false, scope, func).expect("function has no value");
            let args: Vec<FrameIndex> = args
                .iter()
                .map(|arg| compile_expr(blocks, false, scope, arg).expect("arg has no value"))
                .collect();

            if exit {
                scope.append_profile_op(ProfileOp::AutoExit);
            }
            let dest = if exit { None } else { Some(scope.new_local()) };

            scope.append(Op::Call {
                func,
                args: args.clone(),
                dest: dest.unwrap_or(0),
                exit,
                loc: loc.clone(),
            });

            scope.release(func);
            for arg in args {
                scope.release(arg);
            }
            dest.map(FrameIndex::Local)
        }

        Tc::Link { body, .. } => {
            let get = scope.new_local();
            scope.push_var(Some(FrameIndex::Local(get)));
            let put = scope.new_local();
            scope.push_var(Some(FrameIndex::Local(put)));
            scope.append(Op::Link { get, put });

            let result = compile_expr(blocks, exit, scope, body);

            scope.pop_var();
            scope.pop_var();
            result
        }

        Tc::Exec { bindings, body } => {
            let args: Vec<FrameIndex> = bindings
                .iter()
                .map(|binding| {
                    blocks.enter(&binding.profile_name, &binding.profile_loc, scope);
                    let arg = compile_expr(blocks, false, scope, &binding.tc)
                        .expect("binding has no value");
                    blocks.exit(scope, false);
                    arg
                })
                .collect();

            // Result slots must not alias the argument slots, so allocate
            // them before the arguments are released.
            let dests: Vec<LocalIndex> = bindings
                .iter()
                .map(|_| {
                    let dest = scope.new_local();
                    scope.push_var(Some(FrameIndex::Local(dest)));
                    dest
                })
                .collect();

            scope.append(Op::Fork {
                args: args.clone(),
                dests,
            });
            for arg in args {
                scope.release(arg);
            }

            let result = compile_expr(blocks, exit, scope, body);

            for _ in bindings {
                scope.pop_var();
            }
            result
        }

        Tc::Profile { name, loc, body } => {
            blocks.enter(name, loc, scope);
            let result = compile_expr(blocks, exit, scope, body);
            blocks.exit(scope, exit);
            result
        }
    }
}

fn compile_let(
    blocks: &mut Blocks<'_>,
    exit: bool,
    scope: &mut Scope,
    recursive: bool,
    bindings: &[LetBinding],
    body: &Tc,
) -> Option<FrameIndex> {
    let base = scope.vars.len();

    // Recursive bindings get a ref cell each up front so the definitions can
    // see one another; non-recursive bindings come into scope only once
    // defined.
    let mut refs: Vec<Option<LocalIndex>> = Vec::with_capacity(bindings.len());
    for _ in bindings {
        if recursive {
            let local = scope.new_local();
            scope.append(Op::RefValue { dest: local });
            scope.push_var(Some(FrameIndex::Local(local)));
            refs.push(Some(local));
        } else {
            scope.push_var(None);
            refs.push(None);
        }
    }

    let defs: Vec<FrameIndex> = bindings
        .iter()
        .map(|binding| {
            blocks.enter(&binding.profile_name, &binding.profile_loc, scope);
            let def =
                compile_expr(blocks, false, scope, &binding.tc).expect("binding has no value");
            blocks.exit(scope, false);
            def
        })
        .collect();

    for (i, (binding, &def)) in bindings.iter().zip(&defs).enumerate() {
        if recursive {
            scope.append(Op::RefDef {
                r#ref: refs[i].expect("recursive binding without a ref"),
                value: def,
                loc: binding.var.loc.clone(),
            });
        }
        scope.set_var(base + i, def);
    }

    let result = compile_expr(blocks, exit, scope, body);

    for _ in bindings {
        scope.pop_var();
    }
    result
}

fn compile_select(
    blocks: &mut Blocks<'_>,
    exit: bool,
    scope: &mut Scope,
    condition: &Tc,
    loc: &Loc,
    choices: &[TcProfiled],
) -> Option<FrameIndex> {
    let condition =
        compile_expr(blocks, false, scope, condition).expect("condition has no value");

    if exit {
        scope.append_profile_op(ProfileOp::AutoExit);
    }

    let select_index = scope.code.instrs.len();
    scope.append(Op::UnionSelect {
        condition,
        jumps: SmallVec::new(),
        loc: loc.clone(),
    });
    // Branch offsets are relative to the instruction after the select.
    let select_base = select_index + 1;

    let target = if exit { None } else { Some(scope.new_local()) };
    let mut offsets: Vec<usize> = Vec::with_capacity(choices.len());
    let mut exit_jumps: Vec<usize> = Vec::new();

    for (i, choice) in choices.iter().enumerate() {
        // Default branches share a subtree; generate it once and reuse its
        // offset for every tag that points at it.
        if let Some(done) = choices[..i]
            .iter()
            .position(|earlier| Rc::ptr_eq(&earlier.tc, &choice.tc))
        {
            offsets.push(offsets[done]);
            continue;
        }

        offsets.push(scope.code.instrs.len() - select_base);

        blocks.enter(&choice.profile_name, &choice.profile_loc, scope);
        let branch = compile_expr(blocks, exit, scope, &choice.tc);
        blocks.exit(scope, exit);

        if let Some(target) = target {
            let branch = branch.expect("branch has no value");
            scope.append(Op::Copy {
                src: branch,
                dest: target,
            });
            scope.release(branch);

            exit_jumps.push(scope.code.instrs.len());
            scope.append(Op::Jump { count: 0 });
        } else {
            // The branch already returned from the frame; it may still have
            // produced a nominal result position to let go of.
            scope.release_opt(branch);
        }
    }

    // Patch the jumps past the select now that all branches are generated.
    let end = scope.code.instrs.len();
    for jump_index in exit_jumps {
        match &mut scope.code.instrs[jump_index].op {
            Op::Jump { count } => *count = end - (jump_index + 1),
            _ => unreachable!("patched instruction is not a jump"),
        }
    }
    match &mut scope.code.instrs[select_index].op {
        Op::UnionSelect { jumps, .. } => *jumps = SmallVec::from_vec(offsets),
        _ => unreachable!("patched instruction is not a select"),
    }

    scope.release(condition);
    target.map(FrameIndex::Local)
}

/// Compile a type-checked expression into a function body of `argc`
/// arguments.
///
/// `name` labels the top-level profile block. With no profile supplied, a
/// scratch profile is used internally so block emission needs no special
/// casing.
pub fn compile(
    argc: usize,
    tc: &Tc,
    name: &Name,
    profile: Option<&mut Profile>,
) -> Arc<Code> {
    let mut scratch = Profile::new();
    let profile = profile.unwrap_or(&mut scratch);
    let first_block = profile.len();

    let mut blocks = Blocks::new(profile);
    let mut scope = Scope::new(argc, 0);
    for _ in 0..argc {
        let arg = scope.new_local();
        scope.push_var(Some(FrameIndex::Local(arg)));
    }

    // The top-level expression behaves like a function body: it exits its
    // profile block as it returns, so wrap it in one.
    let root_block = blocks.enter(name, &name.loc, &mut scope);
    scope.code.profile_block_id = root_block;
    let result = compile_expr(&mut blocks, true, &mut scope, tc);
    blocks.exit(&mut scope, true);
    scope.release_opt(result);
    debug_assert!(blocks.stack.is_empty());

    let mut code = scope.finish();
    code.profile_blocks = blocks.profile.blocks()[first_block..]
        .iter()
        .map(|block| block.name.clone())
        .collect();

    debug!(
        target: "rill::compile",
        name = %name,
        instrs = code.instrs.len(),
        locals = code.locals,
        blocks = code.profile_blocks.len(),
        "compiled function"
    );
    Arc::new(code)
}

/// Compile a program: one code object per module, each a function of its
/// dependency values.
pub fn compile_program(
    modules: &[TcModule],
    mut profile: Option<&mut Profile>,
) -> CompiledProgram {
    let compiled = modules
        .iter()
        .map(|module| {
            let label = module.path.label();
            let code = compile(
                module.deps.len(),
                &module.tc,
                &label,
                profile.as_deref_mut(),
            );
            CompiledModule {
                path: module.path.clone(),
                deps: module.deps.clone(),
                code,
            }
        })
        .collect::<Vec<_>>();

    debug!(
        target: "rill::compile",
        modules = %compiled.iter().map(|m| m.path.to_string()).join(", "),
        "compiled program"
    );
    CompiledProgram { modules: compiled }
}
