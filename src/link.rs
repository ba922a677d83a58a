//! The linker: assembles per-module executables into one callable value.
//!
//! Each module executable is a function of its dependency values. The linker
//! wraps every module in a function value, then synthesizes a driver function
//! that calls each module in order (feeding every call the locals holding
//! its already-computed dependencies), releases intermediates, and returns
//! the last module's value. Well-formed module lists are topologically
//! sorted; detecting a dependency that is missing or not yet computed is the
//! linker's job.

use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use tracing::debug;

use crate::code::{Code, FrameIndex, Instr, Op};
use crate::compile::CompiledProgram;
use crate::exec::Executable;
use crate::heap::Heap;
use crate::name::{Loc, ModulePath, Name};
use crate::profile::Profile;
use crate::value::{new_func_value, ValueRef};

/// A module ready to link: its path, dependency paths, and executable body.
///
/// The executable takes `deps.len()` arguments and captures nothing.
#[derive(Debug)]
pub struct ExecutableModule {
    pub path: ModulePath,
    pub deps: Vec<ModulePath>,
    pub executable: Arc<dyn Executable>,
}

/// An executable program: modules in dependency order.
#[derive(Debug, Default)]
pub struct ExecutableProgram {
    pub modules: Vec<ExecutableModule>,
}

/// Lift a compiled program into an executable one, interpreting each
/// module's code.
pub fn interpret(program: &CompiledProgram) -> ExecutableProgram {
    ExecutableProgram {
        modules: program
            .modules
            .iter()
            .map(|module| ExecutableModule {
                path: module.path.clone(),
                deps: module.deps.clone(),
                executable: Arc::clone(&module.code) as Arc<dyn Executable>,
            })
            .collect(),
    }
}

/// Linker error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The program has no modules to link
    EmptyProgram,
    /// A module depends on a module that is not linked before it
    UnresolvedDep { module: ModulePath, dep: ModulePath },
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyProgram => write!(f, "no modules to link"),
            Self::UnresolvedDep { module, dep } => {
                write!(f, "module {} depends on unlinked module {}", module, dep)
            }
        }
    }
}

impl std::error::Error for LinkError {}

/// Result type for linking
pub type LinkResult<T> = Result<T, LinkError>;

/// Link the program into a single zero-argument function value computing the
/// last module's value. The returned value carries one root owned by the
/// caller.
pub fn link(
    heap: &mut Heap,
    program: &ExecutableProgram,
    profile: Option<&mut Profile>,
) -> LinkResult<ValueRef> {
    let modulec = program.modules.len();
    if modulec == 0 {
        return Err(LinkError::EmptyProgram);
    }

    let main_block = match profile {
        Some(profile) => profile.add_block(Name::normal("<main>", Loc::builtin())),
        None => 0,
    };

    // The driver calls module i's function (static i) with the locals
    // holding its dependencies, storing the module value in local i.
    let mut code = Code::new(0, modulec, modulec, main_block);
    for (i, module) in program.modules.iter().enumerate() {
        debug_assert_eq!(module.executable.statics(), 0);
        debug_assert_eq!(module.executable.args(), module.deps.len());

        let args = module
            .deps
            .iter()
            .map(|dep| {
                program.modules[..i]
                    .iter()
                    .find_position(|earlier| &earlier.path == dep)
                    .map(|(index, _)| FrameIndex::Local(index))
                    .ok_or_else(|| LinkError::UnresolvedDep {
                        module: module.path.clone(),
                        dep: dep.clone(),
                    })
            })
            .collect::<LinkResult<Vec<FrameIndex>>>()?;

        code.instrs.push(Instr::new(Op::Call {
            func: FrameIndex::Static(i),
            args,
            dest: i,
            exit: false,
            loc: Loc::builtin(),
        }));
    }
    for i in 0..modulec - 1 {
        code.instrs.push(Instr::new(Op::Release { target: i }));
    }
    code.instrs.push(Instr::new(Op::Return {
        result: FrameIndex::Local(modulec - 1),
    }));

    // One function value per module, then the driver wrapping them all.
    let funcs: Vec<ValueRef> = program
        .modules
        .iter()
        .map(|module| {
            new_func_value(
                heap,
                module.executable.args(),
                Arc::clone(&module.executable),
                &[],
            )
        })
        .collect();

    let linked = new_func_value(heap, 0, Arc::new(code), &funcs);
    for func in funcs {
        heap.release(func);
    }

    debug!(target: "rill::link", modules = modulec, "linked program");
    Ok(linked)
}
