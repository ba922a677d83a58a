//! The type-checked intermediate tree (Tc).
//!
//! Tc is what the external type checker produces and the bytecode compiler
//! consumes. Compared to the syntactic expression tree:
//! * variable names are replaced with De Bruijn indices,
//! * types are erased (only a zero-information `TypeValue` witness remains),
//! * processes are modelled as zero-argument functions, so link and exec
//!   expressions denote the result of running the process, not a process
//!   value.
//!
//! A Tc node owns its subtrees. The one exception is `UnionSelect`, whose
//! choices are reference counted so that several tags can share a single
//! default branch; code generation deduplicates shared branches by pointer
//! identity.

use std::rc::Rc;

use crate::name::{Loc, Name};

/// Where a variable lives relative to the current function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarSource {
    /// A local variable of the enclosing function. Index 0 is the innermost
    /// binding; each level outward increments the index, so with variables
    /// bound in the order `a`, `b`, `c`, index 0 names `c` and index 2
    /// names `a`.
    Local,
    /// A variable captured from the parent scope into the function's statics.
    Static,
}

/// Identifies a variable in scope by De Bruijn position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarIndex {
    pub source: VarSource,
    pub index: usize,
}

impl VarIndex {
    pub fn local(index: usize) -> Self {
        Self {
            source: VarSource::Local,
            index,
        }
    }

    pub fn static_(index: usize) -> Self {
        Self {
            source: VarSource::Static,
            index,
        }
    }
}

/// Whether a data access targets a struct field or a union field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Struct,
    Union,
}

/// One binding of a let expression.
///
/// `var` names the bound variable for profiling and diagnostics; the variable
/// itself is addressed by position.
#[derive(Debug)]
pub struct LetBinding {
    pub var: Name,
    pub profile_name: Name,
    pub profile_loc: Loc,
    pub tc: Tc,
}

/// A subtree together with the profile block it should be wrapped in.
///
/// Used for union select choices (where the subtree may be shared between
/// several tags) and exec bindings.
#[derive(Debug)]
pub struct TcProfiled {
    pub profile_name: Name,
    pub profile_loc: Loc,
    pub tc: Rc<Tc>,
}

/// A type-checked expression.
#[derive(Debug)]
pub enum Tc {
    /// The type value. Types are compile-time concepts; the value carries no
    /// information.
    TypeValue,

    /// A variable reference.
    Var(VarIndex),

    /// A let expression. When `recursive`, the bindings may refer to each
    /// other and to themselves; otherwise each binding sees only the earlier
    /// ones.
    Let {
        recursive: bool,
        bindings: Vec<LetBinding>,
        body: Box<Tc>,
    },

    /// A struct value expression.
    StructValue { fields: Vec<Tc> },

    /// A union value expression.
    UnionValue { tag: usize, arg: Box<Tc> },

    /// A union select expression. There is one choice per possible tag of the
    /// condition's type; several choices may share one subtree (default
    /// branches).
    UnionSelect {
        condition: Box<Tc>,
        loc: Loc,
        choices: Vec<TcProfiled>,
    },

    /// A struct or union field access.
    DataAccess {
        datatype: DataType,
        obj: Box<Tc>,
        tag: usize,
        loc: Loc,
    },

    /// A function (or process) value. `scope` lists the outer variables
    /// captured, in the order they become statics 0..n-1 of the function.
    FuncValue {
        body_loc: Loc,
        scope: Vec<VarIndex>,
        argc: usize,
        body: Box<Tc>,
    },

    /// A function application.
    FuncApply {
        func: Box<Tc>,
        args: Vec<Tc>,
        loc: Loc,
    },

    /// A link expression: binds fresh get and put port variables in the body
    /// (get is pushed first, then put). The names are for profiling only.
    Link {
        get: Name,
        put: Name,
        body: Box<Tc>,
    },

    /// An exec expression: runs the bindings as parallel sub-processes, binds
    /// their results as locals, then evaluates the body.
    Exec {
        bindings: Vec<TcProfiled>,
        body: Box<Tc>,
    },

    /// Wrap the body in a profiling block.
    Profile {
        name: Name,
        loc: Loc,
        body: Box<Tc>,
    },
}

impl Tc {
    /// Shorthand for a boxed subtree
    pub fn boxed(self) -> Box<Tc> {
        Box::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::Loc;

    fn unit() -> Tc {
        Tc::StructValue { fields: vec![] }
    }

    #[test]
    fn test_select_choice_sharing() {
        // Two tags sharing one default branch drop cleanly: the shared
        // subtree is freed exactly once by the Rc.
        let loc = Loc::builtin();
        let shared = Rc::new(unit());
        let select = Tc::UnionSelect {
            condition: Tc::Var(VarIndex::local(0)).boxed(),
            loc: loc.clone(),
            choices: vec![
                TcProfiled {
                    profile_name: Name::normal("T", loc.clone()),
                    profile_loc: loc.clone(),
                    tc: Rc::clone(&shared),
                },
                TcProfiled {
                    profile_name: Name::normal("F", loc.clone()),
                    profile_loc: loc.clone(),
                    tc: Rc::clone(&shared),
                },
            ],
        };
        assert_eq!(Rc::strong_count(&shared), 3);
        drop(select);
        assert_eq!(Rc::strong_count(&shared), 1);
    }

    #[test]
    fn test_var_index_constructors() {
        assert_eq!(
            VarIndex::local(2),
            VarIndex {
                source: VarSource::Local,
                index: 2
            }
        );
        assert_eq!(
            VarIndex::static_(0),
            VarIndex {
                source: VarSource::Static,
                index: 0
            }
        );
    }
}
