//! Runtime error types for the evaluator.
//!
//! Aborts carry a structured kind plus the source location of the failing
//! instruction. The kind renders to the plain-text message written to the
//! diagnostic stream; the scheduler surfaces the whole error to the caller
//! through [`EvalError`](crate::exec::EvalError).

use std::fmt;

use crate::name::Loc;

/// Why a thread aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortKind {
    /// A struct access dereferenced an undefined value
    UndefinedStructAccess,
    /// A union access dereferenced an undefined value
    UndefinedUnionAccess,
    /// A union access named a field the value does not carry
    WrongUnionTag { expected: usize, got: usize },
    /// A union select dereferenced an undefined value
    UndefinedSelect,
    /// A call dereferenced an undefined function value
    UndefinedFunction,
    /// A get or put proc dereferenced an undefined port value
    UndefinedPort,
    /// A fork dereferenced an undefined process value
    UndefinedProcess,
    /// A recursive binding reduced through ref cells back to its own cell
    VacuousValue,
}

impl fmt::Display for AbortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UndefinedStructAccess => write!(f, "undefined struct value access"),
            Self::UndefinedUnionAccess => write!(f, "undefined union value access"),
            Self::WrongUnionTag { expected, got } => {
                write!(
                    f,
                    "union field access undefined: wrong tag (expected {}, got {})",
                    expected, got
                )
            }
            Self::UndefinedSelect => write!(f, "undefined union value select"),
            Self::UndefinedFunction => write!(f, "called undefined function"),
            Self::UndefinedPort => write!(f, "undefined port dereference"),
            Self::UndefinedProcess => write!(f, "undefined process value"),
            Self::VacuousValue => write!(f, "vacuous value"),
        }
    }
}

/// A located runtime error.
///
/// Like [`Name`](crate::name::Name), the location is metadata: errors
/// compare equal by kind alone, so tests and callers can match on what went
/// wrong without reconstructing where.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: AbortKind,
    pub loc: Loc,
}

impl RuntimeError {
    pub fn new(kind: AbortKind, loc: Loc) -> Self {
        Self { kind, loc }
    }
}

impl PartialEq for RuntimeError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for RuntimeError {}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: error: {}", self.loc, self.kind)
    }
}

impl std::error::Error for RuntimeError {}
