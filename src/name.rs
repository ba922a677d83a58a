//! Names, source locations, and module paths.
//!
//! These are the identifier types shared by the whole stack: the loader hands
//! the core pre-built names and module paths, the compiler threads them into
//! profile blocks and diagnostics, and the linker resolves module dependencies
//! by path equality.

use std::fmt;
use std::sync::Arc;

/// A source location: file, line, and column.
///
/// Locations are carried on names, Tc nodes and instructions purely for
/// diagnostics. They are cheap to clone (the source string is shared).
#[derive(Debug, Clone)]
pub struct Loc {
    /// Source file (or other origin) of the location
    pub source: Arc<str>,
    /// 1-based line number
    pub line: u32,
    /// 1-based column number
    pub col: u32,
}

impl Loc {
    /// Create a new location
    pub fn new(source: impl Into<Arc<str>>, line: u32, col: u32) -> Self {
        Self {
            source: source.into(),
            line,
            col,
        }
    }

    /// A location for values synthesized by the runtime itself, with no
    /// corresponding source text.
    pub fn builtin() -> Self {
        Self::new("<builtin>", 0, 0)
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source, self.line, self.col)
    }
}

/// Which namespace a name lives in.
///
/// Normal names and type names never collide; the type namespace is rendered
/// with a trailing `@`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Normal,
    Type,
}

/// A name: a string plus its namespace and the location it was written at.
///
/// Names compare equal iff their strings match within the same namespace; the
/// location is metadata and does not participate in equality or hashing.
#[derive(Debug, Clone)]
pub struct Name {
    pub name: Arc<str>,
    pub space: Namespace,
    pub loc: Loc,
}

impl Name {
    /// Create a name in the normal namespace
    pub fn normal(name: impl Into<Arc<str>>, loc: Loc) -> Self {
        Self {
            name: name.into(),
            space: Namespace::Normal,
            loc,
        }
    }

    /// Create a name in the type namespace
    pub fn type_name(name: impl Into<Arc<str>>, loc: Loc) -> Self {
        Self {
            name: name.into(),
            space: Namespace::Type,
            loc,
        }
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.space == other.space && self.name == other.name
    }
}

impl Eq for Name {}

impl std::hash::Hash for Name {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.space.hash(state);
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.space {
            Namespace::Normal => write!(f, "{}", self.name),
            Namespace::Type => write!(f, "{}@", self.name),
        }
    }
}

/// An ordered sequence of names identifying a module.
///
/// Paths are equal iff they have the same components, compared as names
/// (locations ignored).
#[derive(Debug, Clone)]
pub struct ModulePath {
    pub components: Vec<Name>,
    pub loc: Loc,
}

impl ModulePath {
    /// Create a module path from its component names
    pub fn new(components: Vec<Name>, loc: Loc) -> Self {
        Self { components, loc }
    }

    /// Convenience constructor for a path of normal-namespace components
    pub fn from_parts(parts: &[&str], loc: Loc) -> Self {
        let components = parts
            .iter()
            .map(|p| Name::normal(*p, loc.clone()))
            .collect();
        Self { components, loc }
    }

    /// A name labelling this module, used for its top-level profile block
    pub fn label(&self) -> Name {
        Name::normal(self.to_string(), self.loc.clone())
    }
}

impl PartialEq for ModulePath {
    fn eq(&self, other: &Self) -> bool {
        self.components == other.components
    }
}

impl Eq for ModulePath {}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for component in &self.components {
            write!(f, "/{}", component)?;
        }
        write!(f, "%")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_equality_ignores_loc() {
        let a = Name::normal("x", Loc::new("a.rill", 1, 1));
        let b = Name::normal("x", Loc::new("b.rill", 9, 9));
        assert_eq!(a, b);
    }

    #[test]
    fn test_name_equality_respects_namespace() {
        let loc = Loc::builtin();
        let normal = Name::normal("Bool", loc.clone());
        let typed = Name::type_name("Bool", loc);
        assert_ne!(normal, typed);
    }

    #[test]
    fn test_name_display() {
        let loc = Loc::builtin();
        assert_eq!(Name::normal("f", loc.clone()).to_string(), "f");
        assert_eq!(Name::type_name("Bool", loc).to_string(), "Bool@");
    }

    #[test]
    fn test_module_path_equality() {
        let a = ModulePath::from_parts(&["Core", "Bool"], Loc::new("x", 1, 1));
        let b = ModulePath::from_parts(&["Core", "Bool"], Loc::new("y", 2, 2));
        let c = ModulePath::from_parts(&["Core", "Unit"], Loc::builtin());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_module_path_display() {
        let path = ModulePath::from_parts(&["Core", "Bool"], Loc::builtin());
        assert_eq!(path.to_string(), "/Core/Bool%");
    }
}
