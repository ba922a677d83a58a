//! Rill - compiler core and virtual machine for a typed functional process
//! language.
//!
//! This library is the core of the rill implementation stack: it takes
//! type-checked expression trees from the (external) front end, compiles them
//! to a register/stack bytecode, links per-module functions into a single
//! callable value, and executes it on a cooperative multithreaded evaluator
//! over a tracing, cycle-safe value heap.
//!
//! # Architecture
//!
//! The pipeline runs in four stages:
//!
//! 1. **Tc trees** (`tc` module): the type checker's output, where variables
//!    carry De Bruijn indices, types are erased, and processes are
//!    zero-argument functions.
//! 2. **Compilation** (`compile` module): each function body lowers to a
//!    [`Code`](code::Code) object, a linear instruction stream over an
//!    explicit frame of statics and locals, with profile operations
//!    scheduled onto the instructions they precede.
//! 3. **Linking** (`link` module): per-module code objects are wrapped in
//!    function values and stitched together by a synthesized driver function
//!    that resolves dependencies by module path.
//! 4. **Execution** (`exec` module): the scheduler round-robins cooperative
//!    threads over a shared [`Heap`](heap::Heap); threads block on links,
//!    ports, and fork joins, and a host [`Io`](exec::Io) callback bridges
//!    port values to the outside world between rounds.
//!
//! # Example
//!
//! ```rust
//! use rill::compile::compile;
//! use rill::exec::eval;
//! use rill::heap::Heap;
//! use rill::name::{Loc, Name};
//! use rill::tc::Tc;
//! use rill::value::{new_func_value, Value};
//!
//! // Compile and evaluate the unit expression.
//! let tc = Tc::StructValue { fields: vec![] };
//! let name = Name::normal("Main", Loc::builtin());
//! let code = compile(0, &tc, &name, None);
//!
//! let mut heap = Heap::new();
//! let program = new_func_value(&mut heap, 0, code, &[]);
//! let result = eval(&mut heap, program, None).unwrap();
//! assert!(matches!(heap.get(result), Value::Struct { fields } if fields.is_empty()));
//! ```

pub mod code;
pub mod compile;
pub mod exec;
pub mod heap;
pub mod link;
pub mod name;
pub mod profile;
pub mod tc;
pub mod value;

pub use exec::{
    apply, eval, exec_proc, AbortKind, EvalConfig, EvalError, ExecStatus, Executable, Io, NoIo,
    RuntimeError,
};
pub use heap::{Heap, HeapStats};
pub use link::{link, LinkError};
pub use profile::Profile;
pub use value::{Value, ValueRef};
