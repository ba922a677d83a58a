//! Shared helpers for the end-to-end tests: a small Tc construction kit and
//! evaluation drivers.

#![allow(dead_code)]

use std::rc::Rc;

use rill::compile::compile;
use rill::exec::{apply, eval_with_config, AbortKind, EvalConfig, EvalError, EvalResult, NoIo};
use rill::heap::Heap;
use rill::name::{Loc, Name};
use rill::tc::{DataType, LetBinding, Tc, TcProfiled, VarIndex};
use rill::value::{new_func_value, new_union_value, new_unit_value, Value, ValueRef};

pub fn loc() -> Loc {
    Loc::builtin()
}

pub fn nm(s: &str) -> Name {
    Name::normal(s, loc())
}

pub fn unit() -> Tc {
    Tc::StructValue { fields: vec![] }
}

/// A local variable reference; index 0 is the innermost binding.
pub fn var(index: usize) -> Tc {
    Tc::Var(VarIndex::local(index))
}

/// A static (captured) variable reference.
pub fn svar(index: usize) -> Tc {
    Tc::Var(VarIndex::static_(index))
}

pub fn pair(a: Tc, b: Tc) -> Tc {
    Tc::StructValue { fields: vec![a, b] }
}

pub fn structv(fields: Vec<Tc>) -> Tc {
    Tc::StructValue { fields }
}

pub fn union(tag: usize, arg: Tc) -> Tc {
    Tc::UnionValue {
        tag,
        arg: arg.boxed(),
    }
}

/// An enum-like value: a union over unit.
pub fn enumv(tag: usize) -> Tc {
    union(tag, unit())
}

pub fn select(condition: Tc, choices: Vec<Tc>) -> Tc {
    Tc::UnionSelect {
        condition: condition.boxed(),
        loc: loc(),
        choices: choices
            .into_iter()
            .enumerate()
            .map(|(i, tc)| TcProfiled {
                profile_name: nm(&format!("branch{}", i)),
                profile_loc: loc(),
                tc: Rc::new(tc),
            })
            .collect(),
    }
}

pub fn struct_access(obj: Tc, tag: usize) -> Tc {
    Tc::DataAccess {
        datatype: DataType::Struct,
        obj: obj.boxed(),
        tag,
        loc: loc(),
    }
}

pub fn union_access(obj: Tc, tag: usize) -> Tc {
    Tc::DataAccess {
        datatype: DataType::Union,
        obj: obj.boxed(),
        tag,
        loc: loc(),
    }
}

pub fn func(scope: Vec<VarIndex>, argc: usize, body: Tc) -> Tc {
    Tc::FuncValue {
        body_loc: loc(),
        scope,
        argc,
        body: body.boxed(),
    }
}

pub fn app(f: Tc, args: Vec<Tc>) -> Tc {
    Tc::FuncApply {
        func: f.boxed(),
        args,
        loc: loc(),
    }
}

pub fn let_(recursive: bool, bindings: Vec<(&str, Tc)>, body: Tc) -> Tc {
    Tc::Let {
        recursive,
        bindings: bindings
            .into_iter()
            .map(|(name, tc)| LetBinding {
                var: nm(name),
                profile_name: nm(name),
                profile_loc: loc(),
                tc,
            })
            .collect(),
        body: body.boxed(),
    }
}

pub fn link(body: Tc) -> Tc {
    Tc::Link {
        get: nm("get"),
        put: nm("put"),
        body: body.boxed(),
    }
}

pub fn exec(bindings: Vec<Tc>, body: Tc) -> Tc {
    Tc::Exec {
        bindings: bindings
            .into_iter()
            .enumerate()
            .map(|(i, tc)| TcProfiled {
                profile_name: nm(&format!("proc{}", i)),
                profile_loc: loc(),
                tc: Rc::new(tc),
            })
            .collect(),
        body: body.boxed(),
    }
}

/// A heap together with the outcome of evaluating a program on it.
pub struct Evaluated {
    pub heap: Heap,
    pub result: EvalResult<ValueRef>,
}

/// Compile a closed expression and evaluate it.
pub fn eval_tc(tc: &Tc) -> Evaluated {
    eval_tc_with(tc, &EvalConfig::default())
}

/// Compile a closed expression and evaluate it under a custom config.
pub fn eval_tc_with(tc: &Tc, config: &EvalConfig) -> Evaluated {
    let code = compile(0, tc, &nm("Main"), None);
    let mut heap = Heap::new();
    let program = new_func_value(&mut heap, 0, code, &[]);
    let result = eval_with_config(&mut heap, &mut NoIo, program, &[], None, config);
    heap.release(program);
    Evaluated { heap, result }
}

/// Compile a one-argument expression and apply it to a host-built value.
pub fn apply_tc(tc: &Tc, build_arg: impl FnOnce(&mut Heap) -> ValueRef) -> Evaluated {
    let code = compile(1, tc, &nm("Main"), None);
    let mut heap = Heap::new();
    let program = new_func_value(&mut heap, 1, code, &[]);
    let arg = build_arg(&mut heap);
    let result = apply(&mut heap, program, &[arg], None);
    heap.release(arg);
    heap.release(program);
    Evaluated { heap, result }
}

pub fn expect_value(evaluated: &Evaluated) -> ValueRef {
    *evaluated
        .result
        .as_ref()
        .unwrap_or_else(|e| panic!("evaluation failed: {}", e))
}

pub fn expect_error(evaluated: &Evaluated) -> EvalError {
    match &evaluated.result {
        Ok(_) => panic!("evaluation unexpectedly succeeded"),
        Err(e) => e.clone(),
    }
}

pub fn expect_abort(evaluated: &Evaluated) -> AbortKind {
    match expect_error(evaluated) {
        EvalError::Aborted(error) => error.kind,
        other => panic!("expected abort, got {}", other),
    }
}

pub fn assert_unit(heap: &Heap, value: ValueRef) {
    match heap.get(value) {
        Value::Struct { fields } => assert!(fields.is_empty(), "expected unit struct"),
        other => panic!("expected unit, got {}", other.kind()),
    }
}

pub fn union_tag(heap: &Heap, value: ValueRef) -> usize {
    match heap.get(value) {
        Value::Union { tag, .. } => *tag,
        other => panic!("expected union, got {}", other.kind()),
    }
}

pub fn union_arg(heap: &Heap, value: ValueRef) -> ValueRef {
    match heap.get(value) {
        Value::Union { arg, .. } => *arg,
        other => panic!("expected union, got {}", other.kind()),
    }
}

pub fn struct_field(heap: &Heap, value: ValueRef, index: usize) -> ValueRef {
    match heap.get(value) {
        Value::Struct { fields } => fields[index],
        other => panic!("expected struct, got {}", other.kind()),
    }
}

/// Build the natural number `n` as nested unions: S^n(Z).
pub fn make_nat(heap: &mut Heap, n: usize) -> ValueRef {
    let unit = new_unit_value(heap);
    let mut value = new_union_value(heap, 0, unit);
    heap.release(unit);
    for _ in 0..n {
        let next = new_union_value(heap, 1, value);
        heap.release(value);
        value = next;
    }
    value
}

/// Count the S layers of a natural number value.
pub fn nat_depth(heap: &Heap, value: ValueRef) -> usize {
    let mut depth = 0;
    let mut current = heap.strict(value).expect("undefined nat");
    loop {
        match heap.get(current) {
            Value::Union { tag: 1, arg } => {
                depth += 1;
                current = heap.strict(*arg).expect("undefined nat");
            }
            Value::Union { tag: 0, .. } => return depth,
            other => panic!("expected nat, got {}", other.kind()),
        }
    }
}
