use std::rc::Rc;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use rill::compile::compile;
use rill::exec::apply;
use rill::heap::Heap;
use rill::name::{Loc, Name};
use rill::tc::{DataType, LetBinding, Tc, TcProfiled, VarIndex};
use rill::value::{new_func_value, new_union_value, new_unit_value, ValueRef};

/// Benchmarks of the interpreter on recursion-heavy workloads: a tail loop
/// counting a natural number down, and a non-tail recursion summing one.

fn unit() -> Tc {
    Tc::StructValue { fields: vec![] }
}

fn var(index: usize) -> Tc {
    Tc::Var(VarIndex::local(index))
}

fn choice(tc: Tc) -> TcProfiled {
    TcProfiled {
        profile_name: Name::normal("branch", Loc::builtin()),
        profile_loc: Loc::builtin(),
        tc: Rc::new(tc),
    }
}

/// let rec f = \n -> select(n; <zero branch>, <succ branch>); f(arg)
fn recursive_program(zero: Tc, succ: Tc) -> Tc {
    let body = Tc::UnionSelect {
        condition: var(0).boxed(),
        loc: Loc::builtin(),
        choices: vec![choice(zero), choice(succ)],
    };
    Tc::Let {
        recursive: true,
        bindings: vec![LetBinding {
            var: Name::normal("f", Loc::builtin()),
            profile_name: Name::normal("f", Loc::builtin()),
            profile_loc: Loc::builtin(),
            tc: Tc::FuncValue {
                body_loc: Loc::builtin(),
                scope: vec![VarIndex::local(0)],
                argc: 1,
                body: body.boxed(),
            },
        }],
        body: Tc::FuncApply {
            func: var(0).boxed(),
            args: vec![var(1)],
            loc: Loc::builtin(),
        }
        .boxed(),
    }
}

fn pred(n: Tc) -> Tc {
    Tc::DataAccess {
        datatype: DataType::Union,
        obj: n.boxed(),
        tag: 1,
        loc: Loc::builtin(),
    }
}

fn make_nat(heap: &mut Heap, n: usize) -> ValueRef {
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

fn bench_countdown(c: &mut Criterion) {
    // Tail-recursive: loop(n) = select(n; Unit, loop(n.1))
    let tc = recursive_program(
        unit(),
        Tc::FuncApply {
            func: Tc::Var(VarIndex::static_(0)).boxed(),
            args: vec![pred(var(0))],
            loc: Loc::builtin(),
        },
    );
    let code = compile(1, &tc, &Name::normal("countdown", Loc::builtin()), None);

    let mut group = c.benchmark_group("countdown");
    for n in [1_000usize, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let mut heap = Heap::new();
                let program = new_func_value(&mut heap, 1, Arc::clone(&code), &[]);
                let arg = make_nat(&mut heap, n);
                let result = apply(&mut heap, program, &[arg], None).unwrap();
                black_box(heap.get(result).kind());
            });
        });
    }
    group.finish();
}

fn bench_double(c: &mut Criterion) {
    // Non-tail: double(n) = select(n; Z, S(S(double(n.1)))) exercises frame
    // push/pop and allocation.
    let succ = Tc::UnionValue {
        tag: 1,
        arg: Tc::UnionValue {
            tag: 1,
            arg: Tc::FuncApply {
                func: Tc::Var(VarIndex::static_(0)).boxed(),
                args: vec![pred(var(0))],
                loc: Loc::builtin(),
            }
            .boxed(),
        }
        .boxed(),
    };
    let tc = recursive_program(Tc::UnionValue { tag: 0, arg: unit().boxed() }, succ);
    let code = compile(1, &tc, &Name::normal("double", Loc::builtin()), None);

    c.bench_function("double/10_000", |b| {
        b.iter(|| {
            let mut heap = Heap::new();
            let program = new_func_value(&mut heap, 1, Arc::clone(&code), &[]);
            let arg = make_nat(&mut heap, 10_000);
            let result = apply(&mut heap, program, &[arg], None).unwrap();
            black_box(heap.get(result).kind());
        });
    });
}

criterion_group!(benches, bench_countdown, bench_double);
criterion_main!(benches);
