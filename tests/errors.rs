//! The runtime error taxonomy, raised end to end.
//!
//! Every abort kind here is produced by a compiled program rather than a
//! hand-built code object: a recursive let binding that inspects its own
//! still-untied ref cell is the one well-typed way to reach an undefined
//! value at runtime, so each test reads through the cell with a different
//! operation.

mod common;

use common::*;
use rill::exec::{AbortKind, EvalError};
use rill::name::Loc;
use rill::tc::{DataType, Tc};

#[test]
fn test_undefined_struct_access_aborts() {
    // let rec x = x.0; x
    let tc = let_(true, vec![("x", struct_access(var(0), 0))], var(0));
    let evaluated = eval_tc(&tc);
    assert_eq!(expect_abort(&evaluated), AbortKind::UndefinedStructAccess);
}

#[test]
fn test_undefined_union_access_aborts() {
    // let rec x = x.1; x
    let tc = let_(true, vec![("x", union_access(var(0), 1))], var(0));
    let evaluated = eval_tc(&tc);
    assert_eq!(expect_abort(&evaluated), AbortKind::UndefinedUnionAccess);
}

#[test]
fn test_wrong_union_tag_carries_both_tags() {
    let tc = union_access(union(0, unit()), 2);
    let evaluated = eval_tc(&tc);
    assert_eq!(
        expect_abort(&evaluated),
        AbortKind::WrongUnionTag {
            expected: 2,
            got: 0
        }
    );
}

#[test]
fn test_undefined_select_aborts() {
    // let rec x = select(x; Unit); x
    let tc = let_(true, vec![("x", select(var(0), vec![unit()]))], var(0));
    let evaluated = eval_tc(&tc);
    assert_eq!(expect_abort(&evaluated), AbortKind::UndefinedSelect);
}

#[test]
fn test_undefined_function_call_aborts() {
    // let rec x = x(); x
    let tc = let_(true, vec![("x", app(var(0), vec![]))], var(0));
    let evaluated = eval_tc(&tc);
    assert_eq!(expect_abort(&evaluated), AbortKind::UndefinedFunction);
}

#[test]
fn test_undefined_process_aborts() {
    // let rec p = (exec a = p; a); p forks its own untied cell.
    let tc = let_(true, vec![("p", exec(vec![var(0)], var(0)))], var(0));
    let evaluated = eval_tc(&tc);
    assert_eq!(expect_abort(&evaluated), AbortKind::UndefinedProcess);
}

#[test]
fn test_abort_carries_the_instruction_location() {
    let tc = Tc::DataAccess {
        datatype: DataType::Union,
        obj: union(1, unit()).boxed(),
        tag: 0,
        loc: Loc::new("test.rill", 3, 7),
    };
    let evaluated = eval_tc(&tc);
    match expect_error(&evaluated) {
        EvalError::Aborted(error) => {
            assert_eq!(&*error.loc.source, "test.rill");
            assert_eq!(error.loc.line, 3);
            assert_eq!(error.loc.col, 7);
            assert_eq!(
                error.to_string(),
                "test.rill:3:7: error: union field access undefined: \
                 wrong tag (expected 0, got 1)"
            );
        }
        other => panic!("expected abort, got {}", other),
    }
}

#[test]
fn test_eval_error_display() {
    let tc = let_(true, vec![("x", var(0))], var(0));
    let evaluated = eval_tc(&tc);
    assert_eq!(
        expect_error(&evaluated).to_string(),
        "evaluation aborted: vacuous value"
    );

    let tc = link(exec(vec![var(1)], var(0)));
    let evaluated = eval_tc(&tc);
    assert_eq!(expect_error(&evaluated).to_string(), "deadlock");
}
