//! The interpreter: the [`Executable`] implementation for compiled
//! [`Code`].
//!
//! One `run` invocation dispatches instructions for the thread's top frame
//! until the frame finishes, the thread must suspend, or the time slice runs
//! out. The dispatch order per instruction is: time-slice check, fetch,
//! profile ops, execute. Strict reads follow ref chains; a chain ending at an
//! untied ref is "undefined" and aborts the thread with a located message.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;

use tracing::trace;

use crate::code::{Code, LocalIndex, Op, ProfileOp};
use crate::exec::{
    frame_get, frame_get_strict, frame_set_borrowed, frame_set_consumed, push_frame,
    replace_frame, thread_return, AbortKind, ExecStatus, Executable, Join, ResultDest, RunCx,
    Thread,
};
use crate::name::{Loc, Name};
use crate::profile::BlockId;
use crate::value::{new_func_value, new_get_value, new_put_value, new_struct_value, Value, ValueRef};

impl Executable for Code {
    fn args(&self) -> usize {
        self.args
    }

    fn statics(&self) -> usize {
        self.statics
    }

    fn locals(&self) -> usize {
        self.locals
    }

    fn profile_block_id(&self) -> BlockId {
        self.profile_block_id
    }

    fn profile_blocks(&self) -> &[Name] {
        &self.profile_blocks
    }

    fn run(&self, cx: &mut RunCx<'_>, thread: &mut Thread) -> ExecStatus {
        loop {
            if thread.quota == 0 {
                if let (Some(pt), Some(profile)) =
                    (thread.profile.as_mut(), cx.profile.as_deref_mut())
                {
                    pt.sample(profile);
                }
                return ExecStatus::Yielded;
            }
            thread.quota -= 1;

            // Instruction boundaries are the only collection points.
            if cx.config.gc_stress {
                cx.heap.full_gc();
            } else {
                cx.heap.maybe_gc();
            }

            let pc = thread.frames.last().expect("run with no frame").pc;
            let instr = &self.instrs[pc];

            if cx.config.trace {
                trace!(
                    target: "rill::vm",
                    pc,
                    instr = %self.disassemble_instruction(pc),
                    depth = thread.frames.len(),
                );
            }

            if !instr.profile_ops.is_empty() {
                if let (Some(pt), Some(profile)) =
                    (thread.profile.as_mut(), cx.profile.as_deref_mut())
                {
                    for op in &instr.profile_ops {
                        match op {
                            ProfileOp::Enter(block) => pt.enter_block(profile, *block),
                            ProfileOp::Exit => pt.exit_block(),
                            ProfileOp::AutoExit => pt.auto_exit_block(),
                        }
                    }
                }
            }

            match exec_op(cx, thread, &instr.op) {
                ControlFlow::Continue(()) => continue,
                ControlFlow::Break(status) => return status,
            }
        }
    }
}

/// Execute one instruction operation. `Continue` means the frame keeps
/// running; `Break` carries the status to hand back to the scheduler.
fn exec_op(cx: &mut RunCx<'_>, thread: &mut Thread, op: &Op) -> ControlFlow<ExecStatus> {
    match op {
        Op::StructValue { args, dest } => {
            let frame = thread.frames.last().expect("no frame");
            let heap = &*cx.heap;
            let fields: Vec<ValueRef> = args
                .iter()
                .map(|&arg| frame_get(heap, frame, arg))
                .collect();
            let value = new_struct_value(cx.heap, &fields);
            advance(cx, thread, *dest, value)
        }

        Op::UnionValue { tag, arg, dest } => {
            let frame = thread.frames.last().expect("no frame");
            let arg = frame_get(cx.heap, frame, *arg);
            let value = cx.heap.alloc(Value::Union { tag: *tag, arg });
            advance(cx, thread, *dest, value)
        }

        Op::StructAccess {
            obj,
            tag,
            dest,
            loc,
        } => {
            let frame = thread.frames.last().expect("no frame");
            let Some(obj) = frame_get_strict(cx.heap, frame, *obj) else {
                return ControlFlow::Break(cx.abort(AbortKind::UndefinedStructAccess, loc));
            };
            let field = match cx.heap.get(obj) {
                Value::Struct { fields } => {
                    debug_assert!(*tag < fields.len());
                    fields[*tag]
                }
                other => unreachable!("struct access on a {}", other.kind()),
            };
            let frame = thread.frames.last_mut().expect("no frame");
            frame_set_borrowed(cx.heap, frame, *dest, field);
            frame.pc += 1;
            ControlFlow::Continue(())
        }

        Op::UnionAccess {
            obj,
            tag,
            dest,
            loc,
        } => {
            let frame = thread.frames.last().expect("no frame");
            let Some(obj) = frame_get_strict(cx.heap, frame, *obj) else {
                return ControlFlow::Break(cx.abort(AbortKind::UndefinedUnionAccess, loc));
            };
            let arg = match cx.heap.get(obj) {
                Value::Union { tag: actual, arg } => {
                    if actual != tag {
                        let kind = AbortKind::WrongUnionTag {
                            expected: *tag,
                            got: *actual,
                        };
                        return ControlFlow::Break(cx.abort(kind, loc));
                    }
                    *arg
                }
                other => unreachable!("union access on a {}", other.kind()),
            };
            let frame = thread.frames.last_mut().expect("no frame");
            frame_set_borrowed(cx.heap, frame, *dest, arg);
            frame.pc += 1;
            ControlFlow::Continue(())
        }

        Op::UnionSelect {
            condition,
            jumps,
            loc,
        } => {
            let frame = thread.frames.last().expect("no frame");
            let Some(condition) = frame_get_strict(cx.heap, frame, *condition) else {
                return ControlFlow::Break(cx.abort(AbortKind::UndefinedSelect, loc));
            };
            let tag = match cx.heap.get(condition) {
                Value::Union { tag, .. } => *tag,
                other => unreachable!("union select on a {}", other.kind()),
            };
            let frame = thread.frames.last_mut().expect("no frame");
            frame.pc += 1 + jumps[tag];
            ControlFlow::Continue(())
        }

        Op::Jump { count } => {
            let frame = thread.frames.last_mut().expect("no frame");
            frame.pc += 1 + count;
            ControlFlow::Continue(())
        }

        Op::FuncValue { code, scope, dest } => {
            let frame = thread.frames.last().expect("no frame");
            let heap = &*cx.heap;
            let statics: Vec<ValueRef> = scope
                .iter()
                .map(|&index| frame_get(heap, frame, index))
                .collect();
            let executable: Arc<dyn Executable> = Arc::clone(code) as Arc<dyn Executable>;
            let value = new_func_value(cx.heap, code.args, executable, &statics);
            advance(cx, thread, *dest, value)
        }

        Op::Call {
            func,
            args,
            dest,
            exit,
            loc,
        } => {
            let frame = thread.frames.last().expect("no frame");
            let Some(func) = frame_get_strict(cx.heap, frame, *func) else {
                return ControlFlow::Break(cx.abort(AbortKind::UndefinedFunction, loc));
            };
            let heap = &*cx.heap;
            let argv: Vec<ValueRef> = args
                .iter()
                .map(|&arg| frame_get(heap, frame, arg))
                .collect();

            if *exit {
                replace_frame(cx.heap, thread, func, &argv);
                return ControlFlow::Break(ExecStatus::Finished);
            }

            let frame = thread.frames.last_mut().expect("no frame");
            frame.pc += 1;
            if let Some(old) = frame.locals[*dest].take() {
                cx.heap.release(old);
            }
            push_frame(cx.heap, thread, func, &argv, ResultDest::Local(*dest));
            ControlFlow::Break(ExecStatus::Finished)
        }

        Op::Link { get, put } => {
            let link = cx.heap.alloc(Value::Link {
                queue: VecDeque::new(),
            });
            let get_value = new_get_value(cx.heap, link);
            let put_value = new_put_value(cx.heap, link);
            cx.heap.release(link);

            let frame = thread.frames.last_mut().expect("no frame");
            frame_set_consumed(cx.heap, frame, *get, get_value);
            frame_set_consumed(cx.heap, frame, *put, put_value);
            frame.pc += 1;
            ControlFlow::Continue(())
        }

        Op::Fork { args, dests } => {
            for (&arg, &dest) in args.iter().zip(dests) {
                let frame = thread.frames.last().expect("no frame");
                let Some(proc) = frame_get_strict(cx.heap, frame, arg) else {
                    return ControlFlow::Break(
                        cx.abort(AbortKind::UndefinedProcess, &Loc::builtin()),
                    );
                };
                debug_assert!(
                    matches!(cx.heap.get(proc), Value::Func { argc: 0, .. }),
                    "forked value is not a proc"
                );

                let id = cx.fresh_thread_id();
                let mut child = Thread::new(id, thread.profile.as_ref().map(|p| p.fork()));
                child.join = Some(Join {
                    parent: thread.id,
                    dest,
                });
                push_frame(cx.heap, &mut child, proc, &[], ResultDest::Thread);
                cx.spawned.push(child);

                let frame = thread.frames.last_mut().expect("no frame");
                if let Some(old) = frame.locals[dest].take() {
                    cx.heap.release(old);
                }
                frame.joins += 1;
            }
            let frame = thread.frames.last_mut().expect("no frame");
            frame.pc += 1;
            ControlFlow::Break(ExecStatus::Yielded)
        }

        Op::Copy { src, dest } => {
            let frame = thread.frames.last().expect("no frame");
            let value = frame_get(cx.heap, frame, *src);
            let frame = thread.frames.last_mut().expect("no frame");
            frame_set_borrowed(cx.heap, frame, *dest, value);
            frame.pc += 1;
            ControlFlow::Continue(())
        }

        Op::RefValue { dest } => {
            let value = cx.heap.alloc(Value::Ref { value: None });
            advance(cx, thread, *dest, value)
        }

        Op::RefDef { r#ref, value, loc } => {
            let frame = thread.frames.last().expect("no frame");
            let rv = frame.locals[*r#ref].expect("ref_def on empty slot");
            debug_assert!(
                matches!(cx.heap.get(rv), Value::Ref { value: None }),
                "ref_def target already tied"
            );

            // Unwrap accumulated ref layers; if the chain leads back to the
            // cell being tied, the binding has no concrete constructor.
            let mut tied = frame_get(cx.heap, frame, *value);
            while let Value::Ref { value: Some(next) } = cx.heap.get(tied) {
                tied = *next;
            }
            if tied == rv {
                return ControlFlow::Break(cx.abort(AbortKind::VacuousValue, loc));
            }

            *cx.heap.get_mut(rv) = Value::Ref { value: Some(tied) };
            let frame = thread.frames.last_mut().expect("no frame");
            frame.pc += 1;
            ControlFlow::Continue(())
        }

        Op::Return { result } => {
            let frame = thread.frames.last().expect("no frame");
            let result = frame_get(cx.heap, frame, *result);
            thread_return(cx.heap, thread, result);
            ControlFlow::Break(ExecStatus::Finished)
        }

        Op::TypeValue { dest } => {
            let value = cx.heap.alloc(Value::Type);
            advance(cx, thread, *dest, value)
        }

        Op::Release { target } => {
            let frame = thread.frames.last_mut().expect("no frame");
            if let Some(old) = frame.locals[*target].take() {
                cx.heap.release(old);
            }
            frame.pc += 1;
            ControlFlow::Continue(())
        }
    }
}

/// Store a freshly allocated value into `dest` and step past the
/// instruction.
fn advance(
    cx: &mut RunCx<'_>,
    thread: &mut Thread,
    dest: LocalIndex,
    value: ValueRef,
) -> ControlFlow<ExecStatus> {
    let frame = thread.frames.last_mut().expect("no frame");
    frame_set_consumed(cx.heap, frame, dest, value);
    frame.pc += 1;
    ControlFlow::Continue(())
}
