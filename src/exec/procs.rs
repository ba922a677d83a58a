//! Native executables backing link and port get/put procs.
//!
//! A link instruction wraps a fresh link value in two function values: a get
//! proc (zero arguments, pops the next queued value) and a put function (one
//! argument, returning a proc that performs the put). Ports reuse the same
//! executables over a port value instead of a link. These are ordinary
//! [`Executable`]s, so the scheduler treats them like any compiled function;
//! blocking is expressed by returning [`ExecStatus::Blocked`] without
//! touching the frame, which makes retries idempotent.

use std::sync::Arc;

use crate::exec::{
    thread_return, AbortKind, ExecStatus, Executable, RunCx, Thread,
};
use crate::name::Loc;
use crate::value::{new_func_value, new_unit_value, Value, ValueRef};

/// Read the captured static values of the function executing in the thread's
/// top frame.
fn frame_statics(cx: &RunCx<'_>, thread: &Thread) -> Box<[ValueRef]> {
    let frame = thread.frames.last().expect("native run with no frame");
    match cx.heap.get(frame.func) {
        Value::Func { statics, .. } => statics.clone(),
        other => unreachable!("frame function is a {}", other.kind()),
    }
}

/// The get proc: `statics = [port]`, no arguments.
///
/// Takes the next value off a link queue, or the value out of a port slot,
/// blocking while none is available.
#[derive(Debug)]
pub struct GetExec;

impl Executable for GetExec {
    fn args(&self) -> usize {
        0
    }

    fn statics(&self) -> usize {
        1
    }

    fn locals(&self) -> usize {
        0
    }

    fn run(&self, cx: &mut RunCx<'_>, thread: &mut Thread) -> ExecStatus {
        let statics = frame_statics(cx, thread);
        let Some(port) = cx.heap.strict(statics[0]) else {
            return cx.abort(AbortKind::UndefinedPort, &Loc::builtin());
        };

        match cx.heap.get_mut(port) {
            Value::Link { queue } => {
                let Some(value) = queue.pop_front() else {
                    return ExecStatus::Blocked;
                };
                // The queue edge is gone; root the value before the next
                // instruction boundary.
                cx.heap.retain(value);
                thread_return(cx.heap, thread, value);
                cx.heap.release(value);
                ExecStatus::Finished
            }
            Value::Port { data } => {
                let Some(value) = data.take() else {
                    return ExecStatus::Blocked;
                };
                // The host's root on the slot contents transfers to us.
                *cx.io_activity = true;
                thread_return(cx.heap, thread, value);
                cx.heap.release(value);
                ExecStatus::Finished
            }
            other => unreachable!("get target is a {}", other.kind()),
        }
    }
}

/// The put function: `statics = [port]`, one argument.
///
/// Applying it yields a proc capturing the port and the argument; running
/// that proc performs the put.
#[derive(Debug)]
pub struct PutExec;

impl Executable for PutExec {
    fn args(&self) -> usize {
        1
    }

    fn statics(&self) -> usize {
        1
    }

    fn locals(&self) -> usize {
        1
    }

    fn run(&self, cx: &mut RunCx<'_>, thread: &mut Thread) -> ExecStatus {
        let statics = frame_statics(cx, thread);
        let frame = thread.frames.last().expect("native run with no frame");
        let arg = frame.locals[0].expect("put applied without an argument");

        let proc = new_func_value(cx.heap, 0, Arc::new(PutProcExec), &[statics[0], arg]);
        thread_return(cx.heap, thread, proc);
        cx.heap.release(proc);
        ExecStatus::Finished
    }
}

/// The proc a put application evaluates to: `statics = [port, arg]`.
///
/// Enqueues on a link (links never block a put), or fills a port slot,
/// blocking while the slot is occupied. Returns unit.
#[derive(Debug)]
pub struct PutProcExec;

impl Executable for PutProcExec {
    fn args(&self) -> usize {
        0
    }

    fn statics(&self) -> usize {
        2
    }

    fn locals(&self) -> usize {
        0
    }

    fn run(&self, cx: &mut RunCx<'_>, thread: &mut Thread) -> ExecStatus {
        let statics = frame_statics(cx, thread);
        let Some(port) = cx.heap.strict(statics[0]) else {
            return cx.abort(AbortKind::UndefinedPort, &Loc::builtin());
        };
        let arg = statics[1];

        match cx.heap.get_mut(port) {
            Value::Link { queue } => {
                queue.push_back(arg);
                *cx.io_activity = true;
            }
            Value::Port { data } => {
                let data = std::rc::Rc::clone(data);
                if data.get().is_some() {
                    return ExecStatus::Blocked;
                }
                // The host consumes the slot along with our root.
                cx.heap.retain(arg);
                data.set(Some(arg));
                *cx.io_activity = true;
            }
            other => unreachable!("put target is a {}", other.kind()),
        }

        let unit = new_unit_value(cx.heap);
        thread_return(cx.heap, thread, unit);
        cx.heap.release(unit);
        ExecStatus::Finished
    }
}
