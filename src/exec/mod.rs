//! The execution model: executables, frames, threads, and the scheduler.
//!
//! Execution is single-threaded and cooperative. The scheduler owns a vector
//! of logical threads and gives each one a time slice per round; a thread
//! runs by invoking the `run` implementation of the function on top of its
//! frame stack, which returns one of the [`ExecStatus`] codes at the next
//! suspension point. Between rounds the host's [`Io`] callback gets a chance
//! to move values through ports; a round in which nothing advanced and a
//! blocking IO call made no progress is a deadlock.
//!
//! This module is organized into submodules by functionality:
//! - `interp`: the interpreter, the `Executable` implementation for compiled
//!   [`Code`](crate::code::Code)
//! - `procs`: native executables backing link and port get/put procs

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::code::LocalIndex;
use crate::heap::Heap;
use crate::name::{Loc, Name};
use crate::profile::{BlockId, Profile, ProfileThread};
use crate::value::{Value, ValueRef};

mod error;
mod interp;
pub mod procs;


pub use error::{AbortKind, RuntimeError};

/// Status of a thread after a `run` invocation.
///
/// `running` exists only inside a single dispatch loop and is never returned
/// to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// The current frame finished (returned, called, or tail-called); the
    /// thread continues with whatever frame is now on top.
    Finished,
    /// The thread is blocked waiting for a link, port, or forked children.
    Blocked,
    /// The thread gave up its time slice but can keep running.
    Yielded,
    /// The computation must be aborted.
    Aborted,
}

/// A function body that the scheduler can run.
///
/// The interpreter is one implementation, wrapping an instruction vector;
/// link and port procs are native implementations; compiled backends can
/// provide others. Cleanup on collection is the implementor's `Drop`.
pub trait Executable: fmt::Debug {
    /// Number of arguments the function expects
    fn args(&self) -> usize;

    /// Number of captured statics
    fn statics(&self) -> usize;

    /// Number of local slots a frame needs; at least `args`, which occupy
    /// the first slots
    fn locals(&self) -> usize;

    /// The profile block entered when the body runs
    fn profile_block_id(&self) -> BlockId {
        0
    }

    /// Names of the profile blocks this executable allocated
    fn profile_blocks(&self) -> &[Name] {
        &[]
    }

    /// Run the function on top of `thread`'s frame stack until it finishes
    /// or can no longer make progress.
    fn run(&self, cx: &mut RunCx<'_>, thread: &mut Thread) -> ExecStatus;
}

/// Shared context handed to `run` implementations.
pub struct RunCx<'a> {
    pub heap: &'a mut Heap,
    pub profile: Option<&'a mut Profile>,
    /// Threads forked during this run; the scheduler adopts them afterwards
    pub spawned: &'a mut Vec<Thread>,
    /// Set when the thread moves data through a link or port in a way that
    /// could unblock another thread
    pub io_activity: &'a mut bool,
    /// The error behind an `Aborted` status, for the scheduler to surface
    pub error: &'a mut Option<RuntimeError>,
    pub next_thread_id: &'a mut ThreadId,
    pub config: &'a EvalConfig,
}

impl RunCx<'_> {
    /// Allocate a fresh thread id
    pub(crate) fn fresh_thread_id(&mut self) -> ThreadId {
        let id = *self.next_thread_id;
        *self.next_thread_id += 1;
        id
    }

    /// Abort the computation: write the located message to the diagnostic
    /// stream, record the error for the scheduler, and produce the status to
    /// hand back.
    pub(crate) fn abort(&mut self, kind: AbortKind, loc: &Loc) -> ExecStatus {
        let error = RuntimeError::new(kind, loc.clone());
        eprintln!("{}", error);
        *self.error = Some(error);
        ExecStatus::Aborted
    }
}

/// Identifies a scheduler thread for join bookkeeping.
pub type ThreadId = u64;

/// Where a frame delivers its result.
#[derive(Debug, Clone, Copy)]
pub enum ResultDest {
    /// A local slot of the calling frame
    Local(LocalIndex),
    /// The thread itself; the scheduler routes it to the evaluation result
    /// or to a fork join slot in the parent thread
    Thread,
}

/// A stack record for one in-progress call.
///
/// A frame holds a strong root on its function and on every occupied local
/// slot; a slot holds at most one root, and assigning to an occupied slot
/// releases the prior occupant.
#[derive(Debug)]
pub struct Frame {
    pub func: ValueRef,
    pub pc: usize,
    pub locals: Vec<Option<ValueRef>>,
    pub dest: ResultDest,
    /// Number of forked children whose results are still outstanding; the
    /// frame does not run while nonzero
    pub joins: usize,
}

/// A join ticket: where a forked thread delivers its result.
#[derive(Debug, Clone, Copy)]
pub struct Join {
    pub parent: ThreadId,
    pub dest: LocalIndex,
}

/// A cooperative thread of execution.
#[derive(Debug)]
pub struct Thread {
    pub id: ThreadId,
    pub frames: Vec<Frame>,
    /// Result of the bottom frame once the thread finishes (one root, owned)
    pub result: Option<ValueRef>,
    /// Set on forked threads: where to deliver `result`
    pub join: Option<Join>,
    /// Instruction dispatches remaining in the current time slice
    pub quota: usize,
    pub profile: Option<ProfileThread>,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, profile: Option<ProfileThread>) -> Self {
        Self {
            id,
            frames: Vec::new(),
            result: None,
            join: None,
            quota: 0,
            profile,
        }
    }
}

/// Configuration for the evaluator.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    /// Instruction dispatches per thread per scheduler round; also the
    /// profile sample period
    pub time_slice: usize,
    /// Emit a trace event per dispatched instruction
    pub trace: bool,
    /// Run a full collection at every instruction boundary instead of the
    /// heap's own schedule. For tests.
    pub gc_stress: bool,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            time_slice: 1024,
            trace: false,
            gc_stress: false,
        }
    }
}

/// Result of an evaluation
pub type EvalResult<T> = Result<T, EvalError>;

/// Errors that end an evaluation.
///
/// The located message has already been written to stderr by the time one of
/// these is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// A thread aborted; the payload says which instruction failed and why
    Aborted(RuntimeError),
    /// All threads blocked and the host IO made no progress
    Deadlock,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted(error) => write!(f, "evaluation aborted: {}", error.kind),
            Self::Deadlock => write!(f, "deadlock"),
        }
    }
}

impl std::error::Error for EvalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Aborted(error) => Some(error),
            Self::Deadlock => None,
        }
    }
}

/// Host IO hook, invoked between scheduler rounds.
///
/// With `block` false the callback must not wait; with `block` true it may
/// wait for external activity. Either way it returns true iff it changed any
/// port state. For input ports it may fill an empty slot (taking a root on
/// the stored value); for output ports it may take a filled slot (assuming
/// the root).
pub trait Io {
    fn io(&mut self, heap: &mut Heap, block: bool) -> bool;
}

/// An IO that never does anything, for pure programs.
#[derive(Debug, Default)]
pub struct NoIo;

impl Io for NoIo {
    fn io(&mut self, _heap: &mut Heap, _block: bool) -> bool {
        false
    }
}

/// Write a located error message to the diagnostic stream.
pub(crate) fn report_error(loc: &Loc, message: &str) {
    eprintln!("{}: error: {}", loc, message);
}

// === Frame operations ===

/// Read a value from the frame.
pub(crate) fn frame_get(heap: &Heap, frame: &Frame, index: crate::code::FrameIndex) -> ValueRef {
    use crate::code::FrameIndex;
    match index {
        FrameIndex::Local(i) => frame.locals[i].expect("read of empty local slot"),
        FrameIndex::Static(i) => match heap.get(frame.func) {
            Value::Func { statics, .. } => statics[i],
            other => unreachable!("frame function is a {}", other.kind()),
        },
    }
}

/// Read and dereference a value from the frame, following ref chains.
/// Returns `None` if the value is still undefined.
pub(crate) fn frame_get_strict(
    heap: &Heap,
    frame: &Frame,
    index: crate::code::FrameIndex,
) -> Option<ValueRef> {
    heap.strict(frame_get(heap, frame, index))
}

/// Store a borrowed value into a local slot, rooting it and releasing any
/// prior occupant.
pub(crate) fn frame_set_borrowed(
    heap: &mut Heap,
    frame: &mut Frame,
    dest: LocalIndex,
    value: ValueRef,
) {
    heap.retain(value);
    if let Some(old) = frame.locals[dest].replace(value) {
        heap.release(old);
    }
}

/// Store a value into a local slot, transferring the caller's root to the
/// slot and releasing any prior occupant.
pub(crate) fn frame_set_consumed(
    heap: &mut Heap,
    frame: &mut Frame,
    dest: LocalIndex,
    value: ValueRef,
) {
    if let Some(old) = frame.locals[dest].replace(value) {
        heap.release(old);
    }
}

/// Push a frame calling `func` with `args` onto the thread's stack.
///
/// Does not take ownership of the function or the arguments; the frame takes
/// its own roots.
pub(crate) fn push_frame(
    heap: &mut Heap,
    thread: &mut Thread,
    func: ValueRef,
    args: &[ValueRef],
    dest: ResultDest,
) {
    let (argc, locals) = match heap.get(func) {
        Value::Func {
            argc, executable, ..
        } => (*argc, executable.locals()),
        other => unreachable!("called value is a {}", other.kind()),
    };
    debug_assert_eq!(args.len(), argc, "call arity mismatch");

    heap.retain(func);
    let mut slots: Vec<Option<ValueRef>> = vec![None; locals];
    for (slot, &arg) in slots.iter_mut().zip(args) {
        heap.retain(arg);
        *slot = Some(arg);
    }

    thread.frames.push(Frame {
        func,
        pc: 0,
        locals: slots,
        dest,
        joins: 0,
    });
}

/// Replace the current frame with a call to `func`, as a tail call.
///
/// Takes roots on the function and arguments before dropping the current
/// frame's, so this is safe even when the frame being replaced held the only
/// references to them.
pub(crate) fn replace_frame(
    heap: &mut Heap,
    thread: &mut Thread,
    func: ValueRef,
    args: &[ValueRef],
) {
    let (argc, locals) = match heap.get(func) {
        Value::Func {
            argc, executable, ..
        } => (*argc, executable.locals()),
        other => unreachable!("called value is a {}", other.kind()),
    };
    debug_assert_eq!(args.len(), argc, "call arity mismatch");

    heap.retain(func);
    for &arg in args {
        heap.retain(arg);
    }

    let frame = thread.frames.last_mut().expect("tail call with no frame");
    debug_assert_eq!(frame.joins, 0);
    heap.release(frame.func);
    for slot in frame.locals.drain(..) {
        if let Some(value) = slot {
            heap.release(value);
        }
    }

    frame.func = func;
    frame.pc = 0;
    frame.locals = vec![None; locals];
    for (slot, &arg) in frame.locals.iter_mut().zip(args) {
        *slot = Some(arg);
    }
}

/// Return `result` from the current frame: pop it, release its roots, and
/// deliver the result to the frame's destination.
///
/// Collapses any tied ref layers on the result first so chains of refs never
/// accumulate across returns. Does not take ownership of `result`.
pub(crate) fn thread_return(heap: &mut Heap, thread: &mut Thread, result: ValueRef) {
    let mut result = result;
    while let Value::Ref { value: Some(next) } = heap.get(result) {
        result = *next;
    }
    heap.retain(result);

    let frame = thread.frames.pop().expect("return with no frame");
    release_frame(heap, frame.func, frame.locals);

    match frame.dest {
        ResultDest::Local(index) => {
            let caller = thread
                .frames
                .last_mut()
                .expect("return to a missing caller frame");
            frame_set_consumed(heap, caller, index, result);
        }
        ResultDest::Thread => {
            debug_assert!(thread.frames.is_empty());
            debug_assert!(thread.result.is_none());
            thread.result = Some(result);
        }
    }
}

fn release_frame(heap: &mut Heap, func: ValueRef, locals: Vec<Option<ValueRef>>) {
    heap.release(func);
    for value in locals.into_iter().flatten() {
        heap.release(value);
    }
}

/// Drop every root a thread holds. Used when aborting an evaluation.
fn unwind_thread(heap: &mut Heap, thread: &mut Thread) {
    while let Some(frame) = thread.frames.pop() {
        release_frame(heap, frame.func, frame.locals);
    }
    if let Some(result) = thread.result.take() {
        heap.release(result);
    }
}

// === The scheduler ===

/// Evaluate a zero-argument program function to a value.
pub fn eval(
    heap: &mut Heap,
    program: ValueRef,
    profile: Option<&mut Profile>,
) -> EvalResult<ValueRef> {
    apply(heap, program, &[], profile)
}

/// Apply a function to arguments and run it to a value.
pub fn apply(
    heap: &mut Heap,
    func: ValueRef,
    args: &[ValueRef],
    profile: Option<&mut Profile>,
) -> EvalResult<ValueRef> {
    eval_with_config(
        heap,
        &mut NoIo,
        func,
        args,
        profile,
        &EvalConfig::default(),
    )
}

/// Execute a process value under the given host IO.
pub fn exec_proc(
    heap: &mut Heap,
    io: &mut dyn Io,
    proc: ValueRef,
    profile: Option<&mut Profile>,
) -> EvalResult<ValueRef> {
    eval_with_config(heap, io, proc, &[], profile, &EvalConfig::default())
}

/// Full-control evaluation entry point.
///
/// Runs `func(args...)` under the scheduler until the main result is
/// available, every thread is reaped, or the computation fails. The returned
/// value carries one root owned by the caller. Does not take ownership of
/// the function or the arguments.
pub fn eval_with_config(
    heap: &mut Heap,
    io: &mut dyn Io,
    func: ValueRef,
    args: &[ValueRef],
    mut profile: Option<&mut Profile>,
    config: &EvalConfig,
) -> EvalResult<ValueRef> {
    let mut threads: Vec<Thread> = Vec::new();
    let mut next_thread_id: ThreadId = 0;

    let mut main = Thread::new(next_thread_id, profile.as_ref().map(|_| ProfileThread::new()));
    next_thread_id += 1;
    let func = match heap.strict(func) {
        Some(f) => f,
        None => {
            let error = RuntimeError::new(AbortKind::UndefinedFunction, Loc::builtin());
            eprintln!("{}", error);
            return Err(EvalError::Aborted(error));
        }
    };
    push_frame(heap, &mut main, func, args, ResultDest::Thread);
    let main_id = main.id;
    threads.push(main);

    let mut main_result: Option<ValueRef> = None;
    let mut spawned: Vec<Thread> = Vec::new();
    let mut abort: Option<RuntimeError> = None;

    while !threads.is_empty() {
        let mut unblocked = false;

        let mut i = 0;
        while i < threads.len() {
            let status = {
                let mut cx = RunCx {
                    heap: &mut *heap,
                    profile: profile.as_deref_mut(),
                    spawned: &mut spawned,
                    io_activity: &mut unblocked,
                    error: &mut abort,
                    next_thread_id: &mut next_thread_id,
                    config,
                };
                run_thread(&mut cx, &mut threads[i])
            };
            // Children forked this run get scheduled within the same round.
            threads.append(&mut spawned);

            match status {
                ExecStatus::Finished => {
                    unblocked = true;
                    let thread = threads.swap_remove(i);
                    finish_thread(heap, &mut threads, thread, main_id, &mut main_result);
                    // The swapped-in thread now lives at index i; run it
                    // before moving on.
                }
                ExecStatus::Blocked => {
                    i += 1;
                }
                ExecStatus::Yielded => {
                    unblocked = true;
                    i += 1;
                }
                ExecStatus::Aborted => {
                    for thread in &mut threads {
                        unwind_thread(heap, thread);
                    }
                    if let Some(result) = main_result.take() {
                        heap.release(result);
                    }
                    let error = abort.take().expect("abort without a recorded error");
                    return Err(EvalError::Aborted(error));
                }
            }
        }

        let blocked = !unblocked;
        if !io.io(heap, blocked) && blocked {
            report_error(&Loc::builtin(), "deadlock");
            for thread in &mut threads {
                unwind_thread(heap, thread);
            }
            if let Some(result) = main_result.take() {
                heap.release(result);
            }
            return Err(EvalError::Deadlock);
        }
    }

    // Give the host a chance to process any remaining io before exiting.
    io.io(heap, false);

    debug!(target: "rill::exec", live = heap.live(), "evaluation finished");
    Ok(main_result.expect("main thread finished without a result"))
}

/// Run one thread until it suspends.
fn run_thread(cx: &mut RunCx<'_>, thread: &mut Thread) -> ExecStatus {
    thread.quota = cx.config.time_slice;
    loop {
        let Some(frame) = thread.frames.last() else {
            return ExecStatus::Finished;
        };
        if frame.joins > 0 {
            // Waiting on forked children; their completions will count as
            // progress.
            return ExecStatus::Blocked;
        }

        let executable = match cx.heap.get(frame.func) {
            Value::Func { executable, .. } => Arc::clone(executable),
            other => unreachable!("frame function is a {}", other.kind()),
        };
        match executable.run(cx, thread) {
            ExecStatus::Finished => continue,
            status => return status,
        }
    }
}

/// Reap a finished thread: deliver its result to the evaluation or to the
/// forking parent's join slot.
fn finish_thread(
    heap: &mut Heap,
    threads: &mut [Thread],
    mut thread: Thread,
    main_id: ThreadId,
    main_result: &mut Option<ValueRef>,
) {
    let result = thread.result.take();
    match thread.join {
        Some(join) => {
            let result = result.expect("forked thread finished without a result");
            let parent = threads
                .iter_mut()
                .find(|t| t.id == join.parent)
                .expect("join parent disappeared");
            let frame = parent
                .frames
                .last_mut()
                .expect("join parent has no frame");
            debug_assert!(frame.joins > 0);
            frame.joins -= 1;
            frame_set_consumed(heap, frame, join.dest, result);
        }
        None => {
            debug_assert_eq!(thread.id, main_id);
            *main_result = result;
        }
    }
}
