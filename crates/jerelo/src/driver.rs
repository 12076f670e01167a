//! Stack-safe loop driver.
//!
//! Iterating operators (`then_while`, `else_forever`, sequential `all`, ...)
//! must not grow the native call stack when every iteration settles
//! synchronously. The driver turns synchronous progress into a plain `loop`
//! and resumes from the callback when a step settles asynchronously:
//!
//! ```text
//! turn ──► keep_running ──Stop──► escape
//!              │Continue
//!              ▼
//!            step ──sync resume──► next turn iteration (same loop)
//!              │
//!              └──async resume───► fresh turn from the callback
//! ```
//!
//! Whether a resume was synchronous is decided by a probe slot shared between
//! the loop body and the resume callback: a resume that lands while the step
//! call is still on the stack parks the next state in the slot instead of
//! recursing.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cont::Cont;
use crate::crash::Crash;
use crate::observer::Observer;
use crate::outcome::Outcome;
use crate::runtime::Runtime;
use crate::value::Value;

/// Verdict of the loop guard: iterate with a new state, or leave with output.
pub(crate) enum ContinueOrStop<S, O> {
    Continue(S),
    Stop(O),
}

enum Probe<S> {
    /// The step call is still on the stack; a resume parks its state here.
    Pending,
    /// Resumed synchronously with this state.
    Done(S),
    /// The step call returned without resuming; the callback owns the loop.
    Yielded,
}

struct Driver<S, O> {
    keep_running: Box<dyn Fn(S) -> ContinueOrStop<S, O> + Send + Sync>,
    step: Box<dyn Fn(S, Box<dyn FnOnce(S) + Send>) + Send + Sync>,
    escape: Mutex<Option<Box<dyn FnOnce(O) + Send>>>,
}

/// Drive a loop from `seed` until `keep_running` stops it.
///
/// `keep_running` must not panic: user predicates evaluated inside it are
/// expected to be wrapped in `trap` and folded into the verdict.
pub(crate) fn drive<S, O>(
    seed: S,
    keep_running: impl Fn(S) -> ContinueOrStop<S, O> + Send + Sync + 'static,
    step: impl Fn(S, Box<dyn FnOnce(S) + Send>) + Send + Sync + 'static,
    escape: impl FnOnce(O) + Send + 'static,
) where
    S: Send + 'static,
    O: Send + 'static,
{
    let driver = Arc::new(Driver {
        keep_running: Box::new(keep_running),
        step: Box::new(step),
        escape: Mutex::new(Some(Box::new(escape))),
    });
    turn(&driver, seed);
}

fn turn<S, O>(driver: &Arc<Driver<S, O>>, seed: S)
where
    S: Send + 'static,
    O: Send + 'static,
{
    let mut state = seed;
    loop {
        match (driver.keep_running)(state) {
            ContinueOrStop::Stop(output) => {
                let escape = driver.escape.lock().take();
                if let Some(escape) = escape {
                    escape(output);
                }
                return;
            }
            ContinueOrStop::Continue(next) => {
                let probe = Arc::new(Mutex::new(Probe::Pending));
                let resume: Box<dyn FnOnce(S) + Send> = {
                    let probe = Arc::clone(&probe);
                    let driver = Arc::clone(driver);
                    Box::new(move |resumed: S| {
                        let mut slot = probe.lock();
                        match *slot {
                            Probe::Pending => *slot = Probe::Done(resumed),
                            Probe::Yielded => {
                                drop(slot);
                                turn(&driver, resumed);
                            }
                            // A second resume for the same step; upstream
                            // single-emission makes this unreachable.
                            Probe::Done(_) => {}
                        }
                    })
                };
                (driver.step)(next, resume);
                let mut slot = probe.lock();
                match std::mem::replace(&mut *slot, Probe::Yielded) {
                    Probe::Done(resumed) => {
                        drop(slot);
                        state = resumed;
                    }
                    // Went asynchronous; the resume callback continues.
                    _ => return,
                }
            }
        }
    }
}

/// Share a one-shot resume across the three channels of an observer.
pub(crate) fn once_sink<T: Send + 'static>(
    f: Box<dyn FnOnce(T) + Send>,
) -> impl Fn(T) + Send + Sync + Clone {
    let slot = Arc::new(Mutex::new(Some(f)));
    move |value| {
        let f = slot.lock().take();
        if let Some(f) = f {
            f(value);
        }
    }
}

// =============================================================================
// Channel loops over a computation
// =============================================================================

enum LoopState<F, A> {
    Start,
    Settled(Outcome<F, A>),
}

/// Repeatedly run `source`, classifying each settled outcome into "iterate"
/// or "leave with this (possibly re-typed) outcome".
///
/// Cancellation is polled before every iteration; a cancelled loop leaves
/// silently. `classify` must fold panics from user predicates into a crash
/// verdict via `trap` instead of unwinding.
pub(crate) fn loop_cont<E, F, A, F2, A2>(
    source: Cont<E, F, A>,
    classify: Arc<dyn Fn(Outcome<F, A>) -> ContinueOrStop<(), Outcome<F2, A2>> + Send + Sync>,
) -> Cont<E, F2, A2>
where
    E: Value,
    F: Value,
    A: Value,
    F2: Value,
    A2: Value,
{
    Cont::from_run(move |rt: &Runtime<E>, obs: Observer<F2, A2>| {
        let guard_rt = rt.clone();
        let step_rt = rt.clone();
        let source = source.clone();
        let classify = Arc::clone(&classify);
        drive::<LoopState<F, A>, Option<Outcome<F2, A2>>>(
            LoopState::Start,
            move |state| {
                if guard_rt.is_cancelled() {
                    return ContinueOrStop::Stop(None);
                }
                match state {
                    LoopState::Start => ContinueOrStop::Continue(LoopState::Start),
                    LoopState::Settled(outcome) => match (*classify)(outcome) {
                        ContinueOrStop::Continue(()) => ContinueOrStop::Continue(LoopState::Start),
                        ContinueOrStop::Stop(out) => ContinueOrStop::Stop(Some(out)),
                    },
                }
            },
            move |_state, resume| {
                let deliver = once_sink(resume);
                let d_crash = deliver.clone();
                let d_else = deliver.clone();
                let observer = Observer::new(
                    move |c: Crash| d_crash(LoopState::Settled(Outcome::Crash(c))),
                    move |f: F| d_else(LoopState::Settled(Outcome::Else(f))),
                    move |a: A| deliver(LoopState::Settled(Outcome::Then(a))),
                );
                source.run_raw(&step_rt, observer);
            },
            move |out| match out {
                Some(Outcome::Then(a)) => obs.on_then(a),
                Some(Outcome::Else(f)) => obs.on_else(f),
                Some(Outcome::Crash(c)) => obs.on_crash(c),
                None => {}
            },
        );
    })
}

// =============================================================================
// Tests
// =============================================================================
