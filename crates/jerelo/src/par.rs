//! Parallel combinators: `both`/`all`, `either`/`any`, `coalesce`/`converge`.
//!
//! Each combinator embeds a small per-run state machine reconciling
//! concurrent operand outcomes under the selected policy. All operands run
//! under one shared runtime deriving the parent's environment and panic sink,
//! with a policy-local cancellation flag OR-ed onto the parent's. The decisive
//! outcome trips the local flag, so a losing sibling's later emission observes
//! cancellation at its own safety wrapper and is dropped; the panic sink never
//! fires for a cancelled loser.
//!
//! Two engines cover all six combinators:
//!
//! * [`fan_out`] — start every operand, stash non-decisive outcomes in
//!   arrival order, and merge when the set completes (`QuitFast` marks some
//!   outcomes decisive; `RunAll` marks none);
//! * [`fan_seq`] — run operands one at a time on the trampoline, folding
//!   outcomes into an accumulator until one halts the walk.
//!
//! Input lists are taken by value: the combinator owns its copy from the
//! moment of construction, so later caller-side mutation cannot reach a
//! delayed run.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cont::Cont;
use crate::crash::{Crash, trap};
use crate::driver::{ContinueOrStop, drive, once_sink};
use crate::observer::Observer;
use crate::outcome::Outcome;
use crate::policy::{CrashPolicy, OkPolicy};
use crate::runtime::CancelToken;
use crate::value::Value;

/// Tags a two-way composition's operand values for the shared n-way engines.
#[derive(Debug, Clone)]
enum Branch<L, R> {
    Left(L),
    Right(R),
}

fn deliver<F: Value, A: Value>(obs: &Observer<F, A>, outcome: Outcome<F, A>) {
    match outcome {
        Outcome::Then(a) => obs.on_then(a),
        Outcome::Else(f) => obs.on_else(f),
        Outcome::Crash(c) => obs.on_crash(c),
    }
}

/// Single crash passes through; several collect keyed by input index.
fn fold_crashes(mut crashes: BTreeMap<usize, Crash>) -> Crash {
    if crashes.len() == 1 {
        if let Some((_idx, crash)) = crashes.pop_first() {
            return crash;
        }
    }
    Crash::collected(crashes)
}

/// Two-way crash fusion, operand order preserved.
fn merge_two(left: Option<Crash>, right: Option<Crash>) -> Option<Crash> {
    match (left, right) {
        (Some(l), Some(r)) => Some(Crash::merged(l, r)),
        (Some(l), None) => Some(l),
        (None, Some(r)) => Some(r),
        (None, None) => None,
    }
}

// =============================================================================
// Fan-out engine (QuitFast / RunAll)
// =============================================================================

struct FanState<F, A> {
    /// Non-decisive outcomes in arrival order.
    stash: Vec<(usize, Outcome<F, A>)>,
    pending: usize,
    done: bool,
}

enum Verdict<F, A> {
    Decide(Outcome<F, A>),
    Finish(Vec<(usize, Outcome<F, A>)>),
    Wait,
}

fn fan_out<E, F, A, F2, A2>(
    items: Vec<Cont<E, F, A>>,
    decisive: Option<Arc<dyn Fn(&Outcome<F, A>) -> bool + Send + Sync>>,
    to_decisive: Arc<dyn Fn(Outcome<F, A>) -> Outcome<F2, A2> + Send + Sync>,
    finish: Arc<dyn Fn(Vec<(usize, Outcome<F, A>)>) -> Outcome<F2, A2> + Send + Sync>,
) -> Cont<E, F2, A2>
where
    E: Value,
    F: Value,
    A: Value,
    F2: Value,
    A2: Value,
{
    let items = Arc::new(items);
    Cont::from_run(move |rt, obs: Observer<F2, A2>| {
        if items.is_empty() {
            match trap(|| (*finish)(Vec::new())) {
                Ok(out) => deliver(&obs, out),
                Err(crash) => obs.on_crash(crash),
            }
            return;
        }

        let local = CancelToken::new();
        let shared = rt.extend_cancelled({
            let flag = local.clone();
            move || flag.is_cancelled()
        });
        let state = Arc::new(Mutex::new(FanState::<F, A> {
            stash: Vec::new(),
            pending: items.len(),
            done: false,
        }));

        let settle: Arc<dyn Fn(usize, Outcome<F, A>) + Send + Sync> = {
            let state = Arc::clone(&state);
            let decisive = decisive.clone();
            let to_decisive = Arc::clone(&to_decisive);
            let finish = Arc::clone(&finish);
            let obs = obs.clone();
            let local = local.clone();
            Arc::new(move |idx, outcome| {
                let verdict = {
                    let mut st = state.lock();
                    if st.done {
                        Verdict::Wait
                    } else if decisive.as_ref().is_some_and(|d| (**d)(&outcome)) {
                        st.done = true;
                        Verdict::Decide(outcome)
                    } else {
                        st.stash.push((idx, outcome));
                        st.pending -= 1;
                        if st.pending == 0 {
                            st.done = true;
                            Verdict::Finish(std::mem::take(&mut st.stash))
                        } else {
                            Verdict::Wait
                        }
                    }
                };
                match verdict {
                    Verdict::Decide(out) => {
                        local.cancel();
                        match trap(|| (*to_decisive)(out)) {
                            Ok(mapped) => deliver(&obs, mapped),
                            Err(crash) => obs.on_crash(crash),
                        }
                    }
                    Verdict::Finish(stash) => match trap(|| (*finish)(stash)) {
                        Ok(out) => deliver(&obs, out),
                        Err(crash) => obs.on_crash(crash),
                    },
                    Verdict::Wait => {}
                }
            })
        };

        // Operands start in order; a synchronous decisive outcome cancels the
        // shared runtime before the remaining operands even begin.
        for (idx, item) in items.iter().enumerate() {
            if shared.is_cancelled() {
                break;
            }
            let s1 = Arc::clone(&settle);
            let s2 = Arc::clone(&settle);
            let s3 = Arc::clone(&settle);
            let observer = Observer::new(
                move |c: Crash| (*s1)(idx, Outcome::Crash(c)),
                move |f: F| (*s2)(idx, Outcome::Else(f)),
                move |a: A| (*s3)(idx, Outcome::Then(a)),
            );
            item.run_raw(&shared, observer);
        }
    })
}

// =============================================================================
// Sequential engine
// =============================================================================

enum Seq<Acc, F2, A2> {
    Next { idx: usize, acc: Acc },
    Halt(Outcome<F2, A2>),
}

fn fan_seq<E, F, A, F2, A2, Acc>(
    items: Vec<Cont<E, F, A>>,
    init: Arc<dyn Fn() -> Acc + Send + Sync>,
    on_outcome: Arc<dyn Fn(usize, Outcome<F, A>, &mut Acc) -> Option<Outcome<F2, A2>> + Send + Sync>,
    finish: Arc<dyn Fn(Acc) -> Outcome<F2, A2> + Send + Sync>,
) -> Cont<E, F2, A2>
where
    E: Value,
    F: Value,
    A: Value,
    F2: Value,
    A2: Value,
    Acc: Send + 'static,
{
    let items = Arc::new(items);
    Cont::from_run(move |rt, obs: Observer<F2, A2>| {
        let guard_rt = rt.clone();
        let step_rt = rt.clone();
        let guard_items = Arc::clone(&items);
        let step_items = Arc::clone(&items);
        let on_outcome = Arc::clone(&on_outcome);
        let finish = Arc::clone(&finish);
        drive::<Seq<Acc, F2, A2>, Option<Outcome<F2, A2>>>(
            Seq::Next {
                idx: 0,
                acc: (*init)(),
            },
            move |state| {
                if guard_rt.is_cancelled() {
                    return ContinueOrStop::Stop(None);
                }
                match state {
                    Seq::Halt(out) => ContinueOrStop::Stop(Some(out)),
                    Seq::Next { idx, acc } => {
                        if idx >= guard_items.len() {
                            match trap(|| (*finish)(acc)) {
                                Ok(out) => ContinueOrStop::Stop(Some(out)),
                                Err(crash) => ContinueOrStop::Stop(Some(Outcome::Crash(crash))),
                            }
                        } else {
                            ContinueOrStop::Continue(Seq::Next { idx, acc })
                        }
                    }
                }
            },
            move |state, resume| {
                let Seq::Next { idx, acc } = state else {
                    return;
                };
                let item = step_items[idx].clone();
                let carry = Arc::new(Mutex::new(Some(acc)));
                let resume = once_sink(resume);
                let on_outcome = Arc::clone(&on_outcome);
                let settle = move |outcome: Outcome<F, A>| {
                    let acc = carry.lock().take();
                    let Some(mut acc) = acc else { return };
                    match trap(|| (*on_outcome)(idx, outcome, &mut acc)) {
                        Ok(Some(halt)) => resume(Seq::Halt(halt)),
                        Ok(None) => resume(Seq::Next { idx: idx + 1, acc }),
                        Err(crash) => resume(Seq::Halt(Outcome::Crash(crash))),
                    }
                };
                let s1 = settle.clone();
                let s2 = settle.clone();
                let observer = Observer::new(
                    move |c: Crash| s1(Outcome::Crash(c)),
                    move |f: F| s2(Outcome::Else(f)),
                    move |a: A| settle(Outcome::Then(a)),
                );
                item.run_raw(&step_rt, observer);
            },
            move |out| {
                if let Some(out) = out {
                    deliver(&obs, out);
                }
            },
        );
    })
}

// =============================================================================
// both / all
// =============================================================================

/// Combine two computations' successes; failures merge per policy.
///
/// The decisive outcome for `both` is the first `Else` or `Crash`. Under
/// `Sequence` this is exactly the `then_do`/`then_map` desugaring; under
/// `RunAll`, typed errors merge in first-failure order while a double crash
/// keeps operand order in [`Crash::Merged`].
pub fn both<E, F, A, B, C>(
    left: Cont<E, F, A>,
    right: Cont<E, F, B>,
    combine: impl Fn(A, B) -> C + Send + Sync + 'static,
    policy: OkPolicy<F>,
) -> Cont<E, F, C>
where
    E: Value,
    F: Value,
    A: Value,
    B: Value,
    C: Value,
{
    let combine: Arc<dyn Fn(A, B) -> C + Send + Sync> = Arc::new(combine);
    match policy {
        OkPolicy::Sequence => left.then_do(move |a| {
            let combine = Arc::clone(&combine);
            right.clone().then_map(move |b| (*combine)(a.clone(), b))
        }),
        OkPolicy::QuitFast => {
            let items = vec![
                left.then_map(Branch::Left),
                right.then_map(Branch::Right),
            ];
            let combine = Arc::clone(&combine);
            fan_out(
                items,
                Some(Arc::new(|out: &Outcome<F, Branch<A, B>>| !out.is_then())),
                Arc::new(|out| match out {
                    Outcome::Else(f) => Outcome::Else(f),
                    Outcome::Crash(c) => Outcome::Crash(c),
                    Outcome::Then(_) => unreachable!("success is never decisive for both"),
                }),
                Arc::new(move |stash| both_finish_success(stash, &combine)),
            )
        }
        OkPolicy::RunAll {
            combine: combine_err,
            favor_crash,
        } => {
            let items = vec![
                left.then_map(Branch::Left),
                right.then_map(Branch::Right),
            ];
            let combine = Arc::clone(&combine);
            fan_out(
                items,
                None,
                Arc::new(|_| unreachable!("run-all marks no outcome decisive")),
                Arc::new(move |stash| {
                    both_finish_run_all(stash, &combine, &combine_err, favor_crash)
                }),
            )
        }
    }
}

fn both_finish_success<F, A, B, C>(
    stash: Vec<(usize, Outcome<F, Branch<A, B>>)>,
    combine: &Arc<dyn Fn(A, B) -> C + Send + Sync>,
) -> Outcome<F, C> {
    let mut a = None;
    let mut b = None;
    for (_idx, out) in stash {
        match out {
            Outcome::Then(Branch::Left(value)) => a = Some(value),
            Outcome::Then(Branch::Right(value)) => b = Some(value),
            _ => unreachable!("failures are decisive for both under quit-fast"),
        }
    }
    match (a, b) {
        (Some(a), Some(b)) => Outcome::Then((*combine)(a, b)),
        _ => unreachable!("both operands settled"),
    }
}

fn both_finish_run_all<F, A, B, C>(
    stash: Vec<(usize, Outcome<F, Branch<A, B>>)>,
    combine: &Arc<dyn Fn(A, B) -> C + Send + Sync>,
    combine_err: &Arc<dyn Fn(F, F) -> F + Send + Sync>,
    favor_crash: bool,
) -> Outcome<F, C> {
    let mut then_left = None;
    let mut then_right = None;
    let mut else_left = None;
    let mut else_right = None;
    let mut crash_left = None;
    let mut crash_right = None;
    let mut first_else_idx = None;
    for (idx, out) in stash {
        match out {
            Outcome::Then(Branch::Left(a)) => then_left = Some(a),
            Outcome::Then(Branch::Right(b)) => then_right = Some(b),
            Outcome::Else(f) => {
                first_else_idx.get_or_insert(idx);
                if idx == 0 {
                    else_left = Some(f);
                } else {
                    else_right = Some(f);
                }
            }
            Outcome::Crash(c) => {
                if idx == 0 {
                    crash_left = Some(c);
                } else {
                    crash_right = Some(c);
                }
            }
        }
    }

    let mut crash = merge_two(crash_left, crash_right);
    if favor_crash {
        if let Some(crash) = crash.take() {
            return Outcome::Crash(crash);
        }
    }
    match (else_left, else_right) {
        (Some(left), Some(right)) => {
            // First-failed-first ordering for the merged error.
            let merged = if first_else_idx == Some(0) {
                (*combine_err)(left, right)
            } else {
                (*combine_err)(right, left)
            };
            return Outcome::Else(merged);
        }
        (Some(single), None) | (None, Some(single)) => return Outcome::Else(single),
        (None, None) => {}
    }
    if let Some(crash) = crash {
        return Outcome::Crash(crash);
    }
    match (then_left, then_right) {
        (Some(a), Some(b)) => Outcome::Then((*combine)(a, b)),
        _ => unreachable!("both operands settled"),
    }
}

/// Generalise [`both`] to an ordered list.
///
/// The success value preserves input order regardless of completion order.
/// Under `RunAll`, errors merge with the policy combiner in first-failure
/// order and multiple crashes collect keyed by input index.
pub fn all<E, F, A>(items: Vec<Cont<E, F, A>>, policy: OkPolicy<F>) -> Cont<E, F, Vec<A>>
where
    E: Value,
    F: Value,
    A: Value,
{
    match policy {
        OkPolicy::Sequence => fan_seq(
            items,
            Arc::new(Vec::new),
            Arc::new(|_idx, outcome, acc: &mut Vec<A>| match outcome {
                Outcome::Then(a) => {
                    acc.push(a);
                    None
                }
                Outcome::Else(f) => Some(Outcome::Else(f)),
                Outcome::Crash(c) => Some(Outcome::Crash(c)),
            }),
            Arc::new(|acc| Outcome::Then(acc)),
        ),
        OkPolicy::QuitFast => {
            let len = items.len();
            fan_out(
                items,
                Some(Arc::new(|out: &Outcome<F, A>| !out.is_then())),
                Arc::new(|out| match out {
                    Outcome::Else(f) => Outcome::Else(f),
                    Outcome::Crash(c) => Outcome::Crash(c),
                    Outcome::Then(_) => unreachable!("success is never decisive for all"),
                }),
                Arc::new(move |stash| {
                    let mut slots: Vec<Option<A>> = vec![None; len];
                    for (idx, out) in stash {
                        if let Outcome::Then(a) = out {
                            slots[idx] = Some(a);
                        }
                    }
                    Outcome::Then(slots.into_iter().flatten().collect())
                }),
            )
        }
        OkPolicy::RunAll {
            combine: combine_err,
            favor_crash,
        } => {
            let len = items.len();
            fan_out(
                items,
                None,
                Arc::new(|_| unreachable!("run-all marks no outcome decisive")),
                Arc::new(move |stash| {
                    let mut crashes = BTreeMap::new();
                    let mut elses = Vec::new(); // arrival order == failure order
                    let mut slots: Vec<Option<A>> = vec![None; len];
                    for (idx, out) in stash {
                        match out {
                            Outcome::Then(a) => slots[idx] = Some(a),
                            Outcome::Else(f) => elses.push(f),
                            Outcome::Crash(c) => {
                                crashes.insert(idx, c);
                            }
                        }
                    }
                    if favor_crash && !crashes.is_empty() {
                        return Outcome::Crash(fold_crashes(crashes));
                    }
                    if let Some(merged) = elses
                        .into_iter()
                        .reduce(|acc, next| (*combine_err)(acc, next))
                    {
                        return Outcome::Else(merged);
                    }
                    if !crashes.is_empty() {
                        return Outcome::Crash(fold_crashes(crashes));
                    }
                    Outcome::Then(slots.into_iter().flatten().collect())
                }),
            )
        }
    }
}

// =============================================================================
// either / any
// =============================================================================

/// Race two computations for a success; both failing merges the errors.
///
/// The decisive outcome for `either` is the first `Then` or the first
/// `Crash` (crash fusion is `coalesce`'s job, not `either`'s).
pub fn either<E, F, G, H, A>(
    left: Cont<E, F, A>,
    right: Cont<E, G, A>,
    combine_err: impl Fn(F, G) -> H + Send + Sync + 'static,
    policy: OkPolicy<A>,
) -> Cont<E, H, A>
where
    E: Value,
    F: Value,
    G: Value,
    H: Value,
    A: Value,
{
    let combine_err: Arc<dyn Fn(F, G) -> H + Send + Sync> = Arc::new(combine_err);
    match policy {
        OkPolicy::Sequence => left.else_do(move |f| {
            let combine_err = Arc::clone(&combine_err);
            right.clone().else_map(move |g| (*combine_err)(f.clone(), g))
        }),
        OkPolicy::QuitFast => {
            let items = vec![
                left.else_map(Branch::Left),
                right.else_map(Branch::Right),
            ];
            let combine_err = Arc::clone(&combine_err);
            fan_out(
                items,
                Some(Arc::new(|out: &Outcome<Branch<F, G>, A>| !out.is_else())),
                Arc::new(|out| match out {
                    Outcome::Then(a) => Outcome::Then(a),
                    Outcome::Crash(c) => Outcome::Crash(c),
                    Outcome::Else(_) => unreachable!("typed failure is never decisive for either"),
                }),
                Arc::new(move |stash| either_finish_failure(stash, &combine_err)),
            )
        }
        OkPolicy::RunAll {
            combine,
            favor_crash,
        } => {
            let items = vec![
                left.else_map(Branch::Left),
                right.else_map(Branch::Right),
            ];
            let combine_err = Arc::clone(&combine_err);
            fan_out(
                items,
                None,
                Arc::new(|_| unreachable!("run-all marks no outcome decisive")),
                Arc::new(move |stash| {
                    either_finish_run_all(stash, &combine, &combine_err, favor_crash)
                }),
            )
        }
    }
}

fn either_finish_failure<F, G, H, A>(
    stash: Vec<(usize, Outcome<Branch<F, G>, A>)>,
    combine_err: &Arc<dyn Fn(F, G) -> H + Send + Sync>,
) -> Outcome<H, A> {
    let mut f = None;
    let mut g = None;
    for (_idx, out) in stash {
        match out {
            Outcome::Else(Branch::Left(error)) => f = Some(error),
            Outcome::Else(Branch::Right(error)) => g = Some(error),
            _ => unreachable!("successes and crashes are decisive for either under quit-fast"),
        }
    }
    match (f, g) {
        (Some(f), Some(g)) => Outcome::Else((*combine_err)(f, g)),
        _ => unreachable!("both operands settled"),
    }
}

fn either_finish_run_all<F, G, H, A>(
    stash: Vec<(usize, Outcome<Branch<F, G>, A>)>,
    combine: &Arc<dyn Fn(A, A) -> A + Send + Sync>,
    combine_err: &Arc<dyn Fn(F, G) -> H + Send + Sync>,
    favor_crash: bool,
) -> Outcome<H, A> {
    let mut thens = Vec::new(); // arrival order == success order
    let mut else_left = None;
    let mut else_right = None;
    let mut crash_left = None;
    let mut crash_right = None;
    for (idx, out) in stash {
        match out {
            Outcome::Then(a) => thens.push(a),
            Outcome::Else(Branch::Left(f)) => else_left = Some(f),
            Outcome::Else(Branch::Right(g)) => else_right = Some(g),
            Outcome::Crash(c) => {
                if idx == 0 {
                    crash_left = Some(c);
                } else {
                    crash_right = Some(c);
                }
            }
        }
    }

    let mut crash = merge_two(crash_left, crash_right);
    if favor_crash {
        if let Some(crash) = crash.take() {
            return Outcome::Crash(crash);
        }
    }
    if let Some(merged) = thens.into_iter().reduce(|acc, next| (*combine)(acc, next)) {
        return Outcome::Then(merged);
    }
    if let (Some(f), Some(g)) = (else_left, else_right) {
        return Outcome::Else((*combine_err)(f, g));
    }
    match crash {
        Some(crash) => Outcome::Crash(crash),
        None => unreachable!("both operands settled"),
    }
}

/// Generalise [`either`] to an ordered list: first success wins, and when
/// every operand fails the typed errors are reported in input order.
pub fn any<E, F, A>(items: Vec<Cont<E, F, A>>, policy: OkPolicy<A>) -> Cont<E, Vec<F>, A>
where
    E: Value,
    F: Value,
    A: Value,
{
    match policy {
        OkPolicy::Sequence => fan_seq(
            items,
            Arc::new(Vec::new),
            Arc::new(|_idx, outcome, acc: &mut Vec<F>| match outcome {
                Outcome::Then(a) => Some(Outcome::Then(a)),
                Outcome::Crash(c) => Some(Outcome::Crash(c)),
                Outcome::Else(f) => {
                    acc.push(f);
                    None
                }
            }),
            Arc::new(|acc| Outcome::Else(acc)),
        ),
        OkPolicy::QuitFast => {
            let len = items.len();
            fan_out(
                items,
                Some(Arc::new(|out: &Outcome<F, A>| !out.is_else())),
                Arc::new(|out| match out {
                    Outcome::Then(a) => Outcome::Then(a),
                    Outcome::Crash(c) => Outcome::Crash(c),
                    Outcome::Else(_) => unreachable!("typed failure is never decisive for any"),
                }),
                Arc::new(move |stash| {
                    let mut slots: Vec<Option<F>> = vec![None; len];
                    for (idx, out) in stash {
                        if let Outcome::Else(f) = out {
                            slots[idx] = Some(f);
                        }
                    }
                    Outcome::Else(slots.into_iter().flatten().collect())
                }),
            )
        }
        OkPolicy::RunAll {
            combine,
            favor_crash,
        } => {
            let len = items.len();
            fan_out(
                items,
                None,
                Arc::new(|_| unreachable!("run-all marks no outcome decisive")),
                Arc::new(move |stash| {
                    let mut crashes = BTreeMap::new();
                    let mut thens = Vec::new(); // arrival order == success order
                    let mut slots: Vec<Option<F>> = vec![None; len];
                    for (idx, out) in stash {
                        match out {
                            Outcome::Then(a) => thens.push(a),
                            Outcome::Else(f) => slots[idx] = Some(f),
                            Outcome::Crash(c) => {
                                crashes.insert(idx, c);
                            }
                        }
                    }
                    if favor_crash && !crashes.is_empty() {
                        return Outcome::Crash(fold_crashes(crashes));
                    }
                    if let Some(merged) = thens.into_iter().reduce(|acc, next| (*combine)(acc, next))
                    {
                        return Outcome::Then(merged);
                    }
                    let errors: Vec<F> = slots.into_iter().flatten().collect();
                    if !errors.is_empty() || crashes.is_empty() {
                        return Outcome::Else(errors);
                    }
                    Outcome::Crash(fold_crashes(crashes))
                }),
            )
        }
    }
}

// =============================================================================
// coalesce / converge
// =============================================================================

/// Fuse the crash paths of two computations: the first non-crash outcome
/// wins, and only a double crash crashes (operand order preserved in
/// [`Crash::Merged`]).
pub fn coalesce<E, F, A>(
    left: Cont<E, F, A>,
    right: Cont<E, F, A>,
    policy: CrashPolicy<F, A>,
) -> Cont<E, F, A>
where
    E: Value,
    F: Value,
    A: Value,
{
    match policy {
        CrashPolicy::Sequence => left.crash_do(move |first| {
            let first = first.clone();
            right
                .clone()
                .crash_do(move |second| Cont::crash(Crash::merged(first.clone(), second)))
        }),
        CrashPolicy::QuitFast => fan_out(
            vec![left, right],
            Some(Arc::new(|out: &Outcome<F, A>| !out.is_crash())),
            Arc::new(|out| out),
            Arc::new(|stash| Outcome::Crash(coalesce_stash_crash(stash))),
        ),
        CrashPolicy::RunAll {
            favor_else,
            combine_else,
            combine_then,
        } => fan_out(
            vec![left, right],
            None,
            Arc::new(|_| unreachable!("run-all marks no outcome decisive")),
            Arc::new(move |stash| {
                crash_fuse_run_all(stash, favor_else, &combine_else, &combine_then, true)
            }),
        ),
    }
}

/// Generalise [`coalesce`] to an ordered list; an all-crash outcome collects
/// the crashes keyed by input index.
pub fn converge<E, F, A>(items: Vec<Cont<E, F, A>>, policy: CrashPolicy<F, A>) -> Cont<E, F, A>
where
    E: Value,
    F: Value,
    A: Value,
{
    match policy {
        CrashPolicy::Sequence => fan_seq(
            items,
            Arc::new(BTreeMap::new),
            Arc::new(
                |idx, outcome, acc: &mut BTreeMap<usize, Crash>| match outcome {
                    Outcome::Then(a) => Some(Outcome::Then(a)),
                    Outcome::Else(f) => Some(Outcome::Else(f)),
                    Outcome::Crash(c) => {
                        acc.insert(idx, c);
                        None
                    }
                },
            ),
            Arc::new(|acc| Outcome::Crash(fold_crashes(acc))),
        ),
        CrashPolicy::QuitFast => fan_out(
            items,
            Some(Arc::new(|out: &Outcome<F, A>| !out.is_crash())),
            Arc::new(|out| out),
            Arc::new(|stash| {
                let crashes = stash
                    .into_iter()
                    .filter_map(|(idx, out)| out.into_crash().map(|c| (idx, c)))
                    .collect();
                Outcome::Crash(fold_crashes(crashes))
            }),
        ),
        CrashPolicy::RunAll {
            favor_else,
            combine_else,
            combine_then,
        } => fan_out(
            items,
            None,
            Arc::new(|_| unreachable!("run-all marks no outcome decisive")),
            Arc::new(move |stash| {
                crash_fuse_run_all(stash, favor_else, &combine_else, &combine_then, false)
            }),
        ),
    }
}

fn coalesce_stash_crash<F, A>(stash: Vec<(usize, Outcome<F, A>)>) -> Crash {
    let mut left = None;
    let mut right = None;
    for (idx, out) in stash {
        if let Outcome::Crash(c) = out {
            if idx == 0 {
                left = Some(c);
            } else {
                right = Some(c);
            }
        }
    }
    match merge_two(left, right) {
        Some(crash) => crash,
        None => unreachable!("quit-fast finish for coalesce implies both crashed"),
    }
}

fn crash_fuse_run_all<F, A>(
    stash: Vec<(usize, Outcome<F, A>)>,
    favor_else: bool,
    combine_else: &Arc<dyn Fn(F, F) -> F + Send + Sync>,
    combine_then: &Arc<dyn Fn(A, A) -> A + Send + Sync>,
    two_way: bool,
) -> Outcome<F, A> {
    let mut thens = Vec::new(); // arrival order
    let mut elses = Vec::new(); // arrival order
    let mut crashes = BTreeMap::new();
    for (idx, out) in stash {
        match out {
            Outcome::Then(a) => thens.push(a),
            Outcome::Else(f) => elses.push(f),
            Outcome::Crash(c) => {
                crashes.insert(idx, c);
            }
        }
    }

    if favor_else {
        if let Some(merged) = fold_with(elses, combine_else) {
            return Outcome::Else(merged);
        }
        if let Some(merged) = fold_with(thens, combine_then) {
            return Outcome::Then(merged);
        }
    } else {
        if let Some(merged) = fold_with(thens, combine_then) {
            return Outcome::Then(merged);
        }
        if let Some(merged) = fold_with(elses, combine_else) {
            return Outcome::Else(merged);
        }
    }

    if two_way {
        let left = crashes.remove(&0);
        let right = crashes.remove(&1);
        match merge_two(left, right) {
            Some(crash) => Outcome::Crash(crash),
            None => unreachable!("all operands settled"),
        }
    } else {
        Outcome::Crash(fold_crashes(crashes))
    }
}

fn fold_with<T>(values: Vec<T>, combine: &Arc<dyn Fn(T, T) -> T + Send + Sync>) -> Option<T> {
    values.into_iter().reduce(|acc, next| (*combine)(acc, next))
}

// =============================================================================
// Instance sugars
// =============================================================================

impl<E, F, A> Cont<E, F, A>
where
    E: Value,
    F: Value,
    A: Value,
{
    /// `both(self, other, ...)`.
    pub fn and<B, C>(
        self,
        other: Cont<E, F, B>,
        combine: impl Fn(A, B) -> C + Send + Sync + 'static,
        policy: OkPolicy<F>,
    ) -> Cont<E, F, C>
    where
        B: Value,
        C: Value,
    {
        both(self, other, combine, policy)
    }

    /// `either(self, other, ...)`.
    pub fn or<G, H>(
        self,
        other: Cont<E, G, A>,
        combine_err: impl Fn(F, G) -> H + Send + Sync + 'static,
        policy: OkPolicy<A>,
    ) -> Cont<E, H, A>
    where
        G: Value,
        H: Value,
    {
        either(self, other, combine_err, policy)
    }

    /// `coalesce(self, other, ...)`.
    pub fn coalesce_with(self, other: Cont<E, F, A>, policy: CrashPolicy<F, A>) -> Cont<E, F, A> {
        coalesce(self, other, policy)
    }
}

// =============================================================================
// Tests
// =============================================================================
