//! Operators over the then (success) channel.
//!
//! Every operator here passes `Else` and `Crash` outcomes through verbatim
//! and only touches `Then`. User functions are invoked behind the trap
//! boundary, and cancellation is polled before each invocation.

use std::sync::Arc;

use crate::cont::Cont;
use crate::crash::trap;
use crate::driver::{ContinueOrStop, loop_cont};
use crate::never::Never;
use crate::observer::Observer;
use crate::outcome::Outcome;
use crate::value::Value;

impl<E, F, A> Cont<E, F, A>
where
    E: Value,
    F: Value,
    A: Value,
{
    /// Chain: on success, run the computation produced by `k`.
    ///
    /// A panic in `k` becomes a crash; `Else` and `Crash` pass through.
    pub fn then_do<B>(self, k: impl Fn(A) -> Cont<E, F, B> + Send + Sync + 'static) -> Cont<E, F, B>
    where
        B: Value,
    {
        let k = Arc::new(k);
        Cont::from_run(move |rt, obs: Observer<F, B>| {
            let rt2 = rt.clone();
            let k = Arc::clone(&k);
            let downstream = obs.clone();
            let upstream = obs.with_on_then(move |a: A| {
                if rt2.is_cancelled() {
                    return;
                }
                match trap(|| (*k)(a)) {
                    Ok(next) => next.run_raw(&rt2, downstream.clone()),
                    Err(crash) => downstream.on_crash(crash),
                }
            });
            self.run_raw(rt, upstream);
        })
    }

    /// Map the success value.
    pub fn then_map<B>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Cont<E, F, B>
    where
        B: Value,
    {
        let f = Arc::new(f);
        Cont::from_run(move |rt, obs: Observer<F, B>| {
            let rt2 = rt.clone();
            let f = Arc::clone(&f);
            let downstream = obs.clone();
            let upstream = obs.with_on_then(move |a: A| {
                if rt2.is_cancelled() {
                    return;
                }
                match trap(|| (*f)(a)) {
                    Ok(b) => downstream.on_then(b),
                    Err(crash) => downstream.on_crash(crash),
                }
            });
            self.run_raw(rt, upstream);
        })
    }

    /// Replace the success value with a constant.
    pub fn then_map_to<B>(self, value: B) -> Cont<E, F, B>
    where
        B: Value,
    {
        self.then_map(move |_| value.clone())
    }

    /// Side computation on success, keeping the original value.
    ///
    /// If the side computation fails on either failure channel, its failure
    /// supersedes the original success.
    pub fn then_tap<B>(self, k: impl Fn(A) -> Cont<E, F, B> + Send + Sync + 'static) -> Cont<E, F, A>
    where
        B: Value,
    {
        self.then_do(move |a| {
            let original = a.clone();
            k(a).then_map(move |_| original.clone())
        })
    }

    /// Chain and keep both values paired.
    pub fn then_zip<B>(
        self,
        k: impl Fn(A) -> Cont<E, F, B> + Send + Sync + 'static,
    ) -> Cont<E, F, (A, B)>
    where
        B: Value,
    {
        self.then_do(move |a| {
            let first = a.clone();
            k(a).then_map(move |b| (first.clone(), b))
        })
    }

    /// Fire-and-forget a side computation on success.
    ///
    /// The side computation runs under the same runtime with every outcome
    /// dropped; the original success is emitted immediately. A panic while
    /// building the side computation still crashes the pipeline.
    pub fn then_fork<B>(self, k: impl Fn(A) -> Cont<E, F, B> + Send + Sync + 'static) -> Cont<E, F, A>
    where
        B: Value,
    {
        let k = Arc::new(k);
        Cont::from_run(move |rt, obs: Observer<F, A>| {
            let rt2 = rt.clone();
            let k = Arc::clone(&k);
            let downstream = obs.clone();
            let upstream = obs.with_on_then(move |a: A| {
                if rt2.is_cancelled() {
                    return;
                }
                match trap(|| (*k)(a.clone())) {
                    Ok(side) => {
                        side.run_raw(&rt2, Observer::ignore());
                        downstream.on_then(a);
                    }
                    Err(crash) => downstream.on_crash(crash),
                }
            });
            self.run_raw(rt, upstream);
        })
    }

    /// Chain through `k` only when `pred` holds; otherwise keep the value.
    pub fn then_if(
        self,
        pred: impl Fn(&A) -> bool + Send + Sync + 'static,
        k: impl Fn(A) -> Cont<E, F, A> + Send + Sync + 'static,
    ) -> Cont<E, F, A> {
        self.then_do(move |a| if pred(&a) { k(a) } else { Cont::of(a) })
    }

    /// Re-run while `pred` holds for each success; emit the first success for
    /// which it does not.
    ///
    /// `Else` and `Crash` leave the loop propagating the outcome. Iteration is
    /// trampolined, so synchronous sources do not grow the stack.
    pub fn then_while(self, pred: impl Fn(&A) -> bool + Send + Sync + 'static) -> Cont<E, F, A> {
        let pred = Arc::new(pred);
        loop_cont(
            self,
            Arc::new(move |outcome: Outcome<F, A>| match outcome {
                Outcome::Then(a) => match trap(|| (*pred)(&a)) {
                    Ok(true) => ContinueOrStop::Continue(()),
                    Ok(false) => ContinueOrStop::Stop(Outcome::Then(a)),
                    Err(crash) => ContinueOrStop::Stop(Outcome::Crash(crash)),
                },
                other => ContinueOrStop::Stop(other),
            }),
        )
    }

    /// Re-run until `pred` holds for a success.
    pub fn then_until(self, pred: impl Fn(&A) -> bool + Send + Sync + 'static) -> Cont<E, F, A> {
        self.then_while(move |a| !pred(a))
    }

    /// Re-run on every success, forever.
    ///
    /// The then channel of the result is uninhabited; only `Else`, `Crash`,
    /// or cancellation leave the loop.
    pub fn then_forever(self) -> Cont<E, F, Never> {
        loop_cont(
            self,
            Arc::new(|outcome: Outcome<F, A>| match outcome {
                Outcome::Then(_) => ContinueOrStop::Continue(()),
                Outcome::Else(f) => ContinueOrStop::Stop(Outcome::Else(f)),
                Outcome::Crash(c) => ContinueOrStop::Stop(Outcome::Crash(c)),
            }),
        )
    }

    /// Move successes onto the else channel.
    pub fn demote(self, to_error: impl Fn(A) -> F + Send + Sync + 'static) -> Cont<E, F, Never> {
        let to_error = Arc::new(to_error);
        Cont::from_run(move |rt, obs: Observer<F, Never>| {
            let rt2 = rt.clone();
            let to_error = Arc::clone(&to_error);
            let downstream = obs.clone();
            let upstream = obs.with_on_then(move |a: A| {
                if rt2.is_cancelled() {
                    return;
                }
                match trap(|| (*to_error)(a)) {
                    Ok(error) => downstream.on_else(error),
                    Err(crash) => downstream.on_crash(crash),
                }
            });
            self.run_raw(rt, upstream);
        })
    }
}

impl<E, F> Cont<E, F, Never>
where
    E: Value,
    F: Value,
{
    /// Widen an uninhabited then channel to any success type.
    ///
    /// Type-level only: the replacement callback can never be invoked.
    pub fn then_absurd<B>(self) -> Cont<E, F, B>
    where
        B: Value,
    {
        Cont::from_run(move |rt, obs: Observer<F, B>| {
            self.run_raw(rt, obs.absurd_then());
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cont::RunCallbacks;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorded() -> (Arc<Mutex<Vec<String>>>, RunCallbacks<&'static str, i32>) {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let l1 = Arc::clone(&log);
        let l2 = Arc::clone(&log);
        let l3 = Arc::clone(&log);
        let callbacks = RunCallbacks::new()
            .on_then(move |a: i32| l1.lock().unwrap().push(format!("then:{a}")))
            .on_else(move |f: &str| l2.lock().unwrap().push(format!("else:{f}")))
            .on_crash(move |c| l3.lock().unwrap().push(format!("crash:{}", c.first_message())));
        (log, callbacks)
    }

    // -- then_do / then_map ----------------------------------------------------

    #[test]
    fn then_chain_end_to_end() {
        let (log, callbacks) = recorded();
        Cont::<(), &str, i32>::of(0)
            .then_map(|n| n + 1)
            .then_do(|n| Cont::of(n * 2))
            .run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["then:2"]);
    }

    #[test]
    fn then_map_skips_else() {
        let (log, callbacks) = recorded();
        Cont::<(), &str, i32>::error("nf")
            .then_map(|_| unreachable!("mapper must not run"))
            .run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["else:nf"]);
    }

    #[test]
    fn then_map_panic_becomes_crash() {
        let (log, callbacks) = recorded();
        Cont::<(), &str, i32>::of(1)
            .then_map(|_| -> i32 { panic!("mapper broke") })
            .run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["crash:mapper broke"]);
    }

    #[test]
    fn then_do_panic_becomes_crash() {
        let (log, callbacks) = recorded();
        Cont::<(), &str, i32>::of(1)
            .then_do(|_| -> Cont<(), &str, i32> { panic!("continuation broke") })
            .run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["crash:continuation broke"]);
    }

    #[test]
    fn then_map_to_replaces_value() {
        let (log, callbacks) = recorded();
        Cont::<(), &str, i32>::of(1).then_map_to(99).run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["then:99"]);
    }

    // -- then_tap / then_zip / then_fork ---------------------------------------

    #[test]
    fn then_tap_keeps_original_value() {
        let taps = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&taps);
        let (log, callbacks) = recorded();
        Cont::<(), &str, i32>::of(5)
            .then_tap(move |n| {
                seen.fetch_add(usize::try_from(n).unwrap_or(0), Ordering::SeqCst);
                Cont::of("side effect done")
            })
            .run((), callbacks);
        assert_eq!(taps.load(Ordering::SeqCst), 5);
        assert_eq!(log.lock().unwrap().as_slice(), ["then:5"]);
    }

    #[test]
    fn then_tap_failure_supersedes() {
        let (log, callbacks) = recorded();
        Cont::<(), &str, i32>::of(5)
            .then_tap(|_| Cont::<(), &str, i32>::error("tap failed"))
            .run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["else:tap failed"]);
    }

    #[test]
    fn then_zip_pairs_values() {
        let (log, callbacks) = recorded();
        Cont::<(), &str, i32>::of(3)
            .then_zip(|n| Cont::of(n * 10))
            .then_map(|(a, b)| a + b)
            .run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["then:33"]);
    }

    #[test]
    fn then_fork_runs_side_and_emits_original() {
        let side = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&side);
        let (log, callbacks) = recorded();
        Cont::<(), &str, i32>::of(4)
            .then_fork(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Cont::<(), &str, i32>::error("dropped by fork")
            })
            .run((), callbacks);
        assert_eq!(side.load(Ordering::SeqCst), 1);
        assert_eq!(log.lock().unwrap().as_slice(), ["then:4"]);
    }

    // -- then_if ---------------------------------------------------------------

    #[test]
    fn then_if_chains_conditionally() {
        let (log, callbacks) = recorded();
        Cont::<(), &str, i32>::of(10)
            .then_if(|n| *n > 5, |n| Cont::of(n * 2))
            .run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["then:20"]);

        let (log, callbacks) = recorded();
        Cont::<(), &str, i32>::of(3)
            .then_if(|n| *n > 5, |n| Cont::of(n * 2))
            .run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["then:3"]);
    }

    // -- loops -----------------------------------------------------------------

    #[test]
    fn then_while_iterates_until_predicate_fails() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::clone(&counter);
        let source = Cont::<(), &str, i32>::from_run(move |_rt, obs| {
            let n = ticks.fetch_add(1, Ordering::SeqCst);
            obs.on_then(i32::try_from(n).unwrap_or(i32::MAX));
        });

        let (log, callbacks) = recorded();
        source.then_while(|n| *n < 4).run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["then:4"]);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn then_while_is_stack_safe() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::clone(&counter);
        let source = Cont::<(), &str, i32>::from_run(move |_rt, obs| {
            let n = ticks.fetch_add(1, Ordering::SeqCst);
            obs.on_then(i32::try_from(n).unwrap_or(i32::MAX));
        });

        let (log, callbacks) = recorded();
        source.then_while(|n| *n < 100_000).run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["then:100000"]);
    }

    #[test]
    fn then_while_propagates_else() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::clone(&counter);
        let source = Cont::<(), &str, i32>::from_run(move |_rt, obs| {
            let n = ticks.fetch_add(1, Ordering::SeqCst);
            if n >= 3 {
                obs.on_else("exhausted");
            } else {
                obs.on_then(i32::try_from(n).unwrap_or(i32::MAX));
            }
        });

        let (log, callbacks) = recorded();
        source.then_while(|_| true).run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["else:exhausted"]);
    }

    #[test]
    fn then_while_predicate_panic_becomes_crash() {
        let (log, callbacks) = recorded();
        Cont::<(), &str, i32>::of(1)
            .then_while(|_| -> bool { panic!("predicate broke") })
            .run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["crash:predicate broke"]);
    }

    #[test]
    fn then_until_is_inverse_of_while() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::clone(&counter);
        let source = Cont::<(), &str, i32>::from_run(move |_rt, obs| {
            let n = ticks.fetch_add(1, Ordering::SeqCst);
            obs.on_then(i32::try_from(n).unwrap_or(i32::MAX));
        });

        let (log, callbacks) = recorded();
        source.then_until(|n| *n >= 2).run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["then:2"]);
    }

    #[test]
    fn then_forever_exits_on_else_only() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::clone(&counter);
        let source = Cont::<(), &str, i32>::from_run(move |_rt, obs| {
            let n = ticks.fetch_add(1, Ordering::SeqCst);
            if n >= 10 {
                obs.on_else("stopped");
            } else {
                obs.on_then(1);
            }
        });

        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let l1 = Arc::clone(&log);
        let l2 = Arc::clone(&log);
        source.then_forever().then_absurd::<i32>().run(
            (),
            RunCallbacks::new()
                .on_then(move |n: i32| l1.lock().unwrap().push(format!("then:{n}")))
                .on_else(move |f: &str| l2.lock().unwrap().push(format!("else:{f}"))),
        );
        assert_eq!(log.lock().unwrap().as_slice(), ["else:stopped"]);
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    // -- demote ----------------------------------------------------------------

    #[test]
    fn demote_moves_success_to_else() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let l1 = Arc::clone(&log);
        Cont::<(), &'static str, i32>::of(7)
            .demote(|n| if n > 5 { "too big" } else { "too small" })
            .then_absurd::<i32>()
            .run(
                (),
                RunCallbacks::new().on_else(move |f: &str| l1.lock().unwrap().push(f.to_string())),
            );
        assert_eq!(log.lock().unwrap().as_slice(), ["too big"]);
    }
}
