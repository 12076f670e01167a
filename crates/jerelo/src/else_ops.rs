//! Operators over the else (typed failure) channel.
//!
//! Mirrors of the then-channel family: `Then` and `Crash` pass through
//! verbatim, and the typed error may change type along the way.

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
    /// Recover: on a typed failure, run the computation produced by `k`.
    ///
    /// The error type may change; a panic in `k` becomes a crash.
    pub fn else_do<F2>(
        self,
        k: impl Fn(F) -> Cont<E, F2, A> + Send + Sync + 'static,
    ) -> Cont<E, F2, A>
    where
        F2: Value,
    {
        let k = Arc::new(k);
        Cont::from_run(move |rt, obs: Observer<F2, A>| {
            let rt2 = rt.clone();
            let k = Arc::clone(&k);
            let downstream = obs.clone();
            let upstream = obs.with_on_else(move |error: F| {
                if rt2.is_cancelled() {
                    return;
                }
                match trap(|| (*k)(error)) {
                    Ok(next) => next.run_raw(&rt2, downstream.clone()),
                    Err(crash) => downstream.on_crash(crash),
                }
            });
            self.run_raw(rt, upstream);
        })
    }

    /// Map the typed error.
    pub fn else_map<F2>(self, f: impl Fn(F) -> F2 + Send + Sync + 'static) -> Cont<E, F2, A>
    where
        F2: Value,
    {
        let f = Arc::new(f);
        Cont::from_run(move |rt, obs: Observer<F2, A>| {
            let rt2 = rt.clone();
            let f = Arc::clone(&f);
            let downstream = obs.clone();
            let upstream = obs.with_on_else(move |error: F| {
                if rt2.is_cancelled() {
                    return;
                }
                match trap(|| (*f)(error)) {
                    Ok(mapped) => downstream.on_else(mapped),
                    Err(crash) => downstream.on_crash(crash),
                }
            });
            self.run_raw(rt, upstream);
        })
    }

    /// Replace the typed error with a constant.
    pub fn else_map_to<F2>(self, error: F2) -> Cont<E, F2, A>
    where
        F2: Value,
    {
        self.else_map(move |_| error.clone())
    }

    /// Side computation on failure, keeping the original error.
    ///
    /// A side computation that succeeds leaves the original error in place; a
    /// side computation that fails replaces it (same error type) or crashes.
    pub fn else_tap<B>(self, k: impl Fn(F) -> Cont<E, F, B> + Send + Sync + 'static) -> Cont<E, F, A>
    where
        B: Value,
    {
        self.else_do(move |error| {
            let original = error.clone();
            k(error).then_do(move |_| Cont::error(original.clone()))
        })
    }

    /// Recover and keep both errors paired when recovery also fails.
    pub fn else_zip<F2>(
        self,
        k: impl Fn(F) -> Cont<E, F2, A> + Send + Sync + 'static,
    ) -> Cont<E, (F, F2), A>
    where
        F2: Value,
    {
        self.else_do(move |error| {
            let first = error.clone();
            k(error).else_map(move |second| (first.clone(), second))
        })
    }

    /// Fire-and-forget a side computation on failure.
    pub fn else_fork<B>(self, k: impl Fn(F) -> Cont<E, F, B> + Send + Sync + 'static) -> Cont<E, F, A>
    where
        B: Value,
    {
        let k = Arc::new(k);
        Cont::from_run(move |rt, obs: Observer<F, A>| {
            let rt2 = rt.clone();
            let k = Arc::clone(&k);
            let downstream = obs.clone();
            let upstream = obs.with_on_else(move |error: F| {
                if rt2.is_cancelled() {
                    return;
                }
                match trap(|| (*k)(error.clone())) {
                    Ok(side) => {
                        side.run_raw(&rt2, Observer::ignore());
                        downstream.on_else(error);
                    }
                    Err(crash) => downstream.on_crash(crash),
                }
            });
            self.run_raw(rt, upstream);
        })
    }

    /// Recover through `k` unless `pred` holds for the error.
    pub fn else_unless(
        self,
        pred: impl Fn(&F) -> bool + Send + Sync + 'static,
        k: impl Fn(F) -> Cont<E, F, A> + Send + Sync + 'static,
    ) -> Cont<E, F, A> {
        self.else_do(move |error| {
            if pred(&error) {
                Cont::error(error)
            } else {
                k(error)
            }
        })
    }

    /// Re-run while `pred` holds for each typed failure; emit the first
    /// failure for which it does not. `Then` and `Crash` leave the loop.
    pub fn else_while(self, pred: impl Fn(&F) -> bool + Send + Sync + 'static) -> Cont<E, F, A> {
        let pred = Arc::new(pred);
        loop_cont(
            self,
            Arc::new(move |outcome: Outcome<F, A>| match outcome {
                Outcome::Else(error) => match trap(|| (*pred)(&error)) {
                    Ok(true) => ContinueOrStop::Continue(()),
                    Ok(false) => ContinueOrStop::Stop(Outcome::Else(error)),
                    Err(crash) => ContinueOrStop::Stop(Outcome::Crash(crash)),
                },
                other => ContinueOrStop::Stop(other),
            }),
        )
    }

    /// Re-run until `pred` holds for a typed failure.
    pub fn else_until(self, pred: impl Fn(&F) -> bool + Send + Sync + 'static) -> Cont<E, F, A> {
        self.else_while(move |error| !pred(error))
    }

    /// Re-run on every typed failure, forever. Retry semantics: only `Then`,
    /// `Crash`, or cancellation leave the loop.
    pub fn else_forever(self) -> Cont<E, Never, A> {
        loop_cont(
            self,
            Arc::new(|outcome: Outcome<F, A>| match outcome {
                Outcome::Else(_) => ContinueOrStop::Continue(()),
                Outcome::Then(a) => ContinueOrStop::Stop(Outcome::Then(a)),
                Outcome::Crash(c) => ContinueOrStop::Stop(Outcome::Crash(c)),
            }),
        )
    }

    /// Move typed failures onto the then channel.
    pub fn promote(self, to_value: impl Fn(F) -> A + Send + Sync + 'static) -> Cont<E, Never, A> {
        let to_value = Arc::new(to_value);
        Cont::from_run(move |rt, obs: Observer<Never, A>| {
            let rt2 = rt.clone();
            let to_value = Arc::clone(&to_value);
            let downstream = obs.clone();
            let upstream = obs.with_on_else(move |error: F| {
                if rt2.is_cancelled() {
                    return;
                }
                match trap(|| (*to_value)(error)) {
                    Ok(value) => downstream.on_then(value),
                    Err(crash) => downstream.on_crash(crash),
                }
            });
            self.run_raw(rt, upstream);
        })
    }
}

impl<E, A> Cont<E, Never, A>
where
    E: Value,
    A: Value,
{
    /// Widen an uninhabited else channel to any error type.
    pub fn else_absurd<G>(self) -> Cont<E, G, A>
    where
        G: Value,
    {
        Cont::from_run(move |rt, obs: Observer<G, A>| {
            self.run_raw(rt, obs.absurd_else());
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
