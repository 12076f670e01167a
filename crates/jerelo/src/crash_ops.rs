//! Operators over the crash channel.
//!
//! Crashes carry no type parameter, so recovery routes back into the typed
//! channels instead of re-typing the crash. The tap variant follows the
//! recovery-flavoured contract: a side computation that succeeds recovers the
//! pipeline, one that fails leaves the original crash in place.

use std::sync::Arc;

use crate::cont::Cont;
use crate::crash::{Crash, trap};
use crate::driver::{ContinueOrStop, loop_cont};
use crate::observer::Observer;
use crate::outcome::Outcome;
use crate::value::Value;

impl<E, F, A> Cont<E, F, A>
where
    E: Value,
    F: Value,
    A: Value,
{
    /// Recover: on a crash, run the computation produced by `k`.
    ///
    /// A panic in `k` becomes a fresh crash replacing the original.
    pub fn crash_do(
        self,
        k: impl Fn(Crash) -> Cont<E, F, A> + Send + Sync + 'static,
    ) -> Cont<E, F, A> {
        let k = Arc::new(k);
        Cont::from_run(move |rt, obs: Observer<F, A>| {
            let rt2 = rt.clone();
            let k = Arc::clone(&k);
            let downstream = obs.clone();
            let upstream = obs.with_on_crash(move |crash: Crash| {
                if rt2.is_cancelled() {
                    return;
                }
                match trap(|| (*k)(crash)) {
                    Ok(next) => next.run_raw(&rt2, downstream.clone()),
                    Err(second) => downstream.on_crash(second),
                }
            });
            self.run_raw(rt, upstream);
        })
    }

    /// Attempt recovery through a side computation.
    ///
    /// If the side computation succeeds, its outcome recovers the pipeline;
    /// if it fails on either channel, the original crash propagates.
    pub fn crash_tap(
        self,
        k: impl Fn(Crash) -> Cont<E, F, A> + Send + Sync + 'static,
    ) -> Cont<E, F, A> {
        self.crash_do(move |crash| {
            let on_tap_crash = crash.clone();
            let on_tap_else = crash.clone();
            k(crash)
                .crash_do(move |_| Cont::crash(on_tap_crash.clone()))
                .else_do(move |_| Cont::crash(on_tap_else.clone()))
        })
    }

    /// Recover, fusing a failed recovery's crash with the original.
    pub fn crash_zip(
        self,
        k: impl Fn(Crash) -> Cont<E, F, A> + Send + Sync + 'static,
    ) -> Cont<E, F, A> {
        self.crash_do(move |crash| {
            let original = crash.clone();
            k(crash).crash_do(move |second| Cont::crash(Crash::merged(original.clone(), second)))
        })
    }

    /// Fire-and-forget a side computation on crash.
    pub fn crash_fork<B>(
        self,
        k: impl Fn(Crash) -> Cont<E, F, B> + Send + Sync + 'static,
    ) -> Cont<E, F, A>
    where
        B: Value,
    {
        let k = Arc::new(k);
        Cont::from_run(move |rt, obs: Observer<F, A>| {
            let rt2 = rt.clone();
            let k = Arc::clone(&k);
            let downstream = obs.clone();
            let upstream = obs.with_on_crash(move |crash: Crash| {
                if rt2.is_cancelled() {
                    return;
                }
                match trap(|| (*k)(crash.clone())) {
                    Ok(side) => {
                        side.run_raw(&rt2, Observer::ignore());
                        downstream.on_crash(crash);
                    }
                    Err(second) => downstream.on_crash(second),
                }
            });
            self.run_raw(rt, upstream);
        })
    }

    /// Recover into the then channel unless `pred` holds for the crash.
    pub fn crash_unless_then(
        self,
        pred: impl Fn(&Crash) -> bool + Send + Sync + 'static,
        k: impl Fn(Crash) -> Cont<E, F, A> + Send + Sync + 'static,
    ) -> Cont<E, F, A> {
        self.crash_do(move |crash| {
            if pred(&crash) {
                Cont::crash(crash)
            } else {
                k(crash)
            }
        })
    }

    /// Demote the crash to a typed error unless `pred` holds for it.
    pub fn crash_unless_else(
        self,
        pred: impl Fn(&Crash) -> bool + Send + Sync + 'static,
        to_error: impl Fn(Crash) -> F + Send + Sync + 'static,
    ) -> Cont<E, F, A> {
        self.crash_do(move |crash| {
            if pred(&crash) {
                Cont::crash(crash)
            } else {
                Cont::error(to_error(crash))
            }
        })
    }

    /// Recover every crash with a computed value.
    pub fn crash_recover_then(
        self,
        to_value: impl Fn(Crash) -> A + Send + Sync + 'static,
    ) -> Cont<E, F, A> {
        self.crash_do(move |crash| Cont::of(to_value(crash)))
    }

    /// Recover every crash with a constant value.
    pub fn crash_recover_then_with(self, value: A) -> Cont<E, F, A> {
        self.crash_recover_then(move |_| value.clone())
    }

    /// Demote every crash to a computed typed error.
    pub fn crash_recover_else(
        self,
        to_error: impl Fn(Crash) -> F + Send + Sync + 'static,
    ) -> Cont<E, F, A> {
        self.crash_do(move |crash| Cont::error(to_error(crash)))
    }

    /// Demote every crash to a constant typed error.
    pub fn crash_recover_else_with(self, error: F) -> Cont<E, F, A> {
        self.crash_recover_else(move |_| error.clone())
    }

    /// Re-run while `pred` holds for each crash; emit the first crash for
    /// which it does not. `Then` and `Else` leave the loop.
    pub fn crash_while(self, pred: impl Fn(&Crash) -> bool + Send + Sync + 'static) -> Cont<E, F, A> {
        let pred = Arc::new(pred);
        loop_cont(
            self,
            Arc::new(move |outcome: Outcome<F, A>| match outcome {
                Outcome::Crash(crash) => match trap(|| (*pred)(&crash)) {
                    Ok(true) => ContinueOrStop::Continue(()),
                    Ok(false) => ContinueOrStop::Stop(Outcome::Crash(crash)),
                    Err(second) => ContinueOrStop::Stop(Outcome::Crash(second)),
                },
                other => ContinueOrStop::Stop(other),
            }),
        )
    }

    /// Re-run until `pred` holds for a crash.
    pub fn crash_until(self, pred: impl Fn(&Crash) -> bool + Send + Sync + 'static) -> Cont<E, F, A> {
        self.crash_while(move |crash| !pred(crash))
    }

    /// Re-run on every crash, forever. Only `Then`, `Else`, or cancellation
    /// leave the loop.
    pub fn crash_forever(self) -> Cont<E, F, A> {
        loop_cont(
            self,
            Arc::new(|outcome: Outcome<F, A>| match outcome {
                Outcome::Crash(_) => ContinueOrStop::Continue(()),
                other => ContinueOrStop::Stop(other),
            }),
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
