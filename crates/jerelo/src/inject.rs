//! Environment injection: feed one computation's outcome to another as its
//! environment.
//!
//! `then_inject` pipes a success into a computation whose environment type is
//! that success; `else_inject` does the same with a typed failure. The
//! reverse forms flip which operand is "outer".

use crate::cont::Cont;
use crate::observer::Observer;
use crate::value::Value;

impl<E, F, A> Cont<E, F, A>
where
    E: Value,
    F: Value,
    A: Value,
{
    /// Run `inner` with this computation's success as its environment.
    ///
    /// Behaves like `then_do(|a| inner.with_env(a))`, except the environment
    /// replacement crosses environment types.
    pub fn then_inject<B>(self, inner: Cont<A, F, B>) -> Cont<E, F, B>
    where
        B: Value,
    {
        Cont::from_run(move |rt, obs: Observer<F, B>| {
            let rt2 = rt.clone();
            let inner = inner.clone();
            let downstream = obs.clone();
            let upstream = obs.with_on_then(move |value: A| {
                if rt2.is_cancelled() {
                    return;
                }
                let inner_rt = rt2.with_env(value);
                inner.run_raw(&inner_rt, downstream.clone());
            });
            self.run_raw(rt, upstream);
        })
    }

    /// Run `inner` with this computation's typed failure as its environment.
    pub fn else_inject<F2>(self, inner: Cont<F, F2, A>) -> Cont<E, F2, A>
    where
        F2: Value,
    {
        Cont::from_run(move |rt, obs: Observer<F2, A>| {
            let rt2 = rt.clone();
            let inner = inner.clone();
            let downstream = obs.clone();
            let upstream = obs.with_on_else(move |error: F| {
                if rt2.is_cancelled() {
                    return;
                }
                let inner_rt = rt2.with_env(error);
                inner.run_raw(&inner_rt, downstream.clone());
            });
            self.run_raw(rt, upstream);
        })
    }

    /// Reverse of [`Cont::then_inject`]: use `outer`'s success as this
    /// computation's environment.
    pub fn injected_by_then<E0>(self, outer: Cont<E0, F, E>) -> Cont<E0, F, A>
    where
        E0: Value,
    {
        outer.then_inject(self)
    }

    /// Reverse of [`Cont::else_inject`]: use `outer`'s typed failure as this
    /// computation's environment.
    pub fn injected_by_else<E0>(self, outer: Cont<E0, E, A>) -> Cont<E0, F, A>
    where
        E0: Value,
    {
        outer.else_inject(self)
    }
}

// =============================================================================
// Tests
// =============================================================================
