//! Three-channel observers and the single-emission safety wrapper.
//!
//! An [`Observer`] holds one callback per outcome channel. Operators derive
//! new observers by replacing a single callback (`with_on_then` and friends),
//! which is how an outcome is transformed or routed while untouched channels
//! pass through verbatim.
//!
//! The safety wrapper produced by [`Observer::into_safe`] is the contract
//! every `from_run` body relies on:
//!
//! ```text
//! Pending ──(any channel)──► Done
//!    Done ──(any channel)──► dropped
//! ```
//!
//! Before the transition it checks the runtime's cancellation flag (cancelled
//! emissions are dropped), and it invokes the wrapped callback inside a trap:
//! a callback that panics is routed to the runtime's panic sink, never back
//! into the emitter.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::crash::{Crash, trap};
use crate::never::Never;
use crate::runtime::Runtime;

pub(crate) type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Callbacks for the three outcome channels of one computation.
pub struct Observer<F, A> {
    crash_fn: Callback<Crash>,
    else_fn: Callback<F>,
    then_fn: Callback<A>,
}

impl<F, A> Clone for Observer<F, A> {
    fn clone(&self) -> Self {
        Self {
            crash_fn: Arc::clone(&self.crash_fn),
            else_fn: Arc::clone(&self.else_fn),
            then_fn: Arc::clone(&self.then_fn),
        }
    }
}

impl<F, A> Observer<F, A>
where
    F: Send + 'static,
    A: Send + 'static,
{
    /// Observer from three channel callbacks.
    pub fn new(
        on_crash: impl Fn(Crash) + Send + Sync + 'static,
        on_else: impl Fn(F) + Send + Sync + 'static,
        on_then: impl Fn(A) + Send + Sync + 'static,
    ) -> Self {
        Self {
            crash_fn: Arc::new(on_crash),
            else_fn: Arc::new(on_else),
            then_fn: Arc::new(on_then),
        }
    }

    /// Observer that drops every outcome. Used by fire-and-forget runs.
    #[must_use]
    pub fn ignore() -> Self {
        Self::new(|_| {}, |_| {}, |_| {})
    }

    /// Deliver a success on the then channel.
    pub fn on_then(&self, value: A) {
        (*self.then_fn)(value);
    }

    /// Deliver a typed failure on the else channel.
    pub fn on_else(&self, error: F) {
        (*self.else_fn)(error);
    }

    /// Deliver an unexpected failure on the crash channel.
    pub fn on_crash(&self, crash: Crash) {
        (*self.crash_fn)(crash);
    }

    // -- copy-update derivations ----------------------------------------------

    /// Copy with the then callback replaced; the channel type may change.
    pub fn with_on_then<A2>(&self, f: impl Fn(A2) + Send + Sync + 'static) -> Observer<F, A2> {
        Observer {
            crash_fn: Arc::clone(&self.crash_fn),
            else_fn: Arc::clone(&self.else_fn),
            then_fn: Arc::new(f),
        }
    }

    /// Copy with the else callback replaced; the channel type may change.
    pub fn with_on_else<F2>(&self, f: impl Fn(F2) + Send + Sync + 'static) -> Observer<F2, A> {
        Observer {
            crash_fn: Arc::clone(&self.crash_fn),
            else_fn: Arc::new(f),
            then_fn: Arc::clone(&self.then_fn),
        }
    }

    /// Copy with the crash callback replaced.
    pub fn with_on_crash(&self, f: impl Fn(Crash) + Send + Sync + 'static) -> Observer<F, A> {
        Observer {
            crash_fn: Arc::new(f),
            else_fn: Arc::clone(&self.else_fn),
            then_fn: Arc::clone(&self.then_fn),
        }
    }

    // -- Never widening --------------------------------------------------------

    /// Narrow the then channel to `Never`.
    ///
    /// The replacement callback is uninvokable; pairing this observer with a
    /// computation whose then channel is inhabited is ruled out by the types.
    /// On an observer whose channel is already inhabited there is nothing to
    /// widen, so absurd conversions are no-ops at runtime by construction.
    #[must_use]
    pub fn absurd_then(&self) -> Observer<F, Never> {
        self.with_on_then(|never: Never| match never {})
    }

    /// Narrow the else channel to `Never`.
    #[must_use]
    pub fn absurd_else(&self) -> Observer<Never, A> {
        self.with_on_else(|never: Never| match never {})
    }

    // -- safety wrapper --------------------------------------------------------

    /// Wrap into the idempotent single-emission observer used by `from_run`.
    ///
    /// At most one channel callback of the result ever reaches the wrapped
    /// observer; later emissions and emissions after cancellation are dropped.
    /// A wrapped callback that panics is routed to `rt`'s panic sink.
    ///
    /// `from_run` applies this wrapper automatically; it is public for
    /// decorators that build their own delivery paths.
    pub fn into_safe<E>(self, rt: &Runtime<E>) -> Observer<F, A>
    where
        E: Clone + Send + Sync + 'static,
    {
        let done = Arc::new(AtomicBool::new(false));
        Observer {
            crash_fn: guard(rt, &done, Arc::clone(&self.crash_fn)),
            else_fn: guard(rt, &done, Arc::clone(&self.else_fn)),
            then_fn: guard(rt, &done, self.then_fn),
        }
    }
}

fn guard<E, T>(rt: &Runtime<E>, done: &Arc<AtomicBool>, inner: Callback<T>) -> Callback<T>
where
    E: Clone + Send + Sync + 'static,
    T: Send + 'static,
{
    let rt = rt.clone();
    let done = Arc::clone(done);
    Arc::new(move |value: T| {
        if rt.is_cancelled() {
            tracing::trace!(target: "jerelo", "emission dropped: run cancelled");
            return;
        }
        if done.swap(true, Ordering::SeqCst) {
            tracing::trace!(target: "jerelo", "emission dropped: already settled");
            return;
        }
        if let Err(crash) = trap(|| (*inner)(value)) {
            rt.panic(crash);
        }
    })
}

// =============================================================================
// Tests
// =============================================================================
